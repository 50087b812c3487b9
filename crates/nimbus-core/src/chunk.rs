//! Chunk boundary geometry.
//!
//! Chunk sizes grow arithmetically from 128 KiB in 128 KiB steps until they
//! plateau at 1 MiB, so the k-th boundary is `k*(k+1)/2 * 131072` for
//! `k <= 8` and advances in whole MiB after that. The boundaries are a wire
//! contract: per-chunk MACs are anchored to them, so every implementation
//! must produce identical positions.

/// Arithmetic growth step (and the first chunk's size).
pub const SEG_SIZE: i64 = 131072;

/// Plateau chunk size: 8 * SEG_SIZE.
pub const MAX_CHUNK_SIZE: i64 = 8 * SEG_SIZE;

/// Sum of the eight growing chunks; boundaries beyond this are MiB-aligned
/// relative to it.
const RAMP_END: i64 = 36 * SEG_SIZE;

/// First chunk boundary strictly greater than `pos`, clamped to `size`.
pub fn chunkceil(pos: i64, size: i64) -> i64 {
    debug_assert!(pos >= 0);
    let mut np = 0;
    for k in 1..=8 {
        np += k * SEG_SIZE;
        if pos < np {
            return np.min(size);
        }
    }
    let over = pos - RAMP_END;
    let boundary = RAMP_END + (over / MAX_CHUNK_SIZE + 1) * MAX_CHUNK_SIZE;
    boundary.min(size)
}

/// Greatest chunk boundary less than or equal to `pos`.
pub fn chunkfloor(pos: i64) -> i64 {
    debug_assert!(pos >= 0);
    let mut cp = 0;
    let mut np = 0;
    for k in 1..=8 {
        np += k * SEG_SIZE;
        if pos < np {
            return cp;
        }
        cp = np;
    }
    RAMP_END + (pos - RAMP_END) / MAX_CHUNK_SIZE * MAX_CHUNK_SIZE
}
