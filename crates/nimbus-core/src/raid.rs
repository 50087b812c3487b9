//! Six-part erasure-coded download reassembly.
//!
//! A RAID file is striped over six storage parts in 16-byte sectors: each
//! 80-byte line holds five data sectors (parts 1..=5) plus one XOR parity
//! sector (part 0). Any five parts reconstruct the line, so one slow or
//! failed source can be dropped without losing the download.
//!
//! This module is pure state: it consumes per-part byte streams and yields
//! contiguous file-space output, leaving HTTP and scheduling to the slot.

use tracing::{debug, warn};

use crate::chunk::chunkfloor;

pub const RAIDPARTS: usize = 6;
pub const RAIDSECTOR: i64 = 16;
pub const RAIDLINE: i64 = 80;

/// Scheduling answer for one part's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartRange {
    /// Fetch this part-space byte range next.
    Range(i64, i64),
    /// The part is far enough ahead of reassembly; ask again later.
    Pause,
    /// Nothing left to fetch for this part.
    Done,
}

/// Size of this raid part in bytes for a file of `file_size`.
///
/// The residual bytes of a final partial line distribute sector-by-sector
/// across the data parts; the parity part mirrors the first data part.
pub fn raid_part_size(part: usize, file_size: i64) -> i64 {
    let r = file_size % RAIDLINE;
    let t = (r - (part as i64 - i64::from(part != 0)) * RAIDSECTOR).clamp(0, RAIDSECTOR);
    (file_size - r) / (RAIDPARTS as i64 - 1) + t
}

struct RaidPart {
    /// Part-space offset of the next byte to request.
    req_pos: i64,
    /// Part-space offset of `recv[0]`.
    recv_start: i64,
    recv: Vec<u8>,
    started: bool,
    received_any: bool,
}

pub struct RaidBuffer {
    file_size: i64,
    parts: Vec<RaidPart>,
    /// File-space offset of the next output piece.
    out_pos: i64,
    /// Combined bytes at `out_pos` awaiting emission.
    pending: Vec<u8>,
    /// Next stripe line to combine.
    next_line: i64,
    /// The one part this transfer has permanently abandoned, if any.
    unused_part: Option<usize>,
    /// Per-request size in part space, sector aligned.
    request_size: i64,
}

impl RaidBuffer {
    pub fn new(file_size: i64, max_request_size: i64, resume_pos: i64) -> Self {
        debug_assert!(resume_pos % RAIDLINE == 0, "resume must be line aligned");
        let request_size =
            (max_request_size / (RAIDPARTS as i64 - 1)).clamp(4 * RAIDSECTOR, 4 << 20)
                / RAIDSECTOR
                * RAIDSECTOR;
        let start_line = resume_pos / RAIDLINE;
        let parts = (0..RAIDPARTS)
            .map(|_| RaidPart {
                req_pos: start_line * RAIDSECTOR,
                recv_start: start_line * RAIDSECTOR,
                recv: Vec::new(),
                started: false,
                received_any: false,
            })
            .collect();
        Self {
            file_size,
            parts,
            out_pos: resume_pos,
            pending: Vec::new(),
            next_line: start_line,
            unused_part: None,
            request_size,
        }
    }

    pub fn unused_part(&self) -> Option<usize> {
        self.unused_part
    }

    fn total_lines(&self) -> i64 {
        (self.file_size + RAIDLINE - 1) / RAIDLINE
    }

    fn part_data_end(&self, p: usize) -> i64 {
        self.parts[p].recv_start + self.parts[p].recv.len() as i64
    }

    fn part_complete(&self, p: usize) -> bool {
        self.part_data_end(p) >= raid_part_size(p, self.file_size)
    }

    /// Lines beyond the combine frontier this part can contribute,
    /// clamped to the end of the file.
    fn lines_avail(&self, p: usize) -> i64 {
        let cap = self.total_lines() - self.next_line;
        if Some(p) == self.unused_part {
            return 0;
        }
        if self.part_complete(p) {
            return cap;
        }
        (self.part_data_end(p) / RAIDSECTOR - self.next_line).clamp(0, cap)
    }

    /// The scheduler's next byte range for part `i`'s connection.
    pub fn next_part_range(&mut self, i: usize) -> PartRange {
        if Some(i) == self.unused_part {
            return PartRange::Done;
        }
        let part_size = raid_part_size(i, self.file_size);
        let pos = self.parts[i].req_pos;
        if pos >= part_size {
            return PartRange::Done;
        }
        if pos - self.next_line * RAIDSECTOR >= 4 * self.request_size {
            return PartRange::Pause;
        }
        let mut end = (pos + self.request_size).min(part_size);
        if end < part_size {
            end = end / RAIDSECTOR * RAIDSECTOR;
        }
        self.parts[i].req_pos = end;
        self.parts[i].started = true;
        PartRange::Range(pos, end)
    }

    /// Feed received bytes for part `i` starting at part offset `pos`.
    /// Data for lines already bridged via parity is silently dropped.
    /// With `rewind`, the scheduling frontier is pulled back to the end of
    /// this data (salvage of a partially received request).
    pub fn submit_part_data(&mut self, i: usize, pos: i64, data: &[u8], rewind: bool) {
        let part = &mut self.parts[i];
        let expected = part.recv_start + part.recv.len() as i64;
        debug_assert!(pos <= expected, "part data must arrive in order");
        if !data.is_empty() {
            part.received_any = true;
        }
        if rewind {
            part.req_pos = pos + data.len() as i64;
        }
        let stale = (expected - pos).max(0) as usize;
        if stale < data.len() {
            part.recv.extend_from_slice(&data[stale..]);
        }
        self.combine();
    }

    /// Abandon part `failed` and reassemble from the other five. Only one
    /// part may ever be abandoned; a second distinct failure is fatal.
    pub fn try_recovery(&mut self, failed: usize) -> bool {
        match self.unused_part {
            Some(u) if u == failed => true,
            Some(_) => {
                warn!("raid transfer failed, too many part errors");
                false
            }
            None => {
                debug!("abandoning raid part {failed}, using the other 5");
                self.discard_part(failed);
                self.unused_part = Some(failed);
                self.combine();
                true
            }
        }
    }

    /// After connection `i` completed a request: if every other part has
    /// produced data and exactly one has produced none, that part is the
    /// slowest source. Marks it abandoned and returns it.
    pub fn detect_slowest_connection(&mut self, i: usize) -> Option<usize> {
        if self.unused_part.is_some() || !self.parts.iter().all(|p| p.started) {
            return None;
        }
        let silent: Vec<usize> = (0..RAIDPARTS)
            .filter(|&p| !self.parts[p].received_any)
            .collect();
        match silent.as_slice() {
            [j] if *j != i => {
                let j = *j;
                debug!("raid part {j} is the slowest to reply, using the other 5");
                self.discard_part(j);
                self.unused_part = Some(j);
                self.combine();
                Some(j)
            }
            _ => None,
        }
    }

    /// Whether reassembly is blocked waiting for part `i` while every
    /// other part has data (or finished) past the frontier.
    pub fn peers_all_waiting_on(&self, i: usize) -> bool {
        if Some(i) == self.unused_part {
            return false;
        }
        if self.next_line >= self.total_lines() {
            return false;
        }
        self.lines_avail(i) == 0
            && (0..RAIDPARTS)
                .filter(|&p| p != i && Some(p) != self.unused_part)
                .all(|p| self.lines_avail(p) > 0)
    }

    /// Reset part `i`'s buffered-but-uncombined data (connection retry).
    pub fn reset_part(&mut self, i: usize) {
        self.discard_part(i);
    }

    fn discard_part(&mut self, i: usize) {
        let part = &mut self.parts[i];
        part.recv.clear();
        part.req_pos = part.recv_start;
        part.received_any = false;
    }

    /// Bytes received or combined but not yet emitted, for progress.
    pub fn buffered(&self) -> i64 {
        self.pending.len() as i64 + self.parts.iter().map(|p| p.recv.len() as i64).sum::<i64>()
    }

    /// Whether the whole file has been combined and emitted.
    pub fn complete(&self) -> bool {
        self.out_pos + self.pending.len() as i64 >= self.file_size && self.pending.is_empty()
    }

    /// Take the next output piece: combined data up to a chunk boundary
    /// (or to end of file), so downstream MAC work never splits a chunk.
    pub fn pop_output(&mut self) -> Option<(i64, Vec<u8>)> {
        let frontier = self.out_pos + self.pending.len() as i64;
        let emit_to = if frontier >= self.file_size {
            self.file_size
        } else {
            chunkfloor(frontier)
        };
        if emit_to <= self.out_pos {
            return None;
        }
        let n = (emit_to - self.out_pos) as usize;
        let buf: Vec<u8> = self.pending.drain(..n).collect();
        let pos = self.out_pos;
        self.out_pos = emit_to;
        Some((pos, buf))
    }

    /// Shutdown flush: emit whatever has been combined, even mid-chunk.
    pub fn pop_output_flush(&mut self) -> Option<(i64, Vec<u8>)> {
        if self.pending.is_empty() {
            return None;
        }
        let buf = std::mem::take(&mut self.pending);
        let pos = self.out_pos;
        self.out_pos = pos + buf.len() as i64;
        Some((pos, buf))
    }

    /// One sector of part `p` at `line`, zero-padded past the part's end.
    fn sector(&self, p: usize, line: i64) -> [u8; RAIDSECTOR as usize] {
        let mut out = [0u8; RAIDSECTOR as usize];
        let part = &self.parts[p];
        let lo = line * RAIDSECTOR;
        let data_end = part.recv_start + part.recv.len() as i64;
        let copy_end = (lo + RAIDSECTOR).min(data_end);
        if copy_end > lo {
            debug_assert!(lo >= part.recv_start);
            let s = (lo - part.recv_start) as usize;
            let e = (copy_end - part.recv_start) as usize;
            out[..e - s].copy_from_slice(&part.recv[s..e]);
        }
        out
    }

    /// Combine every line all five usable parts can serve, appending the
    /// recovered plaintext order to `pending`.
    fn combine(&mut self) {
        loop {
            let cap = self.total_lines() - self.next_line;
            if cap <= 0 {
                break;
            }

            let (skip, nlines) = match self.unused_part {
                Some(u) => {
                    let n = (0..RAIDPARTS)
                        .filter(|&p| p != u)
                        .map(|p| self.lines_avail(p))
                        .min()
                        .unwrap_or(0);
                    (u, n)
                }
                None => {
                    let all = (0..RAIDPARTS).map(|p| self.lines_avail(p)).min().unwrap();
                    if all > 0 {
                        // Every part has the line: parity is redundant.
                        (0, all)
                    } else {
                        // One part lags; bridge it via parity, but only
                        // once it trails by a meaningful amount so normal
                        // jitter doesn't discard the sixth source.
                        let lag = (0..RAIDPARTS)
                            .min_by_key(|&p| self.lines_avail(p))
                            .unwrap();
                        let n = (0..RAIDPARTS)
                            .filter(|&p| p != lag)
                            .map(|p| self.lines_avail(p))
                            .min()
                            .unwrap_or(0);
                        let threshold = (self.request_size / RAIDSECTOR).min(cap);
                        if n < threshold {
                            break;
                        }
                        (lag, n)
                    }
                }
            };
            if nlines <= 0 {
                break;
            }

            for line in self.next_line..self.next_line + nlines {
                let mut out = [0u8; RAIDLINE as usize];
                for s in 0..5usize {
                    let p = s + 1;
                    if p != skip {
                        let sec = self.sector(p, line);
                        out[s * 16..s * 16 + 16].copy_from_slice(&sec);
                    }
                }
                if skip != 0 {
                    // Rebuild the missing data sector from parity.
                    let mut rec = self.sector(0, line);
                    for s in 0..5usize {
                        if s + 1 != skip {
                            let sec: [u8; 16] = out[s * 16..s * 16 + 16].try_into().unwrap();
                            for (r, b) in rec.iter_mut().zip(sec) {
                                *r ^= b;
                            }
                        }
                    }
                    let s = skip - 1;
                    out[s * 16..s * 16 + 16].copy_from_slice(&rec);
                }

                let line_start = line * RAIDLINE;
                let line_len = (self.file_size - line_start).min(RAIDLINE) as usize;
                self.pending.extend_from_slice(&out[..line_len]);
            }
            self.next_line += nlines;
            self.consume();
        }
    }

    /// Drop part bytes below the combine frontier.
    fn consume(&mut self) {
        let cut = self.next_line * RAIDSECTOR;
        for part in &mut self.parts {
            let data_end = part.recv_start + part.recv.len() as i64;
            let part_cut = cut.min(data_end);
            if part_cut > part.recv_start {
                part.recv.drain(..(part_cut - part.recv_start) as usize);
                part.recv_start = part_cut;
            } else if part.recv.is_empty() && part.recv_start < cut {
                part.recv_start = cut;
                part.req_pos = part.req_pos.max(cut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Split `data` into the six raid parts, parity first.
    fn encode_parts(data: &[u8]) -> Vec<Vec<u8>> {
        let size = data.len() as i64;
        let mut parts = vec![Vec::new(); RAIDPARTS];
        let lines = (size + RAIDLINE - 1) / RAIDLINE;
        for line in 0..lines {
            let mut parity = [0u8; 16];
            for s in 0..5usize {
                let lo = (line * RAIDLINE + s as i64 * RAIDSECTOR).min(size) as usize;
                let hi = (line * RAIDLINE + (s as i64 + 1) * RAIDSECTOR).min(size) as usize;
                let mut sec = [0u8; 16];
                sec[..hi - lo].copy_from_slice(&data[lo..hi]);
                for (p, b) in parity.iter_mut().zip(sec) {
                    *p ^= b;
                }
                parts[s + 1].extend_from_slice(&data[lo..hi]);
            }
            parts[0].extend_from_slice(&parity);
        }
        // Parity mirrors part 1's length.
        let p1 = parts[1].len();
        parts[0].truncate(p1);
        parts
    }

    fn test_data(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn drain_all(buf: &mut RaidBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        let mut expect = 0;
        while let Some((pos, data)) = buf.pop_output() {
            assert_eq!(pos, expect, "output must be contiguous");
            expect = pos + data.len() as i64;
            out.extend_from_slice(&data);
        }
        out
    }

    #[test]
    fn part_sizes_sum_to_file_size() {
        for size in [0i64, 1, 16, 79, 80, 100, 131072, 1_000_000, 5 * 131072 + 7] {
            let data_total: i64 = (1..RAIDPARTS).map(|p| raid_part_size(p, size)).sum();
            assert_eq!(data_total, size, "size = {size}");
            assert_eq!(
                raid_part_size(0, size),
                raid_part_size(1, size),
                "parity mirrors part 1 for size {size}"
            );
        }
    }

    #[test]
    fn encode_matches_part_size() {
        let data = test_data(100_000);
        let parts = encode_parts(&data);
        for (p, bytes) in parts.iter().enumerate() {
            assert_eq!(bytes.len() as i64, raid_part_size(p, data.len() as i64));
        }
    }

    #[test]
    fn reassembles_from_all_six() {
        let data = test_data(400_000);
        let parts = encode_parts(&data);
        let mut buf = RaidBuffer::new(data.len() as i64, 1 << 20, 0);

        for p in 0..RAIDPARTS {
            while let PartRange::Range(a, b) = buf.next_part_range(p) {
                let bytes = parts[p][a as usize..b as usize].to_vec();
                buf.submit_part_data(p, a, &bytes, false);
            }
        }
        assert_eq!(drain_all(&mut buf), data);
        assert!(buf.complete());
    }

    #[test]
    fn reassembles_with_one_part_abandoned() {
        let data = test_data(200_000);
        let size = data.len() as i64;
        let parts = encode_parts(&data);

        for failed in 0..RAIDPARTS {
            let mut buf = RaidBuffer::new(size, 1 << 20, 0);
            assert!(buf.try_recovery(failed));
            for p in 0..RAIDPARTS {
                loop {
                    match buf.next_part_range(p) {
                        PartRange::Range(a, b) => {
                            let bytes = parts[p][a as usize..b as usize].to_vec();
                            buf.submit_part_data(p, a, &bytes, false);
                        }
                        PartRange::Done => break,
                        PartRange::Pause => unreachable!("abandon keeps frontier moving"),
                    }
                }
            }
            assert_eq!(drain_all(&mut buf), data, "failed part {failed}");
        }
    }

    #[test]
    fn second_distinct_failure_is_fatal() {
        let mut buf = RaidBuffer::new(80_000, 1 << 20, 0);
        assert!(buf.try_recovery(2));
        assert!(buf.try_recovery(2), "same part again is tolerated");
        assert!(!buf.try_recovery(4));
    }

    #[test]
    fn bridges_one_lagging_part_via_parity() {
        let data = test_data(160_000);
        let size = data.len() as i64;
        let parts = encode_parts(&data);
        let mut buf = RaidBuffer::new(size, 1 << 20, 0);

        // Five parts deliver fully; part 3 never sends a byte.
        for p in (0..RAIDPARTS).filter(|&p| p != 3) {
            while let PartRange::Range(a, b) = buf.next_part_range(p) {
                let bytes = parts[p][a as usize..b as usize].to_vec();
                buf.submit_part_data(p, a, &bytes, false);
            }
        }
        // Parity bridging recovers everything without part 3.
        assert_eq!(drain_all(&mut buf), data);
    }

    #[test]
    fn detect_slowest_flags_the_silent_part() {
        let data = test_data(100_000);
        let size = data.len() as i64;
        let parts = encode_parts(&data);
        let mut buf = RaidBuffer::new(size, 1 << 20, 0);

        // All six start; only part 4 stays silent.
        let mut first_ranges = Vec::new();
        for p in 0..RAIDPARTS {
            match buf.next_part_range(p) {
                PartRange::Range(a, b) => first_ranges.push((p, a, b)),
                r => panic!("expected range, got {r:?}"),
            }
        }
        for &(p, a, b) in &first_ranges {
            if p != 4 {
                let bytes = parts[p][a as usize..b as usize].to_vec();
                buf.submit_part_data(p, a, &bytes, false);
            }
        }

        assert_eq!(buf.detect_slowest_connection(0), Some(4));
        assert_eq!(buf.unused_part(), Some(4));
        // Detection used up the one allowed abandon.
        assert!(!buf.try_recovery(1));
    }

    #[test]
    fn no_detection_while_two_parts_silent() {
        let data = test_data(100_000);
        let parts = encode_parts(&data);
        let mut buf = RaidBuffer::new(data.len() as i64, 1 << 20, 0);
        for p in 0..RAIDPARTS {
            if let PartRange::Range(a, b) = buf.next_part_range(p) {
                if p != 2 && p != 4 {
                    let bytes = parts[p][a as usize..b as usize].to_vec();
                    buf.submit_part_data(p, a, &bytes, false);
                }
            }
        }
        assert_eq!(buf.detect_slowest_connection(0), None);
    }

    #[test]
    fn peers_waiting_identifies_the_stall() {
        let data = test_data(100_000);
        let parts = encode_parts(&data);
        let mut buf = RaidBuffer::new(data.len() as i64, 1 << 20, 0);
        for p in 0..RAIDPARTS {
            if let PartRange::Range(a, _) = buf.next_part_range(p) {
                if p != 5 {
                    // Only a little data from each peer: below the parity
                    // bridging threshold, so reassembly genuinely stalls.
                    buf.submit_part_data(p, a, &parts[p][..1600], false);
                }
            }
        }
        assert!(buf.peers_all_waiting_on(5));
        assert!(!buf.peers_all_waiting_on(1));
    }

    #[test]
    fn read_ahead_pauses_a_runaway_part() {
        let data = test_data(4 << 20);
        let mut buf = RaidBuffer::new(data.len() as i64, 1 << 20, 0);
        // Part 1 keeps requesting without anyone else delivering.
        let mut got_pause = false;
        for _ in 0..64 {
            match buf.next_part_range(1) {
                PartRange::Range(_, _) => {}
                PartRange::Pause => {
                    got_pause = true;
                    break;
                }
                PartRange::Done => break,
            }
        }
        assert!(got_pause);
    }

    #[test]
    fn resume_from_line_aligned_position() {
        let data = test_data(320_000);
        let size = data.len() as i64;
        let parts = encode_parts(&data);

        // Chunk boundaries are not line-aligned (131072 % 80 != 0), so a
        // restart rounds down to the stripe line below the boundary.
        let resume = 131072 / RAIDLINE * RAIDLINE;
        let mut buf = RaidBuffer::new(size, 1 << 20, resume);
        for p in 0..RAIDPARTS {
            while let PartRange::Range(a, b) = buf.next_part_range(p) {
                let bytes = parts[p][a as usize..b as usize].to_vec();
                buf.submit_part_data(p, a, &bytes, false);
            }
        }
        let mut out = Vec::new();
        let mut expect = resume;
        while let Some((pos, piece)) = buf.pop_output() {
            assert_eq!(pos, expect);
            expect = pos + piece.len() as i64;
            out.extend_from_slice(&piece);
        }
        assert_eq!(out, &data[resume as usize..]);
    }

    #[test]
    fn flush_emits_mid_chunk_remainder() {
        let data = test_data(200_000);
        let size = data.len() as i64;
        let parts = encode_parts(&data);
        let mut buf = RaidBuffer::new(size, 1 << 20, 0);

        // Deliver 20 lines from every part: combinable, but well short of
        // the first chunk boundary.
        for p in 0..RAIDPARTS {
            if let PartRange::Range(a, _) = buf.next_part_range(p) {
                buf.submit_part_data(p, a, &parts[p][..320], false);
            }
        }
        assert!(buf.pop_output().is_none(), "no chunk boundary reached yet");
        let (pos, piece) = buf.pop_output_flush().expect("combined lines to flush");
        assert_eq!(pos, 0);
        assert_eq!(piece.len(), 1600);
        assert_eq!(&piece[..], &data[..1600]);
    }

    #[test]
    fn salvage_rewinds_the_request_frontier() {
        let data = test_data(100_000);
        let parts = encode_parts(&data);
        let mut buf = RaidBuffer::new(data.len() as i64, 1 << 20, 0);

        let PartRange::Range(a, b) = buf.next_part_range(1) else {
            panic!("expected range");
        };
        // Only half the range arrived before the connection failed.
        let keep = ((b - a) / 2 / RAIDSECTOR * RAIDSECTOR) as usize;
        buf.submit_part_data(1, a, &parts[1][a as usize..a as usize + keep], true);

        // The next range continues right after the salvaged bytes.
        match buf.next_part_range(1) {
            PartRange::Range(next, _) => assert_eq!(next, a + keep as i64),
            r => panic!("expected range, got {r:?}"),
        }
    }
}
