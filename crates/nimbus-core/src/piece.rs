//! A contiguous run of file bytes moving through the pipeline.
//!
//! Pieces are shared between the scheduler thread and crypto workers: the
//! worker finalizes (en/decrypts and MACs) the payload and flips the
//! `finalized` flag; the scheduler observes the flag on its next tick, and
//! the shutdown flush can block on it with a timeout.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use nimbus_crypto::TransferCipher;

use crate::chunk::{chunkceil, chunkfloor};
use crate::chunkmac::{ChunkMac, ChunkMacMap};

pub struct FilePiece {
    pos: i64,
    len: usize,
    inner: Mutex<PieceInner>,
    done: Condvar,
}

struct PieceInner {
    buf: Vec<u8>,
    chunk_macs: ChunkMacMap,
    finalized: bool,
}

impl FilePiece {
    pub fn new(pos: i64, buf: Vec<u8>) -> Self {
        let len = buf.len();
        Self {
            pos,
            len,
            inner: Mutex::new(PieceInner {
                buf,
                chunk_macs: ChunkMacMap::new(),
                finalized: false,
            }),
            done: Condvar::new(),
        }
    }

    pub fn pos(&self) -> i64 {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> i64 {
        self.pos + self.len as i64
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.lock().unwrap().finalized
    }

    /// Block until the piece is finalized, at most `timeout`.
    /// Returns whether it finished in time.
    pub fn wait_finalized(&self, timeout: Duration) -> bool {
        let guard = self.inner.lock().unwrap();
        let (guard, res) = self
            .done
            .wait_timeout_while(guard, timeout, |st| !st.finalized)
            .unwrap();
        drop(guard);
        !res.timed_out()
    }

    /// Import the chain state of every chunk this piece touches, from the
    /// transfer's map. Must be called before the piece is handed to a
    /// worker.
    pub fn seed_chunk_state(&self, source: &ChunkMacMap, file_size: i64) {
        let mut st = self.inner.lock().unwrap();
        let end = self.pos + st.buf.len() as i64;
        let mut s = chunkfloor(self.pos);
        while s < end {
            source.copy_entry_to(s, &mut st.chunk_macs);
            s = chunkceil(s, file_size);
        }
    }

    /// Read access to the payload bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.lock().unwrap().buf)
    }

    /// Move the payload bytes out (upload path: the ciphertext becomes the
    /// request body).
    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().buf)
    }

    /// Snapshot of the piece's chunk MAC entries.
    pub fn chunk_macs(&self) -> ChunkMacMap {
        self.inner.lock().unwrap().chunk_macs.clone()
    }

    /// Decrypt the payload in place and advance the MAC chain of every
    /// chunk the piece touches. Chunks the piece only partially covers end
    /// up as unfinished entries carrying intermediate chain state.
    pub fn finalize_download(&self, cipher: &TransferCipher, ctriv: u64, file_size: i64) {
        let mut st = self.inner.lock().unwrap();
        if st.finalized {
            return;
        }
        let pos = self.pos;
        cipher.ctr_crypt(&mut st.buf, pos as u64, ctriv);
        Self::mac_span(&mut st, cipher, ctriv, pos, file_size);
        st.finalized = true;
        drop(st);
        self.done.notify_all();
    }

    /// Upload counterpart: MAC the plaintext, then encrypt in place.
    /// Upload ranges are chunk-aligned, so every entry comes out whole.
    pub fn finalize_upload(&self, cipher: &TransferCipher, ctriv: u64, file_size: i64) {
        let mut st = self.inner.lock().unwrap();
        if st.finalized {
            return;
        }
        let pos = self.pos;
        Self::mac_span(&mut st, cipher, ctriv, pos, file_size);
        cipher.ctr_crypt(&mut st.buf, pos as u64, ctriv);
        st.finalized = true;
        drop(st);
        self.done.notify_all();
    }

    fn mac_span(
        st: &mut PieceInner,
        cipher: &TransferCipher,
        ctriv: u64,
        pos: i64,
        file_size: i64,
    ) {
        let end = pos + st.buf.len() as i64;
        let mut s = pos;
        while s < end {
            let chunk_start = chunkfloor(s);
            let chunk_end = chunkceil(chunk_start, file_size);
            let span_end = chunk_end.min(end);

            // A resumed piece may start below the chunk's MAC frontier
            // (e.g. a RAID restart re-fetches from a stripe boundary):
            // bytes the seeded entry already covers are not re-MACed.
            let entry = st.chunk_macs.get(chunk_start).copied();
            let done = entry.map_or(0, |e| {
                if e.finished {
                    chunk_end - chunk_start
                } else {
                    e.offset
                }
            });
            let resume_at = chunk_start + done;
            if span_end <= resume_at {
                s = span_end;
                continue;
            }
            let mac_from = s.max(resume_at);
            debug_assert_eq!(mac_from, resume_at, "MAC chain gap inside chunk");

            let mut state = match entry {
                Some(e) if done > 0 => e.mac,
                _ => cipher.mac_init(ctriv),
            };
            let lo = (mac_from - pos) as usize;
            let hi = (span_end - pos) as usize;
            cipher.mac_update(&mut state, &st.buf[lo..hi]);

            st.chunk_macs.insert(
                chunk_start,
                ChunkMac {
                    mac: state,
                    offset: span_end - chunk_start,
                    finished: span_end == chunk_end,
                },
            );
            s = span_end;
        }
    }
}
