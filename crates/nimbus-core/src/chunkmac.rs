//! Per-chunk MAC bookkeeping.
//!
//! Ordered map from chunk start offset to the chunk's CBC-MAC chain state.
//! An entry whose `finished` flag is false holds the intermediate state of a
//! chunk that has only been processed up to `offset` bytes; finalizing the
//! remainder resumes from that state.

use std::collections::btree_map::{self, BTreeMap};

use nimbus_crypto::{condense_mac, TransferCipher, BLOCK_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMac {
    pub mac: [u8; BLOCK_LEN],
    /// Bytes of the chunk folded into `mac` so far.
    pub offset: i64,
    pub finished: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMacMap {
    map: BTreeMap<i64, ChunkMac>,
}

impl ChunkMacMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pos: i64, entry: ChunkMac) {
        self.map.insert(pos, entry);
    }

    pub fn get(&self, pos: i64) -> Option<&ChunkMac> {
        self.map.get(&pos)
    }

    pub fn contains(&self, pos: i64) -> bool {
        self.map.contains_key(&pos)
    }

    pub fn mark_finished(&mut self, pos: i64) {
        if let Some(e) = self.map.get_mut(&pos) {
            e.finished = true;
        }
    }

    pub fn finished_at(&self, pos: i64) -> bool {
        self.map.get(&pos).is_some_and(|e| e.finished)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Entries in ascending chunk-offset order.
    pub fn iter(&self) -> btree_map::Iter<'_, i64, ChunkMac> {
        self.map.iter()
    }

    /// Copy one entry into `dst`, if present. Used to seed a piece-local
    /// map with the chain state of a partially processed chunk.
    pub fn copy_entry_to(&self, pos: i64, dst: &mut ChunkMacMap) {
        if let Some(e) = self.map.get(&pos) {
            dst.insert(pos, *e);
        }
    }

    /// Merge a connection-local upload map in, marking every entry
    /// finished. Upload requests are chunk-aligned, so the incoming
    /// entries always cover whole chunks.
    pub fn finished_upload_chunks(&mut self, other: &ChunkMacMap) {
        for (&pos, e) in other.iter() {
            let mut e = *e;
            e.finished = true;
            self.map.insert(pos, e);
        }
    }

    /// Merge a downloaded piece's entries after its bytes were durably
    /// written. Entries (finished or partial) overwrite ours: the piece's
    /// chain state is always at least as advanced.
    pub fn merge_written(&mut self, other: &ChunkMacMap) {
        for (&pos, e) in other.iter() {
            if let Some(prev) = self.map.get(&pos) {
                debug_assert!(prev.offset <= e.offset, "chunk MAC merged out of order");
            }
            self.map.insert(pos, *e);
        }
    }

    /// The file-wide mac-of-macs: fold every chunk MAC in offset order
    /// into a zero accumulator, condensing to 64 bits at the end.
    pub fn macsmac(&self, cipher: &TransferCipher) -> i64 {
        let mut acc = [0u8; BLOCK_LEN];
        for e in self.map.values() {
            cipher.fold_mac(&mut acc, &e.mac);
        }
        condense_mac(&acc)
    }

    /// `macsmac` with the entries whose *index* lies in `[a,b)` or
    /// `[c,d)` left out. Used to probe for MACs recorded by a buggy
    /// uploader that dropped late entries.
    pub fn macsmac_gaps(
        &self,
        cipher: &TransferCipher,
        a: usize,
        b: usize,
        c: usize,
        d: usize,
    ) -> i64 {
        let mut acc = [0u8; BLOCK_LEN];
        for (idx, e) in self.map.values().enumerate() {
            if (idx >= a && idx < b) || (idx >= c && idx < d) {
                continue;
            }
            cipher.fold_mac(&mut acc, &e.mac);
        }
        condense_mac(&acc)
    }
}
