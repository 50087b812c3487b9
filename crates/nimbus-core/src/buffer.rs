//! Per-slot buffering of in-flight and processed file pieces.
//!
//! The manager owns the temporary URL vector, per-connection scheduling
//! positions, the RAID reassembly state (when the URL vector says the
//! transfer is striped), and the per-connection output queues of pieces
//! waiting to be written or sent.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::chunk::chunkceil;
use crate::piece::FilePiece;
use crate::raid::{PartRange, RaidBuffer, RAIDPARTS};

/// Scheduling answer for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRange {
    /// Byte range to request next (file space, or part space for RAID).
    Range(i64, i64),
    /// RAID read-ahead: this part is far enough ahead, ask again later.
    Pause,
    /// No bytes left to assign to this connection.
    Empty,
}

pub struct TransferBufferManager {
    tempurls: Vec<String>,
    size: i64,
    max_request_size: i64,
    raid: Option<RaidBuffer>,
    /// Non-RAID: next unassigned file offset.
    next_unassigned: i64,
    /// Per-connection end of the last assigned range.
    transfer_pos: Vec<i64>,
    outputs: Vec<VecDeque<Arc<FilePiece>>>,
}

impl TransferBufferManager {
    pub fn new() -> Self {
        Self {
            tempurls: Vec::new(),
            size: 0,
            max_request_size: 0,
            raid: None,
            next_unassigned: 0,
            transfer_pos: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Install the temporary URL vector. Six URLs means a RAID download.
    pub fn set_temp_urls(&mut self, urls: Vec<String>) {
        self.tempurls = urls;
    }

    pub fn has_urls(&self) -> bool {
        !self.tempurls.is_empty()
    }

    pub fn is_raid(&self) -> bool {
        self.tempurls.len() == RAIDPARTS
    }

    /// URL for connection `i`: its part URL for RAID, the single URL
    /// otherwise.
    pub fn tempurl(&self, i: usize) -> &str {
        if self.is_raid() {
            &self.tempurls[i]
        } else {
            &self.tempurls[0]
        }
    }

    /// Size the per-connection state once the connection count is known.
    pub fn configure(
        &mut self,
        connections: usize,
        size: i64,
        resume_pos: i64,
        max_request_size: i64,
    ) {
        self.size = size;
        self.max_request_size = max_request_size;
        self.transfer_pos = vec![resume_pos; connections];
        self.outputs = (0..connections).map(|_| VecDeque::new()).collect();
        if self.is_raid() {
            self.raid = Some(RaidBuffer::new(size, max_request_size, resume_pos));
        } else {
            self.next_unassigned = resume_pos;
        }
    }

    /// Next byte range for connection `i`. Non-RAID ranges start and end
    /// on chunk boundaries and grow in whole chunks until they reach the
    /// request size cap (so they may overshoot it by less than one chunk).
    pub fn next_range(&mut self, i: usize) -> NextRange {
        if let Some(raid) = &mut self.raid {
            return match raid.next_part_range(i) {
                PartRange::Range(a, b) => {
                    self.transfer_pos[i] = b;
                    NextRange::Range(a, b)
                }
                PartRange::Pause => NextRange::Pause,
                PartRange::Done => NextRange::Empty,
            };
        }
        let start = self.next_unassigned;
        if start >= self.size {
            return NextRange::Empty;
        }
        let mut npos = chunkceil(start, self.size);
        while npos < self.size && npos - start < self.max_request_size {
            npos = chunkceil(npos, self.size);
        }
        self.next_unassigned = npos;
        self.transfer_pos[i] = npos;
        NextRange::Range(start, npos)
    }

    pub fn transfer_pos(&self, i: usize) -> i64 {
        self.transfer_pos[i]
    }

    /// Hand an unconsumed non-RAID range back (e.g. a failed local read);
    /// the bytes will be assigned again.
    pub fn rewind_non_raid(&mut self, pos: i64) {
        if self.raid.is_none() {
            self.next_unassigned = self.next_unassigned.min(pos);
        }
    }

    /// Feed received RAID part bytes into reassembly.
    pub fn submit_raid_part(&mut self, i: usize, pos: i64, data: &[u8], rewind: bool) {
        if let Some(raid) = &mut self.raid {
            raid.submit_part_data(i, pos, data, rewind);
        }
    }

    /// Next combined (chunk-aligned) RAID output, if any.
    pub fn pop_combined(&mut self) -> Option<(i64, Vec<u8>)> {
        self.raid.as_mut()?.pop_output()
    }

    /// Shutdown flush: remaining combined bytes regardless of alignment.
    pub fn pop_combined_flush(&mut self) -> Option<(i64, Vec<u8>)> {
        self.raid.as_mut()?.pop_output_flush()
    }

    pub fn push_output(&mut self, i: usize, piece: Arc<FilePiece>) {
        self.outputs[i].push_back(piece);
    }

    /// The piece connection `i` should write next, if one is queued.
    pub fn front_output(&self, i: usize) -> Option<Arc<FilePiece>> {
        self.outputs[i].front().cloned()
    }

    /// Release connection `i`'s current piece after its write settled.
    /// On success the piece is returned so its chunk MACs can be merged;
    /// on failure it is dropped and the bytes will be fetched again on
    /// the next slot.
    pub fn buffer_write_completed(&mut self, i: usize, ok: bool) -> Option<Arc<FilePiece>> {
        let piece = self.outputs[i].pop_front()?;
        ok.then_some(piece)
    }

    /// Bytes buffered in reassembly plus queued output pieces: download
    /// progress that is past the network but not yet on disk.
    pub fn buffered_bytes(&self) -> i64 {
        let raid = self.raid.as_ref().map_or(0, |r| r.buffered());
        let queued: i64 = self
            .outputs
            .iter()
            .flat_map(|q| q.iter())
            .map(|p| p.len() as i64)
            .sum();
        raid + queued
    }

    // -- RAID passthroughs --

    pub fn detect_slowest_raid_connection(&mut self, i: usize) -> Option<usize> {
        self.raid.as_mut()?.detect_slowest_connection(i)
    }

    pub fn try_raid_http_get_error_recovery(&mut self, i: usize) -> bool {
        match &mut self.raid {
            Some(raid) => raid.try_recovery(i),
            None => false,
        }
    }

    pub fn connection_raid_peers_are_all_paused(&self, i: usize) -> bool {
        self.raid.as_ref().is_some_and(|r| r.peers_all_waiting_on(i))
    }

    pub fn reset_raid_part(&mut self, i: usize) {
        if let Some(raid) = &mut self.raid {
            raid.reset_part(i);
        }
    }
}

impl Default for TransferBufferManager {
    fn default() -> Self {
        Self::new()
    }
}
