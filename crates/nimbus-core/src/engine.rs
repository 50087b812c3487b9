//! Transfer engine: owns every queued transfer and active slot.
//!
//! Slot↔transfer links are table indices, cleared on both sides when a
//! slot is destroyed, so nothing dangles. The embedder drives the engine
//! by calling [`TransferEngine::tick`] from its scheduler loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nimbus_types::{NimbusError, Result};
use rand::Rng;
use tracing::{debug, warn};

use crate::cache::deserialize_transfer;
use crate::config::max_request_size_for_memory;
use crate::context::SchedulerContext;
use crate::slot::{SlotOutcome, TransferSlot};
use crate::transfer::{Direction, Transfer, TransferState};

/// Ceiling for the exponential retry backoff.
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(300);

pub struct TransferEngine {
    pub ctx: SchedulerContext,
    transfers: Vec<Option<Transfer>>,
    slots: Vec<Option<TransferSlot>>,
    /// Transfer index driven by each slot.
    slot_transfer: Vec<Option<usize>>,
    /// Earliest next attempt for transfers in backoff or overquota pause.
    retry_at: HashMap<usize, Instant>,
}

impl TransferEngine {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self {
            ctx,
            transfers: Vec::new(),
            slots: Vec::new(),
            slot_transfer: Vec::new(),
            retry_at: HashMap::new(),
        }
    }

    /// Queue a transfer; it activates once temporary URLs are known and a
    /// slot is free.
    pub fn queue(&mut self, transfer: Transfer) -> usize {
        self.transfers.push(Some(transfer));
        self.transfers.len() - 1
    }

    /// Restore a persisted transfer record and queue it for resumption.
    pub fn restore(&mut self, record: &[u8]) -> Result<usize> {
        let mut t = deserialize_transfer(record)?;
        // Scheduled-but-unwritten progress is gone; resume from what the
        // chunk MAC map proves durable.
        let resume = t.resume_pos();
        t.progresscompleted = t.progresscompleted.min(resume);
        t.pos = resume;
        t.state = TransferState::Queued;
        debug!(
            "restored transfer at {}/{} bytes",
            t.progresscompleted, t.size
        );
        Ok(self.queue(t))
    }

    pub fn set_temp_urls(&mut self, idx: usize, urls: Vec<String>) {
        if let Some(Some(t)) = self.transfers.get_mut(idx) {
            t.temp_urls = urls;
        }
    }

    pub fn transfer(&self, idx: usize) -> Option<&Transfer> {
        self.transfers.get(idx)?.as_ref()
    }

    pub fn transfer_mut(&mut self, idx: usize) -> Option<&mut Transfer> {
        self.transfers.get_mut(idx)?.as_mut()
    }

    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// One scheduler pass: activate what can start, then tick every
    /// active slot.
    pub fn tick(&mut self, now: Instant) {
        self.activate_pending(now);

        for si in 0..self.slots.len() {
            if self.slots[si].is_none() {
                continue;
            }
            let Some(ti) = self.slot_transfer[si] else {
                continue;
            };
            let skip = {
                let slot = self.slots[si].as_ref().unwrap();
                slot.retrying && slot.retry_until.is_some_and(|t| now < t)
            };
            if skip {
                continue;
            }
            let outcome = {
                let slot = self.slots[si].as_mut().unwrap();
                let transfer = self.transfers[ti].as_mut().unwrap();
                slot.doio(transfer, &mut self.ctx, now)
            };
            self.handle_outcome(si, ti, outcome, now);
        }
    }

    fn activate_pending(&mut self, now: Instant) {
        let max = self.ctx.config.max_active_slots;
        for ti in 0..self.transfers.len() {
            if self.active_slots() >= max {
                break;
            }
            let Some(t) = self.transfers[ti].as_ref() else {
                continue;
            };
            if t.slot.is_some() || t.temp_urls.is_empty() {
                continue;
            }
            let startable = match t.state {
                TransferState::Queued => true,
                TransferState::Retrying | TransferState::Paused => {
                    self.retry_at.get(&ti).map_or(true, |&at| now >= at)
                }
                _ => false,
            };
            if startable {
                self.start_slot(ti, now);
            }
        }
    }

    fn start_slot(&mut self, ti: usize, now: Instant) {
        let t = self.transfers[ti].as_mut().unwrap();
        let mut fa = self.ctx.fs.new_file_access();
        let opened = match t.direction {
            Direction::Get => fa.fopen(&t.localfilename, true, false),
            Direction::Put => fa.fopen(&t.localfilename, false, true),
        };
        if !opened {
            warn!("cannot open {:?}, failing transfer", t.localfilename);
            t.state = TransferState::Failed;
            let err = match t.direction {
                Direction::Get => NimbusError::Write,
                Direction::Put => NimbusError::Read,
            };
            let t = self.transfers[ti].as_ref().unwrap();
            self.ctx.app.transfer_failed(t, &err);
            return;
        }

        let max_request_size = self
            .ctx
            .config
            .max_request_size
            .unwrap_or_else(|| max_request_size_for_memory(None));
        let slot = TransferSlot::new(Some(fa), max_request_size, now);

        let si = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .unwrap_or_else(|| {
                self.slots.push(None);
                self.slot_transfer.push(None);
                self.slots.len() - 1
            });
        self.slots[si] = Some(slot);
        self.slot_transfer[si] = Some(ti);
        self.retry_at.remove(&ti);
        let t = self.transfers[ti].as_mut().unwrap();
        t.slot = Some(si);
        t.state = TransferState::Active;
        debug!("activated transfer {ti} on slot {si}");
    }

    /// Tear the slot down (with its best-effort flush) and unlink both
    /// sides of the slot↔transfer indices.
    fn destroy_slot(&mut self, si: usize, ti: usize) {
        if let (Some(slot), Some(t)) = (self.slots[si].as_mut(), self.transfers[ti].as_mut()) {
            slot.shutdown(t, &mut self.ctx);
        }
        self.slots[si] = None;
        self.slot_transfer[si] = None;
        if let Some(t) = self.transfers[ti].as_mut() {
            t.slot = None;
        }
    }

    fn handle_outcome(&mut self, si: usize, ti: usize, outcome: SlotOutcome, now: Instant) {
        match outcome {
            SlotOutcome::Running => {}
            SlotOutcome::Completed => {
                self.destroy_slot(si, ti);
                let t = self.transfers[ti].as_mut().unwrap();
                t.state = TransferState::Completed;
                let key = t.cache_key();
                if let Err(e) = self.ctx.cache.remove(&key) {
                    warn!("failed to drop cache record: {e}");
                }
                let t = self.transfers[ti].as_ref().unwrap();
                self.ctx.app.transfer_complete(t);
            }
            SlotOutcome::Failed(e) => {
                self.destroy_slot(si, ti);
                let t = self.transfers[ti].as_mut().unwrap();
                match &e {
                    NimbusError::OverQuota { retry_after_secs } => {
                        let wait = retry_after_secs
                            .unwrap_or(self.ctx.config.overquota_backoff_secs);
                        warn!("bandwidth overquota, pausing for {wait}s");
                        t.state = TransferState::Paused;
                        self.retry_at.insert(ti, now + Duration::from_secs(wait));
                    }
                    err if err.is_transient() => {
                        t.failcount += 1;
                        t.state = TransferState::Retrying;
                        let backoff = retry_backoff(t.failcount);
                        debug!(
                            "transfer {ti} failed transiently (attempt {}), retrying in {:?}",
                            t.failcount, backoff
                        );
                        // A fresh URL set may be required after a failure.
                        self.retry_at.insert(ti, now + backoff);
                    }
                    _ => {
                        warn!("transfer {ti} failed: {e}");
                        t.state = TransferState::Failed;
                        let key = t.cache_key();
                        if let Err(e) = self.ctx.cache.remove(&key) {
                            warn!("failed to drop cache record: {e}");
                        }
                    }
                }
                let t = self.transfers[ti].as_ref().unwrap();
                self.ctx.app.transfer_failed(t, &e);
            }
        }
    }

    /// Cancel a transfer: disconnect, flush what decrypted, and either
    /// keep the record for later resumption or drop it entirely.
    pub fn cancel(&mut self, ti: usize, keep_for_resume: bool) {
        let Some(Some(t)) = self.transfers.get(ti) else {
            return;
        };
        if let Some(si) = t.slot {
            if let Some(slot) = self.slots[si].as_mut() {
                slot.disconnect();
            }
            self.destroy_slot(si, ti);
        }
        if keep_for_resume {
            let t = self.transfers[ti].as_mut().unwrap();
            t.state = TransferState::Paused;
        } else {
            let t = self.transfers[ti].take().unwrap();
            if let Err(e) = self.ctx.cache.remove(&t.cache_key()) {
                warn!("failed to drop cache record: {e}");
            }
        }
        self.retry_at.remove(&ti);
    }

    /// Flush every active slot and stop accepting crypto work. Called on
    /// logout or process shutdown.
    pub fn shutdown(&mut self) {
        self.ctx.crypto_pool.begin_shutdown();
        for si in 0..self.slots.len() {
            if let Some(ti) = self.slot_transfer[si] {
                self.destroy_slot(si, ti);
                if let Some(t) = self.transfers[ti].as_mut() {
                    t.state = TransferState::Paused;
                }
            }
        }
    }
}

/// Exponential backoff with jitter for transient transfer failures.
fn retry_backoff(failcount: u32) -> Duration {
    let base = Duration::from_millis(500)
        .saturating_mul(1u32 << failcount.saturating_sub(1).min(10))
        .min(RETRY_BACKOFF_MAX);
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter)
}
