//! Bounded worker pool for off-thread chunk crypto.
//!
//! Whole-chunk encryption and decryption is handed off here so the
//! scheduler thread never stalls on AES throughput. Jobs carry their own
//! copy of the key material; completion is observed through the piece's
//! finalized flag, never by touching scheduler state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

struct Job {
    run: Box<dyn FnOnce() + Send>,
    /// Discardable jobs are skipped once shutdown begins (e.g. encrypting
    /// data we will no longer send). Non-discardable jobs always run so
    /// downloaded data can still be flushed to disk.
    discardable: bool,
}

pub struct CryptoPool {
    tx: Option<Sender<Job>>,
    shutting_down: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl CryptoPool {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = crossbeam_channel::bounded::<Job>(threads * 4);
        let shutting_down = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let down = Arc::clone(&shutting_down);
            handles.push(std::thread::spawn(move || {
                for job in rx {
                    if job.discardable && down.load(Ordering::Relaxed) {
                        continue;
                    }
                    (job.run)();
                }
            }));
        }

        Self {
            tx: Some(tx),
            shutting_down,
            handles,
        }
    }

    /// Queue a job. Blocks briefly if the queue is full, which also acts
    /// as natural backpressure on the scheduler.
    pub fn push(&self, discardable: bool, f: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Job {
                run: Box::new(f),
                discardable,
            });
        }
    }

    /// Begin shutdown: discardable queued jobs will be skipped.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}

impl Drop for CryptoPool {
    fn drop(&mut self) {
        self.begin_shutdown();
        // Close the channel so workers drain what is queued and exit.
        self.tx.take();
        for h in self.handles.drain(..) {
            if h.join().is_err() {
                debug!("crypto worker panicked during shutdown");
            }
        }
    }
}
