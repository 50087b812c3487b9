//! Scheduler-wide collaborators handed to every slot tick.

use std::sync::Arc;

use nimbus_types::NimbusError;
use tracing::warn;

use crate::cache::{serialize_transfer, TransferCache};
use crate::config::ClientConfig;
use crate::fs::FsAccess;
use crate::http::HttpDispatcher;
use crate::transfer::Transfer;
use crate::workers::CryptoPool;

/// Application callbacks. All methods have no-op defaults so embedders
/// implement only what they observe.
pub trait AppListener: Send {
    fn transfer_update(&mut self, _t: &Transfer) {}
    fn transfer_failed(&mut self, _t: &Transfer, _e: &NimbusError) {}
    fn transfer_complete(&mut self, _t: &Transfer) {}
    fn notify_change_to_https(&mut self) {}
}

pub struct NullListener;

impl AppListener for NullListener {}

/// Everything a slot reaches beyond its own state: configuration, the
/// HTTP dispatcher, the crypto worker pool, the persistent cache, the
/// filesystem, and client-wide toggles.
pub struct SchedulerContext {
    pub config: ClientConfig,
    pub dispatcher: Arc<dyn HttpDispatcher>,
    pub crypto_pool: CryptoPool,
    pub cache: Box<dyn TransferCache>,
    pub fs: Box<dyn FsAccess>,
    pub app: Box<dyn AppListener>,
    pub use_alt_down_port: bool,
    pub use_alt_up_port: bool,
    pub use_https: bool,
}

impl SchedulerContext {
    pub fn new(
        config: ClientConfig,
        dispatcher: Arc<dyn HttpDispatcher>,
        cache: Box<dyn TransferCache>,
        fs: Box<dyn FsAccess>,
        app: Box<dyn AppListener>,
    ) -> Self {
        let crypto_pool = CryptoPool::new(config.worker_threads);
        Self {
            config,
            dispatcher,
            crypto_pool,
            cache,
            fs,
            app,
            use_alt_down_port: false,
            use_alt_up_port: false,
            use_https: false,
        }
    }

    /// Persist the transfer record; cache failures are not fatal to the
    /// transfer, only to resumability.
    pub fn cache_transfer(&mut self, t: &Transfer) {
        let record = serialize_transfer(t);
        if let Err(e) = self.cache.put(&t.cache_key(), &record) {
            warn!("failed to cache transfer record: {e}");
        }
    }
}
