//! Client configuration for the transfer engine.

use serde::{Deserialize, Serialize};

fn default_connections_per_transfer() -> usize {
    4
}

fn default_max_active_slots() -> usize {
    6
}

fn default_worker_threads() -> usize {
    2
}

fn default_overquota_backoff_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Parallel connections per non-RAID transfer of at least 128 KiB.
    #[serde(default = "default_connections_per_transfer")]
    pub connections_per_transfer: usize,

    /// Maximum simultaneously active transfer slots.
    #[serde(default = "default_max_active_slots")]
    pub max_active_slots: usize,

    /// Crypto worker threads shared by all slots.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Toggle download/upload URLs to the :8080 alternative port when the
    /// primary port stalls.
    #[serde(default)]
    pub auto_down_port: bool,
    #[serde(default)]
    pub auto_up_port: bool,

    /// Deliver downloaded chunks to the file in ascending offset order,
    /// postponing out-of-order completions.
    #[serde(default)]
    pub ordered_download: bool,

    /// Fallback overquota wait when the server supplies no `Retry-After`.
    #[serde(default = "default_overquota_backoff_secs")]
    pub overquota_backoff_secs: u64,

    /// Per-connection request size cap in bytes. When unset it is picked
    /// from available memory (2/4/8/16 MiB steps).
    #[serde(default)]
    pub max_request_size: Option<i64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connections_per_transfer: default_connections_per_transfer(),
            max_active_slots: default_max_active_slots(),
            worker_threads: default_worker_threads(),
            auto_down_port: false,
            auto_up_port: false,
            ordered_download: false,
            overquota_backoff_secs: default_overquota_backoff_secs(),
            max_request_size: None,
        }
    }
}

/// Pick the per-connection request size cap from available physical
/// memory, in the classic 2/4/8/16 MiB steps.
pub fn max_request_size_for_memory(avail_ram: Option<u64>) -> i64 {
    match avail_ram {
        Some(b) if b < 256 * 1024 * 1024 => 2 * 1024 * 1024,
        Some(b) if b < 512 * 1024 * 1024 => 4 * 1024 * 1024,
        Some(b) if b < 1024 * 1024 * 1024 => 8 * 1024 * 1024,
        _ => 16 * 1024 * 1024,
    }
}
