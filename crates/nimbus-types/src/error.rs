use thiserror::Error;

pub type Result<T> = std::result::Result<T, NimbusError>;

#[derive(Debug, Error)]
pub enum NimbusError {
    /// Transient network or server condition; the transfer may be retried.
    #[error("transient transfer failure, retry later")]
    Again,

    /// MAC verification failed after exhausting legacy-MAC recovery.
    #[error("file integrity check failed")]
    Key,

    /// Storage server reported bandwidth overquota (HTTP 509).
    /// `retry_after_secs` is the server-supplied wait, if any.
    #[error("bandwidth quota exceeded")]
    OverQuota { retry_after_secs: Option<u64> },

    /// Local filesystem read failed while feeding an upload.
    #[error("local read error")]
    Read,

    /// Local filesystem write failed while storing a download.
    #[error("local write error")]
    Write,

    /// Invariant violation or missing upload token.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// Any other server-reported error, by storage error code.
    #[error("storage server error {0}")]
    Failed(i32),

    #[error("invalid record format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NimbusError {
    /// Whether slot-level backoff-and-retry is appropriate for this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NimbusError::Again | NimbusError::OverQuota { .. } | NimbusError::Read | NimbusError::Write
        )
    }
}
