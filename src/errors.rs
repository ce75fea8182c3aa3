// src/errors.rs

use std::time::Duration;

/// Failure of a single upstream balance lookup.
///
/// Cloneable because one outcome is cached and handed to every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("lookup task failed: {0}")]
    TaskFailed(String),
}

impl UpstreamError {
    /// Timeout-class errors, as opposed to answers the upstream actually gave.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::DeadlineExceeded)
    }
}

/// Request-level rejections. Any of these halts the whole batch before fan-out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },
    #[error("wallets required")]
    EmptyBatch,
    #[error("too many wallets (max {max})")]
    TooManyKeys { max: usize },
    #[error("invalid wallet: {0}")]
    InvalidKey(String),
    #[error("no valid wallets")]
    NoValidKeys,
}

/// Errors from API key lookups.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("empty api key")]
    EmptyKey,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
