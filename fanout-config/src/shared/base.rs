use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Maximum number of concurrently running fetches cannot be zero.
    #[error("`max_concurrency` cannot be zero")]
    MaxConcurrencyZero,
    /// A per-item timeout, when set, must be positive.
    #[error("`item_timeout_ms` must be greater than 0 when set")]
    ItemTimeoutZero,
}
