use thiserror::Error;

/// The only error type that crosses the public API. Nearly every operation in this
/// crate instead returns `Option` (absence rather than failure) per spec §7 — this
/// type exists solely for the handful of calls that can fail outright, like opening
/// the store.
#[derive(Debug, Error)]
pub enum AuthBrokerError {
    #[error("credential store error: {0}")]
    Store(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
