//! Error types for catalog, configuration and runtime plumbing.
//!
//! Radio failures are not errors here: the state machines fold them into a
//! [`DisconnectReason`](crate::apn::types::DisconnectReason) and keep going.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("unknown apn type: {0}")]
    UnknownApnType(String),
    #[error("no apn holder serves capability {0:?}")]
    UnknownCapability(crate::apn::types::NetCapability),
    #[error("invalid apn entry {index}: {reason}")]
    InvalidApn { index: usize, reason: String },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("slot worker is not running")]
    Disconnected,
    #[error("failed to spawn slot worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("apn record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DataError>;
