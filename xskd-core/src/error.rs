//! Error types for xskd control-plane operations.
//!
//! None of these are ever observed by the XDP program: a missing binding or a
//! zero sentinel are ordinary pass-through decisions, not errors.

use thiserror::Error;

/// Result type alias for xskd operations.
pub type Result<T> = std::result::Result<T, XskError>;

/// Errors raised while loading, attaching, or driving the dispatcher.
#[derive(Error, Debug)]
pub enum XskError {
    /// Object could not be read, parsed, or accepted by the verifier
    #[error("failed to load XDP program: {0}")]
    Load(String),

    #[error("failed to attach XDP program to interface {interface}: {reason}")]
    Attach { interface: String, reason: String },

    #[error("failed to find default network interface")]
    NoDefaultInterface,

    /// BPF map lookup or update failed
    #[error("BPF map operation failed: {0}")]
    Map(String),

    #[error("XDP program not loaded")]
    NotLoaded,

    /// Queue index outside the fixed dispatch table
    #[error("queue {queue} exceeds dispatch table capacity {capacity}")]
    CapacityExceeded { queue: u32, capacity: u32 },

    /// Another version is attached to the interface and still has users
    #[error("interface {interface} runs XDP program version {version} with active users")]
    InUse { interface: String, version: u32 },

    #[error("XDP object version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Version metadata missing or malformed in the object file
    #[error("invalid object metadata: {0}")]
    Metadata(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl XskError {
    /// Returns true if the error happened before anything was attached,
    /// i.e. the interface is guaranteed untouched.
    #[inline]
    pub fn is_load_time(&self) -> bool {
        matches!(
            self,
            XskError::Load(_)
                | XskError::VersionMismatch { .. }
                | XskError::Metadata(_)
                | XskError::Config(_)
        )
    }
}
