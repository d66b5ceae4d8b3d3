//! Unified error handling for netfilterd.
//!
//! Each subsystem carries its own error enum; the distinction that matters
//! operationally is fatal-versus-transient (see `StoreError::is_fatal`).
//! Fatal errors set the shared shutdown flag with exit code 2 so the
//! supervisor restarts the daemon instead of letting it run with policy
//! bypassed.

use thiserror::Error;

/// Errors from the packet-filter adapter.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("packet filter command failed: {0}")]
    Command(String),

    #[error("chain {0} does not exist")]
    NoSuchChain(String),
}

/// Errors from the key-value store accessor.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key-value store error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The named key holds something that is not the expected JSON shape.
    /// Always fatal: an unparseable policy blob must not be glossed over.
    #[error("malformed configuration in {0}")]
    BadConfig(&'static str),
}

impl StoreError {
    /// Whether this error must terminate the process (exit code 2).
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::BadConfig(_))
    }
}

/// Errors surfaced by the ban engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error("invalid ban prefix length: {0}")]
    Prefix(#[from] ipnet::PrefixLenError),
}
