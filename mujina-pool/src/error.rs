//! Common error types for mujina-pool.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from underlying error types used throughout the crate.
//!
//! Per-share and per-message failures are not errors in this sense: they are
//! classified as [`crate::validator::Outcome`] values or answered with the
//! protocol's native rejection. `PoolError` covers what terminates a
//! connection, a subsystem call, or the daemon.

use thiserror::Error;

use crate::job::RejectReason;
use crate::protocol::CodecError;

/// Main error type for mujina-pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire codec errors (malformed, handshake, unsupported)
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Claim identity rejected at authorize time
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Negotiated template failed structural validation
    #[error("Template rejected: {0}")]
    TemplateRejectedStructural(#[from] RejectReason),

    /// Block template source could not be reached or answered badly
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Event sink could not accept a fact
    #[error("Event sink unavailable: {0}")]
    SinkUnavailable(String),

    /// Session resources (extranonce space, session slots) exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A handshake or authorization deadline passed
    #[error("Timed out: {0}")]
    Timeout(&'static str),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Alias used where the name reads better next to other error types.
pub type PoolError = Error;
