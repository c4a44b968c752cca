//! Error types for the receiver.

use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for receiver operations.
///
/// Frames that fail to decode are not errors; see [`crate::decoder::Dropped`].
#[derive(Error, Debug)]
pub enum Error {
    /// The receiving endpoint could not be bound
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called on a listener that is still running
    #[error("listener is already running")]
    AlreadyRunning,

    /// The configured marker pattern did not compile
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Forwarding request could not be built or sent
    #[error("forwarding request failed: {0}")]
    Forward(#[from] reqwest::Error),

    /// A background task panicked or was aborted
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
