//! Error types for rustica.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the broker and its workers.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("invalid list syntax in parameter \"listen_addresses\": {0}")]
    InvalidListenAddresses(String),

    #[error("could not create any TCP/IP sockets")]
    NoListenSockets,

    #[error("could not create Unix-domain socket \"{path}\": {source}")]
    IpcSocket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("readiness multiplexer error: {0}")]
    Poll(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("connection hand-off failed: {0}")]
    Handoff(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for rustica operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
