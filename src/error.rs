//! Error types for dnsroute.
//!
//! Only [`Error::Config`] is fatal. Everything else is logged by the caller
//! and the observation path keeps running.

use std::net::IpAddr;

use thiserror::Error;

/// Crate-level error, returned from startup and the server lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or invalid required configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Watch-list could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Replication listener or peer failure.
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Watch-list load failure. The previously active trie stays in place.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The watch-list source could not be read.
    #[error("unable to read watch-list: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying sled error.
    #[error("store error: {0}")]
    Sled(#[from] sled::Error),

    /// A stored record could not be encoded or decoded.
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The store was already closed.
    #[error("store is closed")]
    Closed,
}

/// Route controller failure.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The route hook could not be spawned.
    #[error("unable to run route command for {ip}: {source}")]
    Spawn {
        /// Address the route was for.
        ip: IpAddr,
        /// Spawn error.
        source: std::io::Error,
    },

    /// The route hook exited unsuccessfully.
    #[error("route command for {ip} exited with {status}")]
    Failed {
        /// Address the route was for.
        ip: IpAddr,
        /// Exit status as reported by the OS.
        status: String,
    },

    /// The route hook did not finish in time.
    #[error("route command for {ip} timed out")]
    Timeout {
        /// Address the route was for.
        ip: IpAddr,
    },

    /// No command is configured for the requested action.
    #[error("no route command configured")]
    NotConfigured,
}

/// Wire protocol decode failure for a single frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame body is not a valid message.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Encoded body does not fit the 4-byte length prefix.
    #[error("frame body of {size} bytes cannot be framed")]
    Oversized {
        /// Encoded body size.
        size: usize,
    },
}

/// Failure of one peer link. Never affects other links.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Socket error.
    #[error("peer IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect, handshake, write or idle-read deadline elapsed.
    #[error("peer timed out during {0}")]
    Timeout(&'static str),

    /// Remote sent a length prefix beyond the frame limit.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Remote did not follow the handshake sequence.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Link dialled itself (same node id on both ends).
    #[error("connected to self")]
    SelfConnection,

    /// Outbound queue overflowed; the link is reset to force a full-sync.
    #[error("outbound queue overflowed")]
    QueueOverflow,

    /// Remote closed the connection.
    #[error("connection closed by peer")]
    Closed,
}
