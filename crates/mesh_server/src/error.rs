//! Error types for the mesh runtime.
//!
//! Each concern gets its own enum: [`TransportError`] for sockets and
//! framing, [`ClusterError`] for registration and bootstrap, and
//! [`ServerError`] for everything an instance driver can fail with.

use mesh_core::{PropertyError, RpcError};

/// Errors raised while moving packages over a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket level failure (bind, connect, read, write)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame could not be encoded or decoded as a package
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// The connection is already shut down
    #[error("Connection {0} is closed")]
    ConnectionClosed(usize),
    /// No connection is registered under this id
    #[error("Unknown connection {0}")]
    UnknownConnection(usize),
}

/// Errors in the registration / bootstrap protocol.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Instance '{0}' is not registered")]
    UnknownInstance(String),
    #[error("Unexpected {message} while {state}")]
    UnexpectedMessage { message: String, state: String },
    #[error("Host manager connection lost")]
    HostManagerLost,
    #[error("No peer connection for {0}")]
    NoPeerConnection(String),
}

/// Top level error for instance drivers.
///
/// Mirrors the coarse `Network` / `Internal` split used by the runtime, with
/// `From` conversions for the more specific errors underneath.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Network-related error (connection issues, send failures, etc.)
    #[error("Network error: {0}")]
    Network(String),
    /// Internal server error (invalid state, failed task, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TransportError> for ServerError {
    fn from(error: TransportError) -> Self {
        ServerError::Network(error.to_string())
    }
}

impl From<ClusterError> for ServerError {
    fn from(error: ClusterError) -> Self {
        ServerError::Internal(error.to_string())
    }
}

impl From<PropertyError> for ServerError {
    fn from(error: PropertyError) -> Self {
        ServerError::Internal(error.to_string())
    }
}

impl From<RpcError> for ServerError {
    fn from(error: RpcError) -> Self {
        ServerError::Internal(error.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(error: std::io::Error) -> Self {
        ServerError::Network(error.to_string())
    }
}
