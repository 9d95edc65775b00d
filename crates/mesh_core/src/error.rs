//! Error types shared by the property, sync and RPC layers.

use crate::sync::{SyncOperation, SyncType};
use crate::value::ContainerKind;

/// Errors raised by property tree operations.
///
/// All of these are fatal to the operation that raised them and are never
/// retried. Callers are expected to log them at the call boundary.
#[derive(Debug, thiserror::Error)]
pub enum PropertyError {
    /// Assigning or setting between mismatched concrete types
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: ContainerKind,
        actual: ContainerKind,
    },
    /// A composite type declaration is malformed
    #[error("Invalid declaration: {0}")]
    InvalidDeclaration(String),
    /// No factory registered for a composite type
    #[error("Unregistered container type: {0}")]
    UnregisteredType(String),
    /// Dictionary keys must be int, string or mailbox
    #[error("Invalid dictionary key type: {0}")]
    InvalidKeyType(String),
    /// A mutator was called on a shadow property
    #[error("Shadow property '{property}' cannot be mutated")]
    ShadowMutation { property: String },
    /// A delta was built for an operation the container kind does not support
    #[error("Invalid sync operation {operation:?} for {sync_type:?}")]
    InvalidSyncOperation {
        operation: SyncOperation,
        sync_type: SyncType,
    },
    #[error("Index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    /// Handle is stale or a path does not resolve
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    /// Operation needs a different container variant
    #[error("Container is a {actual}, expected {expected}")]
    NotAContainer {
        expected: &'static str,
        actual: ContainerKind,
    },
    /// Node already has a parent or owner
    #[error("Container is already attached to a property tree")]
    AlreadyAttached,
    /// Composite fields are fixed for the lifetime of their parent
    #[error("Composite field '{0}' cannot be detached or replaced")]
    PermanentField(String),
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors raised while addressing, authorizing or invoking an RPC.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("RPC method not found: {0}")]
    MethodNotFound(String),
    /// Declared authority does not admit the call's rpc type
    #[error("RPC '{method}' not callable as {rpc_type}")]
    Unauthorized { method: String, rpc_type: String },
    #[error("Unroutable target: {0}")]
    UnroutableTarget(String),
    #[error("RPC invocation failed: {0}")]
    InvocationFailed(String),
    #[error("Invalid RPC arguments: {0}")]
    InvalidArguments(String),
    /// The pending call was dropped before a callback arrived
    #[error("RPC {0} cancelled")]
    Cancelled(u64),
}
