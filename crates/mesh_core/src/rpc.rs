//! # Entity RPC Model
//!
//! Calls between entities are addressed by [`MailBox`] and carry a [`RpcType`]
//! that decides two things: which declared [`RpcAuthority`] a method needs to
//! accept the call, and which connection class the reply travels back on.
//!
//! Results never come back as a synchronous return. An awaited call gets an
//! id from the [`RpcCallRegistry`] and is completed when the matching
//! [`EntityRpcCallBack`] arrives; `notify_only` calls expect nothing back.

use crate::error::RpcError;
use crate::mailbox::MailBox;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Direction of a call through the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcType {
    ClientToServer,
    ServerToClient,
    ServerInside,
    ServiceToEntity,
    EntityToService,
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Connection class a reply is sent back on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyChannel {
    /// Client-facing connection held by a gate
    Client,
    /// Gate/server mesh connection
    Server,
    /// Connection to the service manager
    Service,
}

impl RpcType {
    pub fn reply_channel(self) -> ReplyChannel {
        match self {
            RpcType::ClientToServer => ReplyChannel::Client,
            RpcType::ServerToClient | RpcType::ServerInside | RpcType::EntityToService => ReplyChannel::Server,
            RpcType::ServiceToEntity => ReplyChannel::Service,
        }
    }
}

/// Authority flags a method declares when it is registered.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RpcAuthority(u8);

impl RpcAuthority {
    /// Callable from inside the server mesh only
    pub const SERVER_ONLY: RpcAuthority = RpcAuthority(1);
    /// Server method a client may call
    pub const CLIENT_STUB: RpcAuthority = RpcAuthority(1 << 1);
    /// Client method the server may call
    pub const CLIENT_ONLY: RpcAuthority = RpcAuthority(1 << 2);

    pub const fn contains(self, other: RpcAuthority) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether a call of `rpc_type` may reach a method with this authority.
    pub fn admits(self, rpc_type: RpcType) -> bool {
        match rpc_type {
            RpcType::ClientToServer => self.contains(Self::CLIENT_STUB),
            RpcType::ServerToClient => self.contains(Self::CLIENT_ONLY),
            RpcType::ServerInside => self.contains(Self::SERVER_ONLY) || self.contains(Self::CLIENT_STUB),
            RpcType::ServiceToEntity | RpcType::EntityToService => self.contains(Self::SERVER_ONLY),
        }
    }

    /// Like [`Self::admits`], as a `Result`.
    pub fn check(self, method: &str, rpc_type: RpcType) -> Result<(), RpcError> {
        if self.admits(rpc_type) {
            Ok(())
        } else {
            Err(RpcError::Unauthorized {
                method: method.to_string(),
                rpc_type: rpc_type.to_string(),
            })
        }
    }
}

impl BitOr for RpcAuthority {
    type Output = RpcAuthority;

    fn bitor(self, rhs: Self) -> Self::Output {
        RpcAuthority(self.0 | rhs.0)
    }
}

impl fmt::Debug for RpcAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::SERVER_ONLY) {
            names.push("ServerOnly");
        }
        if self.contains(Self::CLIENT_STUB) {
            names.push("ClientStub");
        }
        if self.contains(Self::CLIENT_ONLY) {
            names.push("ClientOnly");
        }
        write!(f, "RpcAuthority({})", names.join("|"))
    }
}

/// A call addressed to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRpc {
    /// Correlates the callback; assigned by [`RpcCallRegistry::prepare`]
    pub rpc_id: u64,
    pub method_name: String,
    pub sender: MailBox,
    pub target: MailBox,
    pub rpc_type: RpcType,
    /// Fire-and-forget; no callback is produced
    pub notify_only: bool,
    pub args: Vec<serde_json::Value>,
}

impl EntityRpc {
    pub fn new(method_name: impl Into<String>, sender: MailBox, target: MailBox, rpc_type: RpcType) -> Self {
        Self {
            rpc_id: 0,
            method_name: method_name.into(),
            sender,
            target,
            rpc_type,
            notify_only: false,
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn notify_only(mut self) -> Self {
        self.notify_only = true;
        self
    }

    /// Deserializes argument `index`.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidArguments`] when the argument is missing or has the
    /// wrong shape.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        let value = self.args.get(index).ok_or_else(|| {
            RpcError::InvalidArguments(format!("{}: missing argument {}", self.method_name, index))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| RpcError::InvalidArguments(format!("{}: argument {}: {}", self.method_name, index, e)))
    }

    /// Builds the callback answering this call.
    pub fn reply(&self, result: RpcResult) -> EntityRpcCallBack {
        EntityRpcCallBack {
            rpc_id: self.rpc_id,
            target: self.sender.clone(),
            rpc_type: self.rpc_type,
            result,
        }
    }
}

/// Outcome carried by a callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value")]
pub enum RpcResult {
    Ok(serde_json::Value),
    Error(String),
}

/// Answer to an awaited [`EntityRpc`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRpcCallBack {
    pub rpc_id: u64,
    /// Mailbox of the original caller
    pub target: MailBox,
    pub rpc_type: RpcType,
    pub result: RpcResult,
}

/// An awaited call waiting for its callback.
#[derive(Debug)]
pub struct PendingCall {
    pub rpc_id: u64,
    receiver: oneshot::Receiver<RpcResult>,
}

impl PendingCall {
    /// Waits for the callback.
    ///
    /// There is no timeout: wrap in `tokio::time::timeout` where one is needed,
    /// and cancel the id in the registry when giving up.
    ///
    /// # Errors
    ///
    /// - [`RpcError::InvocationFailed`] when the remote side reported an error
    /// - [`RpcError::Cancelled`] when the call was cancelled or the registry dropped
    pub async fn wait(self) -> Result<serde_json::Value, RpcError> {
        match self.receiver.await {
            Ok(RpcResult::Ok(value)) => Ok(value),
            Ok(RpcResult::Error(message)) => Err(RpcError::InvocationFailed(message)),
            Err(_) => Err(RpcError::Cancelled(self.rpc_id)),
        }
    }
}

/// Bookkeeping for outgoing calls.
#[derive(Debug)]
pub struct RpcCallRegistry {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<RpcResult>>,
}

impl Default for RpcCallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCallRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Assigns a fresh id to `rpc` and, unless it is `notify_only`, registers
    /// a completion for it.
    pub fn prepare(&self, rpc: &mut EntityRpc) -> Option<PendingCall> {
        rpc.rpc_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if rpc.notify_only {
            return None;
        }

        let (sender, receiver) = oneshot::channel();
        self.pending.insert(rpc.rpc_id, sender);
        Some(PendingCall {
            rpc_id: rpc.rpc_id,
            receiver,
        })
    }

    /// Completes the call a callback answers.
    ///
    /// # Returns
    ///
    /// `false` when no call with that id is pending.
    pub fn complete(&self, callback: EntityRpcCallBack) -> bool {
        match self.pending.remove(&callback.rpc_id) {
            Some((_, sender)) => {
                if sender.send(callback.result).is_err() {
                    debug!("📭 Caller of rpc {} stopped waiting", callback.rpc_id);
                }
                true
            }
            None => {
                warn!("📭 Callback for unknown rpc {}", callback.rpc_id);
                false
            }
        }
    }

    /// Drops a pending call; its waiter sees [`RpcError::Cancelled`].
    pub fn cancel(&self, rpc_id: u64) -> bool {
        self.pending.remove(&rpc_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mb(id: &str) -> MailBox {
        MailBox::new(id, "127.0.0.1", 7001, 1)
    }

    #[test]
    fn test_authority_rules() {
        assert!(RpcAuthority::CLIENT_STUB.admits(RpcType::ClientToServer));
        assert!(!RpcAuthority::SERVER_ONLY.admits(RpcType::ClientToServer));
        assert!(RpcAuthority::CLIENT_ONLY.admits(RpcType::ServerToClient));
        assert!(RpcAuthority::SERVER_ONLY.admits(RpcType::ServerInside));
        assert!(RpcAuthority::CLIENT_STUB.admits(RpcType::ServerInside));
        assert!(!RpcAuthority::CLIENT_ONLY.admits(RpcType::ServiceToEntity));

        let err = RpcAuthority::SERVER_ONLY.check("attack", RpcType::ClientToServer).unwrap_err();
        assert!(matches!(err, RpcError::Unauthorized { ref method, .. } if method == "attack"));
    }

    #[test]
    fn test_typed_arguments() {
        let rpc = EntityRpc::new("move", mb("a"), mb("b"), RpcType::ServerInside).with_args(vec![json!(3), json!("north")]);
        assert_eq!(rpc.arg::<i64>(0).unwrap(), 3);
        assert_eq!(rpc.arg::<String>(1).unwrap(), "north");
        assert!(matches!(rpc.arg::<String>(0), Err(RpcError::InvalidArguments(_))));
        assert!(rpc.arg::<i64>(5).is_err());
    }

    #[tokio::test]
    async fn test_callback_completes_pending_call() {
        let registry = RpcCallRegistry::new();
        let mut rpc = EntityRpc::new("ping", mb("a"), mb("b"), RpcType::ServerInside);
        let pending = registry.prepare(&mut rpc).unwrap();
        assert_eq!(registry.pending_count(), 1);

        assert!(registry.complete(rpc.reply(RpcResult::Ok(json!("pong")))));
        assert_eq!(pending.wait().await.unwrap(), json!("pong"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notify_only_and_cancel() {
        let registry = RpcCallRegistry::new();
        let mut fire = EntityRpc::new("log", mb("a"), mb("b"), RpcType::ServerInside).notify_only();
        assert!(registry.prepare(&mut fire).is_none());
        assert!(fire.rpc_id > 0);

        let mut call = EntityRpc::new("slow", mb("a"), mb("b"), RpcType::ServerInside);
        let pending = registry.prepare(&mut call).unwrap();
        assert_ne!(call.rpc_id, fire.rpc_id);
        assert!(registry.cancel(call.rpc_id));
        assert!(matches!(pending.wait().await, Err(RpcError::Cancelled(_))));
        assert!(!registry.complete(call.reply(RpcResult::Ok(json!(null)))));
    }
}
