//! A player-side connection to a gate.
//!
//! [`MeshClient`] performs the client handshake, learns the mailbox the mesh
//! addresses it by, and then makes `ClientToServer` calls. Server pushes
//! (property sync lists and `ServerToClient` calls) arrive on the
//! [`ClientPush`] receiver returned by [`MeshClient::connect`].

use crate::error::ServerError;
use crate::transport::{Connection, Transport, TransportEvent};
use mesh_core::protocol::{Handshake, InstanceRole, PropertySync};
use mesh_core::rpc::{EntityRpc, PendingCall, RpcCallRegistry, RpcType};
use mesh_core::{MailBox, Package, RpcError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Something the mesh sent to this client unprompted.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPush {
    PropertySync(PropertySync),
    Rpc(EntityRpc),
}

pub struct MeshClient {
    transport: Arc<Transport>,
    connection: Arc<Connection>,
    mailbox: MailBox,
    calls: Arc<RpcCallRegistry>,
}

impl MeshClient {
    /// Connects to the gate's client port at `address` as client `id`.
    ///
    /// # Errors
    ///
    /// [`ServerError::Network`] if the gate is unreachable or does not
    /// acknowledge the handshake in time.
    pub async fn connect(
        address: &str,
        id: &str,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientPush>), ServerError> {
        let (transport, mut events) = Transport::new(shutdown);
        let connection = transport.connect(address).await?;
        connection.send(&Package::Handshake(Handshake {
            mailbox: MailBox::new(id, "", 0, 0),
            role: InstanceRole::Client,
            ack: false,
        }))?;

        let mailbox = timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Package {
                        package: Package::Handshake(ack),
                        ..
                    } if ack.ack => return Some(ack.mailbox),
                    TransportEvent::Disconnected { .. } => return None,
                    _ => {}
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
        .ok_or_else(|| ServerError::Network(format!("gate at {address} did not accept client '{id}'")))?;
        info!("🎮 Attached to the mesh as {}", mailbox);

        let calls = Arc::new(RpcCallRegistry::new());
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(events, calls.clone(), push_tx));

        Ok((
            Self {
                transport,
                connection,
                mailbox,
                calls,
            },
            push_rx,
        ))
    }

    /// The mailbox servers use to reach this client.
    pub fn mailbox(&self) -> &MailBox {
        &self.mailbox
    }

    /// Calls `method` on `target` and returns the pending result.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvocationFailed`] if the call cannot be sent.
    pub fn call(&self, target: MailBox, method: &str, args: Vec<serde_json::Value>) -> Result<PendingCall, RpcError> {
        let mut rpc = EntityRpc::new(method, self.mailbox.clone(), target, RpcType::ClientToServer).with_args(args);
        let pending = self
            .calls
            .prepare(&mut rpc)
            .ok_or_else(|| RpcError::InvocationFailed("awaited call registered no completion".to_string()))?;
        if let Err(e) = self.connection.send(&Package::EntityRpc(rpc)) {
            self.calls.cancel(pending.rpc_id);
            return Err(RpcError::InvocationFailed(e.to_string()));
        }
        Ok(pending)
    }

    /// Fire-and-forget variant of [`Self::call`].
    ///
    /// # Errors
    ///
    /// [`RpcError::InvocationFailed`] if the call cannot be sent.
    pub fn notify(&self, target: MailBox, method: &str, args: Vec<serde_json::Value>) -> Result<(), RpcError> {
        let mut rpc = EntityRpc::new(method, self.mailbox.clone(), target, RpcType::ClientToServer)
            .with_args(args)
            .notify_only();
        self.calls.prepare(&mut rpc);
        self.connection
            .send(&Package::EntityRpc(rpc))
            .map_err(|e| RpcError::InvocationFailed(e.to_string()))
    }

    pub fn close(&self) {
        self.transport.shutdown();
    }
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    calls: Arc<RpcCallRegistry>,
    pushes: mpsc::UnboundedSender<ClientPush>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Package { package, .. } => match package {
                Package::EntityRpcCallBack(callback) => {
                    calls.complete(callback);
                }
                Package::PropertySync(sync) => {
                    let _ = pushes.send(ClientPush::PropertySync(sync));
                }
                Package::EntityRpc(rpc) => {
                    let _ = pushes.send(ClientPush::Rpc(rpc));
                }
                other => debug!("Client ignoring {:?}", other.package_type()),
            },
            TransportEvent::Disconnected { .. } => {
                warn!("🔌 Gate connection closed");
                break;
            }
            TransportEvent::Connected { .. } => {}
        }
    }
}
