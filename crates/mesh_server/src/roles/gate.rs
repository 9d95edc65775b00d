//! Gate behaviour: the client-facing edge of the mesh.
//!
//! Clients connect on the gate's client port once the host manager has sent
//! `Open`. A client handshake binds the client's id to its connection and
//! answers with the mailbox the rest of the mesh uses to reach it: the
//! client's id at the gate's address.

use super::node::Node;
use crate::routing::RouteDecision;
use crate::transport::{ConnectionId, ConnectionKind};
use mesh_core::protocol::{Handshake, InstanceRole};
use mesh_core::rpc::{EntityRpc, EntityRpcCallBack, ReplyChannel, RpcType};
use mesh_core::Package;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

impl Node {
    /// Binds a client connection to the id it introduced itself with.
    pub(crate) fn accept_client(&self, conn: ConnectionId, handshake: Handshake) {
        if handshake.role != InstanceRole::Client || handshake.ack {
            warn!("🚫 Unexpected handshake from {} on client connection {}", handshake.mailbox, conn);
            self.transport.close(conn);
            return;
        }
        let Some(connection) = self.transport.connection(conn) else {
            return;
        };

        let id = handshake.mailbox.id;
        if self.entities().contains(&id) || id == self.mailbox.id {
            warn!("🚫 Client id '{}' collides with a local entity, refusing", id);
            self.transport.close(conn);
            return;
        }
        if let Some(previous) = self.clients.insert(id.clone(), conn) {
            if previous != conn {
                warn!("🔁 Client '{}' reconnected, closing its old connection {}", id, previous);
                self.transport.close(previous);
            }
        }

        let routable = self.mailbox.with_id(id.clone());
        connection.set_peer(routable.clone());
        let ack = Package::Handshake(Handshake {
            mailbox: routable,
            role: self.role,
            ack: true,
        });
        match connection.send(&ack) {
            Ok(()) => info!("🎮 Client '{}' attached on connection {}", id, conn),
            Err(e) => warn!("🎮 Could not acknowledge client '{}': {}", id, e),
        }
    }

    /// Accepts a call from a client. Clients may only make `ClientToServer`
    /// calls, and always as themselves.
    pub(crate) fn client_rpc(self: &Arc<Self>, conn: ConnectionId, mut rpc: EntityRpc) {
        let Some(sender) = self.transport.connection(conn).and_then(|c| c.peer()) else {
            warn!("🚫 RPC '{}' from connection {} before its handshake, dropping", rpc.method_name, conn);
            return;
        };
        if rpc.rpc_type != RpcType::ClientToServer {
            warn!(
                "🔒 Client '{}' attempted a {} call to '{}', dropping",
                sender.id, rpc.rpc_type, rpc.method_name
            );
            return;
        }
        rpc.sender = sender;
        self.deliver_rpc(rpc);
    }

    /// A callback headed for a client may only leave on that client's
    /// connection, or on the way to the gate that holds it.
    pub(crate) fn callback_channel_allows(&self, callback: &EntityRpcCallBack, decision: &RouteDecision) -> bool {
        if self.role != InstanceRole::Gate {
            return true;
        }
        match callback.rpc_type.reply_channel() {
            ReplyChannel::Client => matches!(
                decision,
                RouteDecision::ForwardToClient(_) | RouteDecision::ForwardToGate(_)
            ),
            ReplyChannel::Server | ReplyChannel::Service => !matches!(decision, RouteDecision::ForwardToClient(_)),
        }
    }

    /// Starts accepting clients. Idempotent.
    pub(crate) fn open_clients(self: &Arc<Self>) {
        let Some(address) = self.client_address.clone() else {
            warn!("⚠️ {} received Open but has no client port", self.role);
            return;
        };
        if self.clients_open.swap(true, Ordering::AcqRel) {
            return;
        }

        let node = Arc::clone(self);
        tokio::spawn(async move {
            match node.transport.listen(&address, ConnectionKind::Client).await {
                Ok(bound) => info!("🚪 Gate {} accepting clients on {}", node.mailbox, bound),
                Err(e) => {
                    error!("❌ Could not open the client port {}: {}", address, e);
                    node.clients_open.store(false, Ordering::Release);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::NodeParts;
    use super::*;
    use crate::transport::Transport;
    use mesh_core::rpc::RpcResult;
    use mesh_core::MailBox;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn gate() -> Arc<Node> {
        let (transport, _events) = Transport::new(CancellationToken::new());
        Node::new(NodeParts {
            role: InstanceRole::Gate,
            mailbox: MailBox::new("gate_0", "127.0.0.1", 9100, 1),
            transport,
            report_errors: false,
            client_address: None,
            sync: None,
            default_delay_ms: 50,
        })
    }

    fn callback(rpc_type: RpcType) -> EntityRpcCallBack {
        EntityRpcCallBack {
            rpc_id: 1,
            target: MailBox::new("player_1", "127.0.0.1", 9100, 1),
            rpc_type,
            result: RpcResult::Ok(json!(null)),
        }
    }

    #[tokio::test]
    async fn test_client_replies_stay_on_client_channels() {
        let gate = gate();
        let server = RouteDecision::ForwardToServer(MailBox::new("server_0", "127.0.0.1", 9300, 1));
        let other_gate = RouteDecision::ForwardToGate(MailBox::new("gate_1", "127.0.0.1", 9101, 1));

        let client_reply = callback(RpcType::ClientToServer);
        assert!(gate.callback_channel_allows(&client_reply, &RouteDecision::ForwardToClient(3)));
        assert!(gate.callback_channel_allows(&client_reply, &other_gate));
        assert!(!gate.callback_channel_allows(&client_reply, &server));

        let server_reply = callback(RpcType::ServerInside);
        assert!(gate.callback_channel_allows(&server_reply, &server));
        assert!(!gate.callback_channel_allows(&server_reply, &RouteDecision::ForwardToClient(3)));
    }

    #[tokio::test]
    async fn test_open_without_client_port_is_ignored() {
        let gate = gate();
        gate.open_clients();
        assert!(!gate.clients_open.load(Ordering::Acquire));
    }
}
