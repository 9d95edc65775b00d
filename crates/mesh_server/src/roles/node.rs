//! State shared by every mesh participant.
//!
//! A [`Node`] owns the instance's transport, routing table, local entities
//! and outstanding calls. The role driver feeds it packages; entity
//! handlers reach it through [`Node::call`] to talk to the rest of the mesh.

use crate::cluster::bootstrap::{BootstrapState, ClusterView};
use crate::dispatcher::LocalDispatcher;
use crate::entity::{EntityKind, EntityRegistry, LocalEntity, RpcMethodTable};
use crate::error::ClusterError;
use crate::routing::{RouteContext, RouteDecision, RouterStats, RoutingTable, RpcRouter};
use crate::transport::{ConnectionId, ConnectionKind, Transport};
use dashmap::DashMap;
use mesh_core::protocol::{Handshake, Heartbeat, InstanceRole, PropertySync};
use mesh_core::rpc::{EntityRpc, EntityRpcCallBack, PendingCall, RpcAuthority, RpcCallRegistry};
use mesh_core::sync::{PropertySyncCommandList, TimeCircleHandle};
use mesh_core::{MailBox, Package, RpcError};
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// `(ip, port, host_num)` of an instance; the key for peer connections.
pub(crate) type PeerAddress = (String, u16, u32);

pub(crate) fn peer_address(mailbox: &MailBox) -> PeerAddress {
    (mailbox.ip.clone(), mailbox.port, mailbox.host_num)
}

const DIAL_BACKOFF_START: Duration = Duration::from_millis(100);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// A gate, server or service manager.
pub struct Node {
    pub(crate) role: InstanceRole,
    pub(crate) mailbox: MailBox,
    pub(crate) transport: Arc<Transport>,
    router: RpcRouter,
    entities: EntityRegistry,
    root: Arc<LocalEntity>,
    dispatcher: LocalDispatcher,
    calls: RpcCallRegistry,
    /// Per-entity serial queue; RPCs to one entity run one at a time, in arrival order
    inboxes: DashMap<String, mpsc::UnboundedSender<(Arc<LocalEntity>, EntityRpc)>>,
    /// Connection used to send to each peer instance
    peers: DashMap<PeerAddress, ConnectionId>,
    /// Gate only: bound client id -> client connection
    pub(crate) clients: DashMap<String, ConnectionId>,
    pub(crate) client_address: Option<String>,
    pub(crate) clients_open: AtomicBool,
    pub(crate) sync: Option<TimeCircleHandle>,
    pub(crate) default_delay_ms: u64,
    state: watch::Sender<BootstrapState>,
}

/// Construction parameters for a [`Node`].
pub(crate) struct NodeParts {
    pub role: InstanceRole,
    pub mailbox: MailBox,
    pub transport: Arc<Transport>,
    pub report_errors: bool,
    pub client_address: Option<String>,
    pub sync: Option<TimeCircleHandle>,
    pub default_delay_ms: u64,
}

impl Node {
    pub(crate) fn new(parts: NodeParts) -> Arc<Self> {
        let (state, _) = watch::channel(BootstrapState::Connecting);
        Arc::new_cyclic(|weak: &Weak<Node>| {
            let root = Arc::new(LocalEntity::new(
                parts.mailbox.clone(),
                EntityKind::Root,
                root_methods(weak.clone()),
            ));
            Node {
                role: parts.role,
                router: RpcRouter::new(RoutingTable::new(parts.role, parts.mailbox.clone())),
                mailbox: parts.mailbox,
                transport: parts.transport,
                entities: EntityRegistry::new(),
                root,
                dispatcher: LocalDispatcher::new(parts.report_errors),
                calls: RpcCallRegistry::new(),
                inboxes: DashMap::new(),
                peers: DashMap::new(),
                clients: DashMap::new(),
                client_address: parts.client_address,
                clients_open: AtomicBool::new(false),
                sync: parts.sync,
                default_delay_ms: parts.default_delay_ms,
                state,
            }
        })
    }

    pub fn role(&self) -> InstanceRole {
        self.role
    }

    pub fn mailbox(&self) -> &MailBox {
        &self.mailbox
    }

    /// Watches the bootstrap state; `Running` once the instance has joined.
    pub fn state(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    pub(crate) fn publish_state(&self, state: BootstrapState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    pub fn register_entity(&self, entity: Arc<LocalEntity>) {
        self.entities.register(entity);
    }

    /// Removes a local entity and stops its dispatch queue once drained.
    pub fn remove_entity(&self, id: &str) -> Option<Arc<LocalEntity>> {
        self.inboxes.remove(id);
        self.entities.unregister(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Calls an entity anywhere in the mesh.
    ///
    /// # Returns
    ///
    /// The pending result for awaited calls, `None` for notify-only ones.
    ///
    /// # Errors
    ///
    /// [`RpcError::UnroutableTarget`] when the target cannot be reached from
    /// this instance.
    pub fn call(self: &Arc<Self>, mut rpc: EntityRpc) -> Result<Option<PendingCall>, RpcError> {
        let pending = self.calls.prepare(&mut rpc);
        let target = rpc.target.clone();
        if self.deliver_rpc(rpc) {
            Ok(pending)
        } else {
            if let Some(pending) = &pending {
                self.calls.cancel(pending.rpc_id);
            }
            Err(RpcError::UnroutableTarget(target.to_string()))
        }
    }

    /// Routes an RPC; local targets go through their entity's dispatch queue.
    pub(crate) fn deliver_rpc(self: &Arc<Self>, rpc: EntityRpc) -> bool {
        let decision = self.router.route("rpc", &rpc.target, self.as_ref());
        match decision {
            RouteDecision::Local => {
                self.dispatch_local(self.root.clone(), rpc);
                true
            }
            RouteDecision::LocalEntity(id) => match self.entities.get(&id) {
                Some(entity) => {
                    self.dispatch_local(entity, rpc);
                    true
                }
                None => {
                    warn!("🚫 Entity '{}' left before rpc '{}' arrived", id, rpc.method_name);
                    false
                }
            },
            RouteDecision::Unroutable => false,
            forward => self.forward(&forward, &Package::EntityRpc(rpc)),
        }
    }

    fn dispatch_local(self: &Arc<Self>, entity: Arc<LocalEntity>, rpc: EntityRpc) {
        let id = entity.id().to_string();
        let mut job = (entity, rpc);
        for _ in 0..2 {
            let inbox = self
                .inboxes
                .entry(id.clone())
                .or_insert_with(|| self.spawn_inbox(&id))
                .clone();
            match inbox.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // The worker is gone; start a fresh one.
                    self.inboxes.remove_if(&id, |_, tx| tx.same_channel(&inbox));
                    job = returned;
                }
            }
        }
        warn!("🚫 No dispatch queue for '{}', dropping rpc '{}'", id, job.1.method_name);
    }

    fn spawn_inbox(self: &Arc<Self>, id: &str) -> mpsc::UnboundedSender<(Arc<LocalEntity>, EntityRpc)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Arc<LocalEntity>, EntityRpc)>();
        let node = Arc::downgrade(self);
        let id = id.to_string();
        tokio::spawn(async move {
            while let Some((entity, rpc)) = rx.recv().await {
                let Some(node) = node.upgrade() else {
                    break;
                };
                if let Some(callback) = node.dispatcher.dispatch(entity, rpc).await {
                    node.deliver_callback(callback);
                }
            }
            debug!("Dispatch queue for '{}' closed", id);
        });
        tx
    }

    /// Completes a local caller or sends the callback on.
    pub(crate) fn deliver_callback(&self, callback: EntityRpcCallBack) {
        let decision = self.router.route("callback", &callback.target, self);
        match decision {
            RouteDecision::Local | RouteDecision::LocalEntity(_) => {
                self.calls.complete(callback);
            }
            RouteDecision::Unroutable => {}
            forward => {
                if !self.callback_channel_allows(&callback, &forward) {
                    warn!(
                        "🚫 {} reply for rpc {} would leave on the wrong channel ({:?}), dropping",
                        callback.rpc_type, callback.rpc_id, forward
                    );
                    self.router.record_failed_forward();
                    return;
                }
                self.forward(&forward, &Package::EntityRpcCallBack(callback));
            }
        }
    }

    /// Sends a released sync list towards its subscriber.
    pub(crate) fn deliver_sync(&self, target: MailBox, commands: PropertySyncCommandList) {
        match self.router.route("property sync", &target, self) {
            RouteDecision::LocalEntity(id) => self.apply_sync(&id, &commands),
            RouteDecision::Local => {
                warn!("⚠️ Property sync addressed to the {} root, dropping", self.role);
            }
            RouteDecision::Unroutable => {}
            forward => {
                self.forward(&forward, &Package::PropertySync(PropertySync { target, commands }));
            }
        }
    }

    fn apply_sync(&self, id: &str, commands: &PropertySyncCommandList) {
        let Some(entity) = self.entities.get(id) else {
            return;
        };
        match entity.with_tree(|tree| tree.apply_sync_commands(commands)) {
            Some(Ok(())) => debug!("🔁 Applied {} sync command(s) to '{}'", commands.commands.len(), id),
            Some(Err(e)) => error!("❌ Could not apply sync commands to '{}': {}", id, e),
            None => warn!("⚠️ Property sync for '{}', which has no properties", id),
        }
    }

    /// Sends `package` on the connection a routing decision points at.
    pub(crate) fn forward(&self, decision: &RouteDecision, package: &Package) -> bool {
        let conn = match decision {
            RouteDecision::ForwardToClient(conn) => Some(*conn),
            RouteDecision::ForwardToGate(mailbox)
            | RouteDecision::ForwardToServer(mailbox)
            | RouteDecision::ForwardToService(mailbox)
            | RouteDecision::DefaultGate(mailbox) => self.peers.get(&peer_address(mailbox)).map(|c| *c),
            RouteDecision::Local | RouteDecision::LocalEntity(_) | RouteDecision::Unroutable => None,
        };

        let result = match conn {
            Some(conn) => self.transport.send(conn, package).map_err(|e| e.to_string()),
            None => Err(ClusterError::NoPeerConnection(format!("{decision:?}")).to_string()),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("📤 Failed to forward {:?} ({:?}): {}", package.package_type(), decision, e);
                self.router.record_failed_forward();
                false
            }
        }
    }

    /// Handles a package from any connection other than the host manager's.
    ///
    /// # Returns
    ///
    /// The peer whose handshake completed with this package, if any.
    pub(crate) fn handle_package(self: &Arc<Self>, conn: ConnectionId, package: Package) -> Option<MailBox> {
        let from_client = self
            .transport
            .connection(conn)
            .is_some_and(|c| c.kind == ConnectionKind::Client);

        match package {
            Package::Handshake(handshake) if from_client => {
                self.accept_client(conn, handshake);
                None
            }
            Package::Handshake(handshake) => self.on_handshake(conn, handshake),
            Package::EntityRpc(rpc) if from_client => {
                self.client_rpc(conn, rpc);
                None
            }
            Package::EntityRpc(rpc) => {
                self.deliver_rpc(rpc);
                None
            }
            Package::EntityRpcCallBack(callback) if !from_client => {
                self.deliver_callback(callback);
                None
            }
            Package::PropertySync(sync) if !from_client => {
                self.deliver_sync(sync.target, sync.commands);
                None
            }
            Package::Ping(_) => {
                let pong = Package::Pong(Heartbeat {
                    sender: self.mailbox.clone(),
                });
                if let Err(e) = self.transport.send(conn, &pong) {
                    debug!("Could not answer ping on {}: {}", conn, e);
                }
                None
            }
            Package::Pong(_) => None,
            other => {
                warn!(
                    "⚠️ {} ignoring {:?} on connection {}",
                    self.role,
                    other.package_type(),
                    conn
                );
                None
            }
        }
    }

    fn on_handshake(&self, conn: ConnectionId, handshake: Handshake) -> Option<MailBox> {
        let connection = self.transport.connection(conn)?;
        let address = peer_address(&handshake.mailbox);
        connection.set_peer(handshake.mailbox.clone());

        if handshake.ack {
            // Our own dial: preferred for sending.
            self.peers.insert(address, conn);
        } else {
            self.peers.entry(address).or_insert(conn);
            let ack = Package::Handshake(Handshake {
                mailbox: self.mailbox.clone(),
                role: self.role,
                ack: true,
            });
            if let Err(e) = connection.send(&ack) {
                warn!("🤝 Could not acknowledge handshake from {}: {}", handshake.mailbox, e);
                return None;
            }
        }
        info!("🤝 Connected to {} {}", handshake.role, handshake.mailbox);
        Some(handshake.mailbox)
    }

    /// Applies the membership announced by the host manager.
    pub(crate) fn apply_view(&self, view: &ClusterView) {
        self.router.update(|table| {
            table.gates = view.gates.clone();
            table.servers = view.servers.clone();
            table.service_manager = view.service_manager.clone();
        });
    }

    /// Opens a connection to `target` and introduces this instance, retrying
    /// until it succeeds or `stop` fires.
    pub(crate) fn dial(self: &Arc<Self>, target: MailBox, stop: CancellationToken) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = DIAL_BACKOFF_START;
            loop {
                match node.transport.connect(&target.socket_address()).await {
                    Ok(connection) => {
                        let hello = Package::Handshake(Handshake {
                            mailbox: node.mailbox.clone(),
                            role: node.role,
                            ack: false,
                        });
                        if let Err(e) = connection.send(&hello) {
                            warn!("🤝 Handshake to {} failed: {}", target, e);
                        }
                        return;
                    }
                    Err(e) => {
                        debug!("Dial {} failed ({}), retrying in {:?}", target, e, backoff);
                        tokio::select! {
                            _ = stop.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(DIAL_BACKOFF_MAX);
                    }
                }
            }
        });
    }

    /// Drops connections to the old incarnation of `target` and dials the new one.
    pub(crate) fn reconnect_peer(self: &Arc<Self>, target: MailBox, stop: CancellationToken) {
        let stale: Vec<(PeerAddress, ConnectionId)> = self
            .peers
            .iter()
            .filter(|entry| {
                self.transport
                    .connection(*entry.value())
                    .and_then(|c| c.peer())
                    .is_some_and(|peer| peer.compare_only_id(&target))
            })
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for (address, conn) in stale {
            self.peers.remove(&address);
            self.transport.close(conn);
        }
        self.dial(target, stop);
    }

    /// Forgets a closed connection.
    pub(crate) fn on_disconnect(&self, conn: ConnectionId) {
        let mut lost = Vec::new();
        self.peers.retain(|address, c| {
            if *c == conn {
                lost.push(address.clone());
                false
            } else {
                true
            }
        });

        for address in lost {
            // Fall back to another live connection with the same peer.
            let replacement = self.transport.connections().ids().into_iter().find(|id| {
                self.transport
                    .connection(*id)
                    .and_then(|c| c.peer())
                    .is_some_and(|peer| peer_address(&peer) == address)
            });
            match replacement {
                Some(other) => {
                    self.peers.insert(address, other);
                }
                None => warn!("🔌 Lost connection to peer {}:{}#{}", address.0, address.1, address.2),
            }
        }

        self.clients.retain(|id, c| {
            if *c == conn {
                info!("👋 Client '{}' disconnected", id);
                false
            } else {
                true
            }
        });
    }
}

impl RouteContext for Node {
    fn is_local_entity(&self, id: &str) -> bool {
        self.entities.contains(id)
    }

    fn client_connection(&self, id: &str) -> Option<ConnectionId> {
        self.clients.get(id).map(|c| *c)
    }

    fn is_connected(&self, mailbox: &MailBox) -> bool {
        self.peers
            .get(&peer_address(mailbox))
            .and_then(|conn| self.transport.connection(*conn))
            .is_some_and(|c| c.is_connected())
    }
}

/// Methods every instance root answers.
fn root_methods(node: Weak<Node>) -> RpcMethodTable {
    RpcMethodTable::new().with(
        "describe",
        RpcAuthority::SERVER_ONLY | RpcAuthority::CLIENT_STUB,
        move |_, _| {
            let node = node.upgrade();
            async move {
                let node = node.ok_or_else(|| RpcError::InvocationFailed("instance is shutting down".to_string()))?;
                let stats = node.router_stats();
                Ok::<_, RpcError>(json!({
                    "role": node.role.to_string(),
                    "mailbox": node.mailbox,
                    "entities": node.entities.len(),
                    "peers": node.peer_count(),
                    "clients": node.client_count(),
                    "router": {
                        "local": stats.local,
                        "forwarded": stats.forwarded,
                        "dropped": stats.dropped,
                    },
                }))
            }
        },
    )
}
