//! # Mailbox Routing
//!
//! Decides where an RPC, callback or sync list goes next, based purely on
//! mailbox comparison against what the instance knows about itself and its
//! peers.
//!
//! ## Rules
//!
//! 1. Target id equals the instance's own mailbox id: handle on the root entity
//! 2. Target id is a registered local entity or cell: dispatch locally
//! 3. On a gate, target id is a bound client: forward on that client connection
//! 4. On a gate, match the target's address against the other gates, then the
//!    servers, then the service manager
//! 5. On a server or service manager, anything else goes to the first
//!    connected gate
//!
//! Anything left over is unroutable: logged and dropped.

use crate::transport::ConnectionId;
use mesh_core::protocol::InstanceRole;
use mesh_core::MailBox;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::warn;

/// Where a message goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// The instance's own root entity
    Local,
    /// A registered entity or cell on this instance
    LocalEntity(String),
    /// A client bound to this gate
    ForwardToClient(ConnectionId),
    ForwardToGate(MailBox),
    ForwardToServer(MailBox),
    ForwardToService(MailBox),
    /// Servers forward everything non-local through a gate
    DefaultGate(MailBox),
    Unroutable,
}

impl RouteDecision {
    pub fn is_local(&self) -> bool {
        matches!(self, RouteDecision::Local | RouteDecision::LocalEntity(_))
    }
}

/// What the router needs to know about instance state it does not own.
pub trait RouteContext {
    fn is_local_entity(&self, id: &str) -> bool;

    /// Connection of the client bound to entity `id`, gates only.
    fn client_connection(&self, id: &str) -> Option<ConnectionId>;

    /// Whether a live connection to the instance at `mailbox`'s address exists.
    fn is_connected(&self, mailbox: &MailBox) -> bool;
}

/// Known cluster membership of one instance.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub role: InstanceRole,
    pub mailbox: MailBox,
    pub gates: Vec<MailBox>,
    pub servers: Vec<MailBox>,
    pub service_manager: Option<MailBox>,
}

impl RoutingTable {
    pub fn new(role: InstanceRole, mailbox: MailBox) -> Self {
        Self {
            role,
            mailbox,
            gates: Vec::new(),
            servers: Vec::new(),
            service_manager: None,
        }
    }

    /// Replaces the entry with the same id, or appends.
    pub fn upsert_gate(&mut self, mailbox: MailBox) {
        upsert(&mut self.gates, mailbox);
    }

    pub fn upsert_server(&mut self, mailbox: MailBox) {
        upsert(&mut self.servers, mailbox);
    }

    /// Gates other than this instance.
    pub fn peer_gates(&self) -> impl Iterator<Item = &MailBox> {
        self.gates.iter().filter(move |g| !g.compare_only_id(&self.mailbox))
    }

    /// Routes a message addressed to `target`.
    pub fn route(&self, target: &MailBox, ctx: &dyn RouteContext) -> RouteDecision {
        if target.compare_only_id(&self.mailbox) {
            return RouteDecision::Local;
        }
        if ctx.is_local_entity(&target.id) {
            return RouteDecision::LocalEntity(target.id.clone());
        }

        match self.role {
            InstanceRole::Gate => self.route_from_gate(target, ctx),
            // Addressed here but not known here; a gate would only send it back.
            InstanceRole::Server | InstanceRole::ServiceManager if target.compare_only_address(&self.mailbox) => {
                RouteDecision::Unroutable
            }
            InstanceRole::Server | InstanceRole::ServiceManager => self.default_gate(ctx),
            InstanceRole::HostManager | InstanceRole::Client => RouteDecision::Unroutable,
        }
    }

    fn route_from_gate(&self, target: &MailBox, ctx: &dyn RouteContext) -> RouteDecision {
        if let Some(conn) = ctx.client_connection(&target.id) {
            return RouteDecision::ForwardToClient(conn);
        }
        // Addressed here but not known here.
        if target.compare_only_address(&self.mailbox) {
            return RouteDecision::Unroutable;
        }
        if let Some(gate) = self.peer_gates().find(|g| g.compare_only_address(target)) {
            return RouteDecision::ForwardToGate(gate.clone());
        }
        if let Some(server) = self.servers.iter().find(|s| s.compare_only_address(target)) {
            return RouteDecision::ForwardToServer(server.clone());
        }
        if let Some(sm) = self.service_manager.as_ref().filter(|sm| sm.compare_only_address(target)) {
            return RouteDecision::ForwardToService(sm.clone());
        }
        RouteDecision::Unroutable
    }

    fn default_gate(&self, ctx: &dyn RouteContext) -> RouteDecision {
        self.gates
            .iter()
            .find(|g| ctx.is_connected(g))
            .map(|g| RouteDecision::DefaultGate(g.clone()))
            .unwrap_or(RouteDecision::Unroutable)
    }
}

fn upsert(list: &mut Vec<MailBox>, mailbox: MailBox) {
    match list.iter_mut().find(|m| m.compare_only_id(&mailbox)) {
        Some(existing) => *existing = mailbox,
        None => list.push(mailbox),
    }
}

/// Counters exposed for monitoring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Messages handled on this instance
    pub local: u64,
    /// Messages sent on to another connection
    pub forwarded: u64,
    /// Unroutable messages and failed forwards
    pub dropped: u64,
}

/// Shared routing table plus counters.
#[derive(Debug)]
pub struct RpcRouter {
    table: RwLock<RoutingTable>,
    local: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl RpcRouter {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table: RwLock::new(table),
            local: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Routes `target` and records the outcome in the stats.
    ///
    /// An unroutable target is logged here; callers just drop the message.
    pub fn route(&self, what: &str, target: &MailBox, ctx: &dyn RouteContext) -> RouteDecision {
        let decision = self.read(|table| table.route(target, ctx));
        match &decision {
            RouteDecision::Local | RouteDecision::LocalEntity(_) => {
                self.local.fetch_add(1, Ordering::Relaxed);
            }
            RouteDecision::Unroutable => {
                warn!("🚫 Unroutable {} for {}, dropping", what, target);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
        }
        decision
    }

    /// Records a forward that failed after routing succeeded.
    pub fn record_failed_forward(&self) {
        self.forwarded.fetch_sub(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read<R>(&self, f: impl FnOnce(&RoutingTable) -> R) -> R {
        f(&self.table.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut RoutingTable) -> R) -> R {
        f(&mut self.table.write().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            local: self.local.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Ctx {
        entities: Vec<String>,
        clients: HashMap<String, ConnectionId>,
        connected: Vec<String>,
    }

    impl RouteContext for Ctx {
        fn is_local_entity(&self, id: &str) -> bool {
            self.entities.iter().any(|e| e == id)
        }

        fn client_connection(&self, id: &str) -> Option<ConnectionId> {
            self.clients.get(id).copied()
        }

        fn is_connected(&self, mailbox: &MailBox) -> bool {
            self.connected.contains(&mailbox.id)
        }
    }

    fn gate_table() -> RoutingTable {
        let mut table = RoutingTable::new(InstanceRole::Gate, MailBox::new("gate_0", "10.0.0.1", 7100, 1));
        table.upsert_gate(MailBox::new("gate_0", "10.0.0.1", 7100, 1));
        table.upsert_gate(MailBox::new("gate_1", "10.0.0.2", 7100, 1));
        table.upsert_server(MailBox::new("server_0", "10.0.1.1", 7300, 1));
        table.upsert_server(MailBox::new("server_1", "10.0.1.2", 7300, 1));
        table.service_manager = Some(MailBox::new("service_manager", "10.0.2.1", 7400, 1));
        table
    }

    #[test]
    fn test_gate_routing_order() {
        let table = gate_table();
        let mut ctx = Ctx::default();
        ctx.entities.push("lobby".to_string());
        ctx.clients.insert("player_9".to_string(), 42);

        let route = |id: &str, ip: &str, port: u16| table.route(&MailBox::new(id, ip, port, 1), &ctx);

        assert_eq!(route("gate_0", "0.0.0.0", 1), RouteDecision::Local);
        assert_eq!(route("lobby", "10.0.0.1", 7100), RouteDecision::LocalEntity("lobby".to_string()));
        assert_eq!(route("player_9", "10.0.0.1", 7100), RouteDecision::ForwardToClient(42));
        assert_eq!(route("ghost", "10.0.0.1", 7100), RouteDecision::Unroutable);
        assert!(matches!(route("npc", "10.0.0.2", 7100), RouteDecision::ForwardToGate(g) if g.id == "gate_1"));
        assert!(matches!(route("avatar", "10.0.1.2", 7300), RouteDecision::ForwardToServer(s) if s.id == "server_1"));
        assert!(matches!(route("shard_3", "10.0.2.1", 7400), RouteDecision::ForwardToService(_)));
        assert_eq!(route("avatar", "10.9.9.9", 7300), RouteDecision::Unroutable);
    }

    #[test]
    fn test_server_redirects_through_first_connected_gate() {
        let mut table = RoutingTable::new(InstanceRole::Server, MailBox::new("server_0", "10.0.1.1", 7300, 1));
        table.upsert_gate(MailBox::new("gate_0", "10.0.0.1", 7100, 1));
        table.upsert_gate(MailBox::new("gate_1", "10.0.0.2", 7100, 1));
        let mut ctx = Ctx::default();

        let target = MailBox::new("avatar", "10.0.1.2", 7300, 1);
        assert_eq!(table.route(&target, &ctx), RouteDecision::Unroutable);

        ctx.connected.push("gate_1".to_string());
        assert!(matches!(table.route(&target, &ctx), RouteDecision::DefaultGate(g) if g.id == "gate_1"));

        ctx.connected.push("gate_0".to_string());
        assert!(matches!(table.route(&target, &ctx), RouteDecision::DefaultGate(g) if g.id == "gate_0"));
    }

    #[test]
    fn test_unknown_local_entity_is_not_bounced_through_a_gate() {
        let server_mb = MailBox::new("server_0", "10.0.1.1", 7300, 1);
        let mut server = RoutingTable::new(InstanceRole::Server, server_mb.clone());
        server.upsert_gate(MailBox::new("gate_0", "10.0.0.1", 7100, 1));
        let mut ctx = Ctx::default();
        ctx.connected.push("gate_0".to_string());

        let destroyed = server_mb.with_id("destroyed_avatar");
        assert_eq!(server.route(&destroyed, &ctx), RouteDecision::Unroutable);

        ctx.entities.push("destroyed_avatar".to_string());
        assert_eq!(
            server.route(&destroyed, &ctx),
            RouteDecision::LocalEntity("destroyed_avatar".to_string())
        );

        let sm_mb = MailBox::new("service_manager", "10.0.2.1", 7400, 1);
        let mut sm = RoutingTable::new(InstanceRole::ServiceManager, sm_mb.clone());
        sm.upsert_gate(MailBox::new("gate_0", "10.0.0.1", 7100, 1));
        assert_eq!(sm.route(&sm_mb.with_id("gone"), &Ctx::default()), RouteDecision::Unroutable);
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut table = gate_table();
        table.upsert_server(MailBox::new("server_1", "10.0.1.2", 7999, 1));
        assert_eq!(table.servers.len(), 2);
        assert_eq!(table.servers[1].port, 7999);
        assert_eq!(table.peer_gates().count(), 1);
    }

    #[test]
    fn test_router_stats() {
        let router = RpcRouter::new(gate_table());
        let ctx = Ctx::default();
        router.route("rpc", &MailBox::new("gate_0", "x", 1, 1), &ctx);
        router.route("rpc", &MailBox::new("avatar", "10.0.1.1", 7300, 1), &ctx);
        router.route("rpc", &MailBox::new("nobody", "1.1.1.1", 1, 1), &ctx);
        router.record_failed_forward();

        let stats = router.stats();
        assert_eq!(stats.local, 1);
        assert_eq!(stats.forwarded, 0);
        assert_eq!(stats.dropped, 2);
    }
}
