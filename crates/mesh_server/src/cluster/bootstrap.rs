//! Instance side of cluster registration.
//!
//! ```text
//! Connecting -> AwaitingRegistrationAck -> AwaitingMailboxSync -> Running
//!     \-> Restarting -> AwaitingReconnect -> Running
//! ```
//!
//! [`BootstrapCore`] turns host manager traffic and peer handshakes into
//! [`BootstrapAction`]s for the role driver to carry out. Gates dial every
//! server, every other gate and the service manager; servers and the
//! service manager only accept. A restarted server or service manager is
//! reconnected once every gate has handshaken with it again, or when the
//! driver's reconnect deadline passes, whichever comes first.

use crate::error::ClusterError;
use mesh_core::protocol::{Control, ControlMessage, HostCommand, HostCommandType, InstanceRole};
use mesh_core::{MailBox, Package};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapState {
    Connecting,
    AwaitingRegistrationAck,
    /// Registered; waiting for the sync bundle and then for peer connections
    AwaitingMailboxSync,
    /// Sent `Restart`; waiting for the sync bundle
    Restarting,
    /// Bundle received after a restart; re-establishing peer connections
    AwaitingReconnect,
    Running,
    Stopped,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The cluster membership as announced by the host manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterView {
    pub gates: Vec<MailBox>,
    pub servers: Vec<MailBox>,
    pub service_manager: Option<MailBox>,
}

/// Work for the role driver.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapAction {
    /// Send on the host manager connection
    SendToHost(Package),
    /// Replace the routing table's membership
    ApplyView(ClusterView),
    /// Dial each of these instances and handshake
    ConnectPeers(Vec<MailBox>),
    /// Drop any connection to this instance's old address and dial the new one
    ReconnectPeer(MailBox),
    /// Start accepting clients
    Open,
    EnterRunning,
    Stop,
}

const GOT_GATES: u8 = 1;
const GOT_SERVERS: u8 = 1 << 1;
const GOT_SERVICE_MANAGER: u8 = 1 << 2;
const GOT_BUNDLE: u8 = GOT_GATES | GOT_SERVERS | GOT_SERVICE_MANAGER;

#[derive(Debug)]
pub struct BootstrapCore {
    role: InstanceRole,
    mailbox: MailBox,
    state: BootstrapState,
    restarted: bool,
    view: ClusterView,
    incoming: ClusterView,
    received: u8,
    pending_peers: HashSet<String>,
    open_requested: bool,
}

impl BootstrapCore {
    pub fn new(role: InstanceRole, mailbox: MailBox) -> Self {
        Self {
            role,
            mailbox,
            state: BootstrapState::Connecting,
            restarted: false,
            view: ClusterView::default(),
            incoming: ClusterView::default(),
            received: 0,
            pending_peers: HashSet::new(),
            open_requested: false,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    /// Instances still expected to handshake before the next `Running`.
    pub fn pending_peers(&self) -> usize {
        self.pending_peers.len()
    }

    /// The host manager connection is up: register.
    ///
    /// `restart` sends `Restart` instead of `Ready`, for an instance that
    /// was part of the cluster before.
    pub fn on_host_connected(&mut self, restart: bool) -> Vec<BootstrapAction> {
        self.restarted = restart;
        self.received = 0;
        self.incoming = ClusterView::default();
        let message = if restart {
            self.state = BootstrapState::Restarting;
            ControlMessage::Restart
        } else {
            self.state = BootstrapState::AwaitingRegistrationAck;
            ControlMessage::Ready
        };
        info!("📝 Registering {} {} with the host manager ({:?})", self.role, self.mailbox, message);
        vec![BootstrapAction::SendToHost(self.control(message))]
    }

    /// The host manager connection dropped. The next connection re-registers
    /// with `Restart`.
    pub fn on_host_lost(&mut self) {
        if self.state == BootstrapState::Stopped {
            return;
        }
        warn!("⚠️ {} while {}", ClusterError::HostManagerLost, self.state);
        self.state = BootstrapState::Connecting;
    }

    pub fn on_control(&mut self, control: &Control) -> Vec<BootstrapAction> {
        match (control.message, self.state) {
            (ControlMessage::Ready, BootstrapState::AwaitingRegistrationAck) => {
                info!("✅ Registered with the host manager, waiting for the cluster");
                self.state = BootstrapState::AwaitingMailboxSync;
            }
            (ControlMessage::Ready, BootstrapState::Restarting) => {
                // The cluster had not formed yet; this is a plain registration.
                info!("✅ Restart accepted as a fresh registration");
                self.restarted = false;
                self.state = BootstrapState::AwaitingMailboxSync;
            }
            (ControlMessage::Ready, _) => {
                debug!("Registration ack while {}", self.state);
            }
            (ControlMessage::WaitForReconnect, BootstrapState::Restarting) => {
                info!("⏳ Another instance is restarting, waiting for our turn");
            }
            (message, state) => {
                let err = ClusterError::UnexpectedMessage {
                    message: format!("{:?} from {}", message, control.mailbox),
                    state: state.to_string(),
                };
                warn!("⚠️ {}", err);
            }
        }
        Vec::new()
    }

    pub fn on_host_command(&mut self, command: &HostCommand) -> Vec<BootstrapAction> {
        match command.kind {
            HostCommandType::SyncGates => {
                self.incoming.gates = command.args.clone();
                self.receive(GOT_GATES)
            }
            HostCommandType::SyncServers => {
                self.incoming.servers = command.args.clone();
                self.receive(GOT_SERVERS)
            }
            HostCommandType::SyncServiceManager => {
                let service_manager = command.args.first().cloned();
                if self.state == BootstrapState::Running && self.received == 0 {
                    // Standalone update: the service manager moved.
                    return self.service_manager_moved(service_manager);
                }
                self.incoming.service_manager = service_manager;
                self.receive(GOT_SERVICE_MANAGER)
            }
            HostCommandType::ReconnectServer => {
                let mut actions = Vec::new();
                for server in &command.args {
                    upsert(&mut self.view.servers, server.clone());
                    if self.role == InstanceRole::Gate {
                        info!("🔄 Server {} restarted, reconnecting", server);
                        actions.push(BootstrapAction::ReconnectPeer(server.clone()));
                    }
                }
                actions.insert(0, BootstrapAction::ApplyView(self.view.clone()));
                actions
            }
            HostCommandType::ReconnectGate => {
                let mut actions = Vec::new();
                for gate in &command.args {
                    if gate.compare_only_id(&self.mailbox) {
                        continue;
                    }
                    upsert(&mut self.view.gates, gate.clone());
                    if self.role == InstanceRole::Gate {
                        info!("🔄 Gate {} restarted, reconnecting", gate);
                        actions.push(BootstrapAction::ReconnectPeer(gate.clone()));
                    }
                }
                actions.insert(0, BootstrapAction::ApplyView(self.view.clone()));
                actions
            }
            HostCommandType::Open => {
                if self.state == BootstrapState::Running {
                    vec![BootstrapAction::Open]
                } else {
                    debug!("Open received while {}, deferring", self.state);
                    self.open_requested = true;
                    Vec::new()
                }
            }
            HostCommandType::Stop => {
                info!("🛑 Host manager stopped the cluster");
                self.state = BootstrapState::Stopped;
                vec![BootstrapAction::Stop]
            }
        }
    }

    /// A peer finished its handshake with this instance.
    pub fn on_peer_connected(&mut self, peer: &MailBox) -> Vec<BootstrapAction> {
        if !self.pending_peers.remove(&peer.id) {
            return Vec::new();
        }
        debug!("🤝 {} connected, {} peer(s) to go", peer, self.pending_peers.len());
        if self.pending_peers.is_empty()
            && matches!(self.state, BootstrapState::AwaitingMailboxSync | BootstrapState::AwaitingReconnect)
            && self.received == GOT_BUNDLE
        {
            return self.enter_running();
        }
        Vec::new()
    }

    /// The reconnect deadline passed with peers still missing. Finishes the
    /// restart without them so the host manager can move on; they are
    /// expected to dial in once they come back.
    pub fn reconnect_timed_out(&mut self) -> Vec<BootstrapAction> {
        if self.state != BootstrapState::AwaitingReconnect {
            return Vec::new();
        }
        let mut missing: Vec<String> = self.pending_peers.drain().collect();
        missing.sort();
        warn!(
            "⏰ {} peer(s) did not reconnect in time, finishing the restart without them: {}",
            missing.len(),
            missing.join(", ")
        );
        self.enter_running()
    }

    /// Graceful leave: `ShutDown` to the host manager.
    pub fn leave(&mut self) -> Vec<BootstrapAction> {
        let was_registered = !matches!(self.state, BootstrapState::Connecting | BootstrapState::Stopped);
        self.state = BootstrapState::Stopped;
        if was_registered {
            vec![BootstrapAction::SendToHost(self.control(ControlMessage::ShutDown))]
        } else {
            Vec::new()
        }
    }

    fn receive(&mut self, bit: u8) -> Vec<BootstrapAction> {
        self.received |= bit;
        if self.received != GOT_BUNDLE {
            return Vec::new();
        }

        match self.state {
            BootstrapState::AwaitingMailboxSync | BootstrapState::Restarting => self.bundle_complete(),
            BootstrapState::Running => {
                // Resent bundle, e.g. after a duplicate registration.
                let added = self.new_peers(&self.incoming);
                self.view = std::mem::take(&mut self.incoming);
                self.received = 0;
                let mut actions = vec![BootstrapAction::ApplyView(self.view.clone())];
                if !added.is_empty() {
                    actions.push(BootstrapAction::ConnectPeers(added));
                }
                actions
            }
            state => {
                warn!("⚠️ Mailbox sync while {}, ignoring", state);
                self.received = 0;
                Vec::new()
            }
        }
    }

    fn bundle_complete(&mut self) -> Vec<BootstrapAction> {
        self.view = std::mem::take(&mut self.incoming);
        info!(
            "📬 Cluster view: {} gate(s), {} server(s), service manager {}",
            self.view.gates.len(),
            self.view.servers.len(),
            self.view
                .service_manager
                .as_ref()
                .map(|sm| sm.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        if self.state == BootstrapState::Restarting {
            self.state = BootstrapState::AwaitingReconnect;
        }

        let mut actions = vec![BootstrapAction::ApplyView(self.view.clone())];
        let peers = match self.role {
            InstanceRole::Gate => self.dial_targets(&self.view),
            // Gates come to us. Only a restart has to wait for them.
            _ if self.restarted => self.view.gates.clone(),
            _ => Vec::new(),
        };
        self.pending_peers = peers.iter().map(|p| p.id.clone()).collect();

        if self.role == InstanceRole::Gate && !peers.is_empty() {
            actions.push(BootstrapAction::ConnectPeers(peers));
        }
        if self.pending_peers.is_empty() {
            actions.extend(self.enter_running());
        }
        actions
    }

    fn enter_running(&mut self) -> Vec<BootstrapAction> {
        self.state = BootstrapState::Running;
        self.received = 0;
        info!("🚀 {} {} is running", self.role, self.mailbox);

        let mut actions = vec![BootstrapAction::EnterRunning];
        if self.restarted {
            self.restarted = false;
            actions.push(BootstrapAction::SendToHost(self.control(ControlMessage::ReconnectEnd)));
        }
        if std::mem::take(&mut self.open_requested) {
            actions.push(BootstrapAction::Open);
        }
        actions
    }

    fn service_manager_moved(&mut self, service_manager: Option<MailBox>) -> Vec<BootstrapAction> {
        self.view.service_manager = service_manager.clone();
        let mut actions = vec![BootstrapAction::ApplyView(self.view.clone())];
        if let (InstanceRole::Gate, Some(sm)) = (self.role, service_manager) {
            info!("🔄 Service manager now at {}, reconnecting", sm);
            actions.push(BootstrapAction::ReconnectPeer(sm));
        }
        actions
    }

    /// Instances a gate opens connections to.
    fn dial_targets(&self, view: &ClusterView) -> Vec<MailBox> {
        view.servers
            .iter()
            .chain(view.gates.iter().filter(|g| !g.compare_only_id(&self.mailbox)))
            .chain(view.service_manager.iter())
            .cloned()
            .collect()
    }

    fn new_peers(&self, incoming: &ClusterView) -> Vec<MailBox> {
        if self.role != InstanceRole::Gate {
            return Vec::new();
        }
        let known = self.dial_targets(&self.view);
        self.dial_targets(incoming)
            .into_iter()
            .filter(|p| !known.contains(p))
            .collect()
    }

    fn control(&self, message: ControlMessage) -> Package {
        Package::Control(Control {
            from: self.role,
            message,
            mailbox: self.mailbox.clone(),
        })
    }
}

fn upsert(list: &mut Vec<MailBox>, mailbox: MailBox) {
    match list.iter_mut().find(|m| m.compare_only_id(&mailbox)) {
        Some(existing) => *existing = mailbox,
        None => list.push(mailbox),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm() -> MailBox {
        MailBox::new("host_manager", "127.0.0.1", 9000, 1)
    }

    fn ack() -> Control {
        Control {
            from: InstanceRole::HostManager,
            message: ControlMessage::Ready,
            mailbox: hm(),
        }
    }

    fn bundle(gates: Vec<MailBox>, servers: Vec<MailBox>, sm: Option<MailBox>) -> Vec<HostCommand> {
        vec![
            HostCommand::new(HostCommandType::SyncGates, gates),
            HostCommand::new(HostCommandType::SyncServers, servers),
            HostCommand::new(HostCommandType::SyncServiceManager, sm.into_iter().collect()),
        ]
    }

    fn feed(core: &mut BootstrapCore, commands: Vec<HostCommand>) -> Vec<BootstrapAction> {
        commands.iter().flat_map(|c| core.on_host_command(c)).collect()
    }

    fn g0() -> MailBox {
        MailBox::new("gate_0", "127.0.0.1", 9100, 1)
    }
    fn g1() -> MailBox {
        MailBox::new("gate_1", "127.0.0.1", 9101, 1)
    }
    fn s0() -> MailBox {
        MailBox::new("server_0", "127.0.0.1", 9300, 1)
    }

    #[test]
    fn test_gate_bootstrap_waits_for_peers() {
        let mut core = BootstrapCore::new(InstanceRole::Gate, g0());
        let actions = core.on_host_connected(false);
        assert!(matches!(
            &actions[0],
            BootstrapAction::SendToHost(Package::Control(c)) if c.message == ControlMessage::Ready
        ));
        core.on_control(&ack());
        assert_eq!(core.state(), BootstrapState::AwaitingMailboxSync);

        // Open may race ahead of the peer connections.
        assert!(core
            .on_host_command(&HostCommand::new(HostCommandType::Open, Vec::new()))
            .is_empty());

        let actions = feed(&mut core, bundle(vec![g0(), g1()], vec![s0()], None));
        let dialed = actions
            .iter()
            .find_map(|a| match a {
                BootstrapAction::ConnectPeers(peers) => Some(peers.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(dialed, vec![s0(), g1()]);
        assert_eq!(core.state(), BootstrapState::AwaitingMailboxSync);
        assert_eq!(core.pending_peers(), 2);

        assert!(core.on_peer_connected(&s0()).is_empty());
        let actions = core.on_peer_connected(&g1());
        assert_eq!(actions, vec![BootstrapAction::EnterRunning, BootstrapAction::Open]);
        assert_eq!(core.state(), BootstrapState::Running);
    }

    #[test]
    fn test_server_runs_as_soon_as_bundle_arrives() {
        let mut core = BootstrapCore::new(InstanceRole::Server, s0());
        core.on_host_connected(false);
        core.on_control(&ack());
        let actions = feed(&mut core, bundle(vec![g0()], vec![s0()], None));
        assert!(matches!(actions[0], BootstrapAction::ApplyView(ref v) if v.gates == vec![g0()]));
        assert!(actions.contains(&BootstrapAction::EnterRunning));
        assert!(!actions.iter().any(|a| matches!(a, BootstrapAction::ConnectPeers(_))));
        assert_eq!(core.state(), BootstrapState::Running);
    }

    #[test]
    fn test_restarted_server_reports_reconnect_end() {
        let mut core = BootstrapCore::new(InstanceRole::Server, s0());
        let actions = core.on_host_connected(true);
        assert!(matches!(
            &actions[0],
            BootstrapAction::SendToHost(Package::Control(c)) if c.message == ControlMessage::Restart
        ));
        core.on_control(&Control {
            message: ControlMessage::WaitForReconnect,
            ..ack()
        });
        assert_eq!(core.state(), BootstrapState::Restarting);

        feed(&mut core, bundle(vec![g0(), g1()], vec![s0()], None));
        assert_eq!(core.state(), BootstrapState::AwaitingReconnect);
        assert!(core.on_peer_connected(&g0()).is_empty());
        let actions = core.on_peer_connected(&g1());
        assert_eq!(actions[0], BootstrapAction::EnterRunning);
        assert!(matches!(
            &actions[1],
            BootstrapAction::SendToHost(Package::Control(c)) if c.message == ControlMessage::ReconnectEnd
        ));
    }

    #[test]
    fn test_restart_finishes_when_a_gate_never_returns() {
        let mut core = BootstrapCore::new(InstanceRole::Server, s0());
        core.on_host_connected(true);
        feed(&mut core, bundle(vec![g0(), g1()], vec![s0()], None));
        assert!(core.on_peer_connected(&g0()).is_empty());
        assert_eq!(core.pending_peers(), 1);

        let actions = core.reconnect_timed_out();
        assert_eq!(actions[0], BootstrapAction::EnterRunning);
        assert!(matches!(
            &actions[1],
            BootstrapAction::SendToHost(Package::Control(c)) if c.message == ControlMessage::ReconnectEnd
        ));
        assert_eq!(core.state(), BootstrapState::Running);
        assert_eq!(core.pending_peers(), 0);

        // The straggler showing up later changes nothing; a second deadline is a no-op.
        assert!(core.on_peer_connected(&g1()).is_empty());
        assert!(core.reconnect_timed_out().is_empty());
    }

    #[test]
    fn test_restart_before_cluster_formed_is_a_registration() {
        let mut core = BootstrapCore::new(InstanceRole::Server, s0());
        core.on_host_connected(true);
        core.on_control(&ack());
        let actions = feed(&mut core, bundle(vec![g0()], vec![s0()], None));
        assert!(actions.contains(&BootstrapAction::EnterRunning));
        assert!(!actions.iter().any(|a| matches!(a, BootstrapAction::SendToHost(_))));
    }

    #[test]
    fn test_running_gate_follows_reconnect_notices() {
        let mut core = BootstrapCore::new(InstanceRole::Gate, g0());
        core.on_host_connected(false);
        core.on_control(&ack());
        feed(&mut core, bundle(vec![g0()], vec![s0()], None));
        core.on_peer_connected(&s0());
        assert_eq!(core.state(), BootstrapState::Running);

        let moved = MailBox::new("server_0", "127.0.0.1", 9350, 1);
        let actions = core.on_host_command(&HostCommand::new(HostCommandType::ReconnectServer, vec![moved.clone()]));
        assert_eq!(actions[1], BootstrapAction::ReconnectPeer(moved.clone()));
        assert_eq!(core.view().servers, vec![moved]);

        let sm = MailBox::new("service_manager", "127.0.0.1", 9400, 1);
        let actions = core.on_host_command(&HostCommand::new(HostCommandType::SyncServiceManager, vec![sm.clone()]));
        assert_eq!(actions[1], BootstrapAction::ReconnectPeer(sm));

        assert_eq!(
            core.on_host_command(&HostCommand::new(HostCommandType::Stop, Vec::new())),
            vec![BootstrapAction::Stop]
        );
        assert_eq!(core.state(), BootstrapState::Stopped);
        assert!(core.leave().is_empty());
    }

    #[test]
    fn test_server_only_updates_view_on_gate_restart() {
        let mut core = BootstrapCore::new(InstanceRole::Server, s0());
        core.on_host_connected(false);
        core.on_control(&ack());
        feed(&mut core, bundle(vec![g0()], vec![s0()], None));

        let moved = MailBox::new("gate_0", "127.0.0.1", 9150, 1);
        let actions = core.on_host_command(&HostCommand::new(HostCommandType::ReconnectGate, vec![moved.clone()]));
        assert_eq!(actions, vec![BootstrapAction::ApplyView(core.view().clone())]);
        assert_eq!(core.view().gates, vec![moved]);

        let leave = core.leave();
        assert!(matches!(
            &leave[0],
            BootstrapAction::SendToHost(Package::Control(c)) if c.message == ControlMessage::ShutDown
        ));
    }
}
