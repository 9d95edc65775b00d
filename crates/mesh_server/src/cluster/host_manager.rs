//! # Host Manager
//!
//! The cluster coordinator. Instances register with it, it releases the
//! mailbox sync barrier once the configured membership is present, pings
//! everyone on a fixed period, and serialises restarts so only one instance
//! re-joins at a time.
//!
//! [`HostManagerCore`] holds all of that as a plain state machine: every
//! input returns the packages to send, which keeps the protocol testable
//! without sockets. [`HostManager`] drives it from a single task, so the
//! registration tables never need a lock.

use crate::config::MeshConfig;
use crate::error::{ClusterError, ServerError};
use crate::transport::{ConnectionId, ConnectionKind, Transport, TransportEvent};
use mesh_core::protocol::{Control, ControlMessage, Heartbeat, HostCommand, HostCommandType, InstanceRole};
use mesh_core::utils::current_timestamp_ms;
use mesh_core::{MailBox, Package};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Registered, no pong seen yet
    Initializing,
    Running,
    /// Missed a heartbeat or dropped its connection
    Dead,
}

/// What the host manager knows about one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub mailbox: MailBox,
    pub role: InstanceRole,
    pub status: InstanceStatus,
    /// Timestamp (ms) of the last pong, or of registration
    pub last_heartbeat_ms: u64,
    pub waiting_for_pong: bool,
    pub conn: ConnectionId,
}

/// A package to send on a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub conn: ConnectionId,
    pub package: Package,
}

impl Outbound {
    fn new(conn: ConnectionId, package: Package) -> Self {
        Self { conn, package }
    }
}

/// Membership the barrier waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierTarget {
    pub servers: usize,
    pub gates: usize,
    pub service_manager: bool,
}

#[derive(Debug, Clone)]
struct QueuedRestart {
    conn: ConnectionId,
    role: InstanceRole,
    mailbox: MailBox,
}

/// Registration, barrier, heartbeat and restart state.
#[derive(Debug)]
pub struct HostManagerCore {
    mailbox: MailBox,
    target: BarrierTarget,
    records: HashMap<String, InstanceRecord>,
    // Registration order, by mailbox id
    gates: Vec<String>,
    servers: Vec<String>,
    service_manager: Option<String>,
    barrier_released: bool,
    restart_in_flight: Option<String>,
    restart_queue: VecDeque<QueuedRestart>,
}

impl HostManagerCore {
    pub fn new(mailbox: MailBox, target: BarrierTarget) -> Self {
        Self {
            mailbox,
            target,
            records: HashMap::new(),
            gates: Vec::new(),
            servers: Vec::new(),
            service_manager: None,
            barrier_released: false,
            restart_in_flight: None,
            restart_queue: VecDeque::new(),
        }
    }

    /// Handles one package received on `conn`.
    pub fn handle_package(&mut self, conn: ConnectionId, package: Package, now_ms: u64) -> Vec<Outbound> {
        match package {
            Package::Control(control) => self.on_control(conn, control, now_ms),
            Package::Pong(heartbeat) => {
                self.on_pong(&heartbeat.sender, now_ms);
                Vec::new()
            }
            Package::Ping(_) => vec![Outbound::new(
                conn,
                Package::Pong(Heartbeat {
                    sender: self.mailbox.clone(),
                }),
            )],
            other => {
                warn!("⚠️ Host manager ignoring {:?} on connection {}", other.package_type(), conn);
                Vec::new()
            }
        }
    }

    pub fn on_control(&mut self, conn: ConnectionId, control: Control, now_ms: u64) -> Vec<Outbound> {
        match control.message {
            ControlMessage::Ready => self.register(conn, control.from, control.mailbox, now_ms),
            ControlMessage::Restart => self.request_restart(conn, control.from, control.mailbox, now_ms),
            ControlMessage::ReconnectEnd => self.finish_restart(&control.mailbox, now_ms),
            ControlMessage::ShutDown => self.unregister(&control.mailbox, now_ms),
            ControlMessage::WaitForReconnect => {
                warn!("⚠️ Unexpected WaitForReconnect from {}", control.mailbox);
                Vec::new()
            }
        }
    }

    fn register(&mut self, conn: ConnectionId, role: InstanceRole, mailbox: MailBox, now_ms: u64) -> Vec<Outbound> {
        if matches!(role, InstanceRole::HostManager | InstanceRole::Client) {
            warn!("⚠️ Refusing registration of {} as {}", mailbox, role);
            return Vec::new();
        }

        let id = mailbox.id.clone();
        let record = InstanceRecord {
            mailbox: mailbox.clone(),
            role,
            status: InstanceStatus::Initializing,
            last_heartbeat_ms: now_ms,
            waiting_for_pong: false,
            conn,
        };

        let previous_role = self.records.insert(id.clone(), record).map(|r| r.role);
        if previous_role == Some(role) {
            warn!("⚠️ Duplicate registration for {}, keeping the latest connection", mailbox);
        } else {
            if let Some(previous_role) = previous_role {
                warn!("⚠️ {} re-registered as {} (was {})", mailbox, role, previous_role);
                self.forget_membership(&id);
            }
            match role {
                InstanceRole::Gate => self.gates.push(id.clone()),
                InstanceRole::Server => self.servers.push(id.clone()),
                InstanceRole::ServiceManager => {
                    if let Some(previous) = self.service_manager.replace(id.clone()) {
                        warn!("⚠️ Service manager '{}' replaced by {}", previous, mailbox);
                        self.records.remove(&previous);
                    }
                }
                InstanceRole::HostManager | InstanceRole::Client => {}
            }
            info!("📝 Registered {} {} ({})", role, mailbox, self.membership_summary());
        }

        let mut out = vec![Outbound::new(conn, self.control(ControlMessage::Ready))];

        if self.barrier_released {
            // Late or repeated registration: bring just this instance up to date.
            out.extend(self.sync_bundle(conn));
            if role == InstanceRole::Gate {
                out.push(Outbound::new(conn, self.command(HostCommandType::Open, Vec::new())));
            }
        } else if self.barrier_full() {
            out.extend(self.release_barrier());
        }
        out
    }

    fn barrier_full(&self) -> bool {
        self.servers.len() >= self.target.servers
            && self.gates.len() >= self.target.gates
            && (!self.target.service_manager || self.service_manager.is_some())
    }

    fn release_barrier(&mut self) -> Vec<Outbound> {
        self.barrier_released = true;
        info!(
            "🚦 Barrier released: {} gate(s), {} server(s), service manager {}",
            self.gates.len(),
            self.servers.len(),
            if self.service_manager.is_some() { "present" } else { "absent" }
        );

        let mut out = Vec::new();
        for conn in self.member_connections() {
            out.extend(self.sync_bundle(conn));
        }
        for conn in self.connections_of(&self.gates) {
            out.push(Outbound::new(conn, self.command(HostCommandType::Open, Vec::new())));
        }
        out
    }

    fn request_restart(&mut self, conn: ConnectionId, role: InstanceRole, mailbox: MailBox, now_ms: u64) -> Vec<Outbound> {
        if !self.barrier_released {
            info!("🔄 Restart from {} before the barrier, treating as registration", mailbox);
            return self.register(conn, role, mailbox, now_ms);
        }

        if self.restart_in_flight.as_deref() == Some(mailbox.id.as_str()) {
            info!("🔄 {} restarted again before finishing, starting over", mailbox);
            return self.process_restart(conn, role, mailbox, now_ms);
        }
        if let Some(in_flight) = &self.restart_in_flight {
            info!("⏳ Restart of {} queued behind '{}'", mailbox, in_flight);
            self.restart_queue.push_back(QueuedRestart { conn, role, mailbox });
            return vec![Outbound::new(conn, self.control(ControlMessage::WaitForReconnect))];
        }

        self.process_restart(conn, role, mailbox, now_ms)
    }

    fn process_restart(&mut self, conn: ConnectionId, role: InstanceRole, mailbox: MailBox, now_ms: u64) -> Vec<Outbound> {
        // Same id first; the id may have changed while the address stayed.
        let old_id = if self.records.contains_key(&mailbox.id) {
            Some(mailbox.id.clone())
        } else {
            self.records
                .values()
                .find(|r| r.role == role && r.mailbox.compare_only_address(&mailbox))
                .map(|r| r.mailbox.id.clone())
        };

        let Some(old_id) = old_id else {
            warn!("⚠️ Restart from unknown instance {}, registering it as new", mailbox);
            return self.register(conn, role, mailbox, now_ms);
        };

        let old = self.records.remove(&old_id);
        let new_id = mailbox.id.clone();
        let list = match role {
            InstanceRole::Gate => Some(&mut self.gates),
            InstanceRole::Server => Some(&mut self.servers),
            _ => None,
        };
        if let Some(list) = list {
            match list.iter_mut().find(|id| **id == old_id) {
                Some(slot) => *slot = new_id.clone(),
                None => list.push(new_id.clone()),
            }
        } else if role == InstanceRole::ServiceManager {
            self.service_manager = Some(new_id.clone());
        }

        self.records.insert(
            new_id.clone(),
            InstanceRecord {
                mailbox: mailbox.clone(),
                role,
                status: InstanceStatus::Initializing,
                last_heartbeat_ms: now_ms,
                waiting_for_pong: false,
                conn,
            },
        );
        self.restart_in_flight = Some(new_id);
        info!(
            "🔄 Restarting {} (was {})",
            mailbox,
            old.map(|r| r.mailbox.to_string()).unwrap_or_default()
        );

        let mut out = self.sync_bundle(conn);
        if role == InstanceRole::Gate {
            out.push(Outbound::new(conn, self.command(HostCommandType::Open, Vec::new())));
        }

        let other_gates: Vec<ConnectionId> = self
            .gates
            .iter()
            .filter(|id| **id != mailbox.id)
            .filter_map(|id| self.records.get(id))
            .map(|r| r.conn)
            .collect();
        match role {
            InstanceRole::Server => {
                for gate in other_gates {
                    out.push(Outbound::new(
                        gate,
                        self.command(HostCommandType::ReconnectServer, vec![mailbox.clone()]),
                    ));
                }
            }
            InstanceRole::Gate => {
                let servers = self.connections_of(&self.servers);
                for peer in other_gates.into_iter().chain(servers) {
                    out.push(Outbound::new(
                        peer,
                        self.command(HostCommandType::ReconnectGate, vec![mailbox.clone()]),
                    ));
                }
            }
            InstanceRole::ServiceManager => {
                let servers = self.connections_of(&self.servers);
                for peer in other_gates.into_iter().chain(servers) {
                    out.push(Outbound::new(
                        peer,
                        self.command(HostCommandType::SyncServiceManager, vec![mailbox.clone()]),
                    ));
                }
            }
            InstanceRole::HostManager | InstanceRole::Client => {}
        }
        out
    }

    fn finish_restart(&mut self, mailbox: &MailBox, now_ms: u64) -> Vec<Outbound> {
        if self.restart_in_flight.as_deref() != Some(mailbox.id.as_str()) {
            warn!("⚠️ ReconnectEnd from {} with no matching restart in flight", mailbox);
            return Vec::new();
        }
        info!("✅ {} finished reconnecting", mailbox);
        self.restart_in_flight = None;
        self.drain_restart_queue(now_ms)
    }

    fn drain_restart_queue(&mut self, now_ms: u64) -> Vec<Outbound> {
        let mut out = Vec::new();
        while self.restart_in_flight.is_none() {
            let Some(next) = self.restart_queue.pop_front() else {
                break;
            };
            out.extend(self.process_restart(next.conn, next.role, next.mailbox, now_ms));
        }
        out
    }

    fn unregister(&mut self, mailbox: &MailBox, now_ms: u64) -> Vec<Outbound> {
        let Some(record) = self.records.remove(&mailbox.id) else {
            warn!("⚠️ ShutDown ignored: {}", ClusterError::UnknownInstance(mailbox.to_string()));
            return Vec::new();
        };
        self.forget_membership(&mailbox.id);
        info!("👋 {} {} left the cluster", record.role, record.mailbox);

        if self.restart_in_flight.as_deref() == Some(mailbox.id.as_str()) {
            self.restart_in_flight = None;
            return self.drain_restart_queue(now_ms);
        }
        Vec::new()
    }

    fn forget_membership(&mut self, id: &str) {
        self.gates.retain(|g| g != id);
        self.servers.retain(|s| s != id);
        if self.service_manager.as_deref() == Some(id) {
            self.service_manager = None;
        }
    }

    fn on_pong(&mut self, sender: &MailBox, now_ms: u64) {
        match self.records.get_mut(&sender.id) {
            Some(record) => {
                if record.status == InstanceStatus::Dead {
                    info!("💚 {} is answering heartbeats again", record.mailbox);
                }
                record.status = InstanceStatus::Running;
                record.waiting_for_pong = false;
                record.last_heartbeat_ms = now_ms;
            }
            None => debug!("Pong from unregistered {}", sender),
        }
    }

    /// One heartbeat period: marks silent instances dead and pings everyone.
    pub fn heartbeat_tick(&mut self, _now_ms: u64) -> Vec<Outbound> {
        let ping = Package::Ping(Heartbeat {
            sender: self.mailbox.clone(),
        });
        let mut out = Vec::with_capacity(self.records.len());
        for record in self.records.values_mut() {
            if record.waiting_for_pong && record.status != InstanceStatus::Dead {
                warn!(
                    "💀 {} {} missed its heartbeat (last seen at {}ms), marking dead",
                    record.role, record.mailbox, record.last_heartbeat_ms
                );
                record.status = InstanceStatus::Dead;
            }
            record.waiting_for_pong = true;
            out.push(Outbound::new(record.conn, ping.clone()));
        }
        out
    }

    /// A connection dropped. Its instance is marked dead; nothing is evicted.
    ///
    /// If the dropped instance was the one restarting, the restart slot is
    /// released and the next queued restart starts.
    pub fn on_disconnect(&mut self, conn: ConnectionId, now_ms: u64) -> Vec<Outbound> {
        for record in self.records.values_mut().filter(|r| r.conn == conn) {
            if record.status != InstanceStatus::Dead {
                warn!("💀 Lost connection to {} {}", record.role, record.mailbox);
                record.status = InstanceStatus::Dead;
            }
        }
        self.restart_queue.retain(|queued| queued.conn != conn);

        let restarter_lost = self
            .restart_in_flight
            .as_ref()
            .and_then(|id| self.records.get(id))
            .is_some_and(|r| r.conn == conn);
        if !restarter_lost {
            return Vec::new();
        }
        if let Some(id) = self.restart_in_flight.take() {
            warn!("⚠️ '{}' dropped mid-restart, releasing the restart slot", id);
        }
        self.drain_restart_queue(now_ms)
    }

    /// Cluster shutdown: `Stop` to every registered instance.
    pub fn shutdown(&mut self) -> Vec<Outbound> {
        let stop = self.command(HostCommandType::Stop, Vec::new());
        self.records.values().map(|r| Outbound::new(r.conn, stop.clone())).collect()
    }

    fn sync_bundle(&self, conn: ConnectionId) -> Vec<Outbound> {
        vec![
            Outbound::new(conn, self.command(HostCommandType::SyncGates, self.gate_mailboxes())),
            Outbound::new(conn, self.command(HostCommandType::SyncServers, self.server_mailboxes())),
            Outbound::new(
                conn,
                self.command(
                    HostCommandType::SyncServiceManager,
                    self.service_manager_mailbox().into_iter().collect(),
                ),
            ),
        ]
    }

    fn member_connections(&self) -> Vec<ConnectionId> {
        let mut conns = self.connections_of(&self.gates);
        conns.extend(self.connections_of(&self.servers));
        if let Some(sm) = self.service_manager.as_ref().and_then(|id| self.records.get(id)) {
            conns.push(sm.conn);
        }
        conns
    }

    fn connections_of(&self, ids: &[String]) -> Vec<ConnectionId> {
        ids.iter().filter_map(|id| self.records.get(id)).map(|r| r.conn).collect()
    }

    fn mailboxes_of(&self, ids: &[String]) -> Vec<MailBox> {
        ids.iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| r.mailbox.clone())
            .collect()
    }

    fn control(&self, message: ControlMessage) -> Package {
        Package::Control(Control {
            from: InstanceRole::HostManager,
            message,
            mailbox: self.mailbox.clone(),
        })
    }

    fn command(&self, kind: HostCommandType, args: Vec<MailBox>) -> Package {
        Package::HostCommand(HostCommand::new(kind, args))
    }

    fn membership_summary(&self) -> String {
        format!(
            "gates {}/{}, servers {}/{}",
            self.gates.len(),
            self.target.gates,
            self.servers.len(),
            self.target.servers
        )
    }

    pub fn gate_mailboxes(&self) -> Vec<MailBox> {
        self.mailboxes_of(&self.gates)
    }

    pub fn server_mailboxes(&self) -> Vec<MailBox> {
        self.mailboxes_of(&self.servers)
    }

    pub fn service_manager_mailbox(&self) -> Option<MailBox> {
        self.service_manager
            .as_ref()
            .and_then(|id| self.records.get(id))
            .map(|r| r.mailbox.clone())
    }

    pub fn record(&self, id: &str) -> Option<&InstanceRecord> {
        self.records.get(id)
    }

    pub fn barrier_released(&self) -> bool {
        self.barrier_released
    }

    pub fn restart_in_flight(&self) -> Option<&str> {
        self.restart_in_flight.as_deref()
    }

    pub fn queued_restarts(&self) -> usize {
        self.restart_queue.len()
    }
}

/// Runs a [`HostManagerCore`] behind a TCP listener.
pub struct HostManager {
    config: Arc<MeshConfig>,
    shutdown: CancellationToken,
}

impl HostManager {
    pub fn new(config: Arc<MeshConfig>, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// Listens on the configured address and processes registrations,
    /// heartbeats and restarts until shutdown. On shutdown every instance
    /// is sent `Stop`.
    ///
    /// # Errors
    ///
    /// [`ServerError::Network`] if the listener cannot be bound.
    pub async fn start(self) -> Result<(), ServerError> {
        let settings = &self.config.host_manager;
        let mailbox = settings.mailbox();
        let target = BarrierTarget {
            servers: settings.desired_servers,
            gates: settings.desired_gates,
            service_manager: settings.expect_service_manager,
        };
        info!("🚀 Starting host manager {}", mailbox);
        info!(
            "🎯 Waiting for {} gate(s), {} server(s){}",
            target.gates,
            target.servers,
            if target.service_manager { " and a service manager" } else { "" }
        );

        let (transport, mut events) = Transport::new(self.shutdown.child_token());
        transport.listen(&settings.listen_address(), ConnectionKind::Peer).await?;

        let mut core = HostManagerCore::new(mailbox, target);
        let mut heartbeat = interval(Duration::from_millis(settings.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            let out = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("🛑 Host manager shutting down, stopping the cluster");
                    let out = core.shutdown();
                    send_all(&transport, out);
                    break;
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Package { conn, package }) => {
                        core.handle_package(conn, package, current_timestamp_ms())
                    }
                    Some(TransportEvent::Disconnected { conn }) => {
                        core.on_disconnect(conn, current_timestamp_ms())
                    }
                    Some(TransportEvent::Connected { conn, .. }) => {
                        debug!("🔗 Instance connection {} opened", conn);
                        Vec::new()
                    }
                    None => break,
                },
                _ = heartbeat.tick() => core.heartbeat_tick(current_timestamp_ms()),
            };
            send_all(&transport, out);
        }

        transport.shutdown();
        info!("✅ Host manager stopped");
        Ok(())
    }
}

fn send_all(transport: &Transport, out: Vec<Outbound>) {
    for Outbound { conn, package } in out {
        if let Err(e) = transport.send(conn, &package) {
            warn!("📤 Could not deliver {:?} to connection {}: {}", package.package_type(), conn, e);
        }
    }
}
