//! # Role Drivers
//!
//! An [`Instance`] is one gate, server or service manager process. It binds
//! its peer listener, registers with the host manager, follows the
//! bootstrap protocol and then routes traffic until it is stopped.
//!
//! All control traffic is handled on the instance's own task; local RPCs
//! run on one queue task per entity and the time circle ticks on its own
//! task.

mod gate;
pub mod node;
mod server;

pub use node::Node;

use crate::cluster::bootstrap::{BootstrapAction, BootstrapCore, BootstrapState};
use crate::config::MeshConfig;
use crate::error::ServerError;
use crate::transport::{ConnectionId, ConnectionKind, Transport, TransportEvent};
use mesh_core::protocol::{Heartbeat, InstanceRole};
use mesh_core::sync::TimeCircle;
use mesh_core::Package;
use node::NodeParts;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HOST_RETRY: Duration = Duration::from_millis(250);

/// A bound, not yet registered mesh participant.
pub struct Instance {
    node: Arc<Node>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    circle: Option<TimeCircle>,
    host_address: String,
    reconnect_timeout: Duration,
    restart: bool,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

impl Instance {
    /// Binds the peer listener of instance `name` playing `role`.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`] if the role cannot run as an instance or
    ///   `name` is not configured for it
    /// - [`ServerError::Network`] if the listener cannot be bound
    pub async fn bind(
        config: Arc<MeshConfig>,
        role: InstanceRole,
        name: &str,
        shutdown: CancellationToken,
    ) -> Result<Self, ServerError> {
        if matches!(role, InstanceRole::HostManager | InstanceRole::Client) {
            return Err(ServerError::Config(format!("{role} is not a mesh instance role")));
        }
        let mailbox = config.instance_mailbox(role, name)?;
        let client_address = match role {
            InstanceRole::Gate => config.gate(name).map(|g| g.client_address()),
            _ => None,
        };
        // Gates only mirror; everyone else may own replicated state.
        let circle = (role != InstanceRole::Gate).then(|| TimeCircle::new(config.time_circle.circle_config()));

        let (transport, events) = Transport::new(shutdown.child_token());
        let local_addr = transport
            .listen(&mailbox.socket_address(), ConnectionKind::Peer)
            .await?;

        let node = Node::new(NodeParts {
            role,
            mailbox,
            transport,
            report_errors: config.rpc.report_dispatch_errors,
            client_address,
            sync: circle.as_ref().map(TimeCircle::handle),
            default_delay_ms: config.time_circle.default_delay_ms,
        });

        Ok(Self {
            node,
            events,
            circle,
            host_address: config.host_manager.listen_address(),
            reconnect_timeout: Duration::from_millis(config.host_manager.reconnect_timeout_ms),
            restart: false,
            shutdown,
            local_addr,
        })
    }

    /// Registers with `Restart` instead of `Ready`.
    pub fn restarting(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn node(&self) -> Arc<Node> {
        Arc::clone(&self.node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the instance until the host manager stops the cluster or
    /// `shutdown` fires. A graceful shutdown tells the host manager first.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; the signature leaves room for
    /// startup work that can fail.
    pub async fn run(self) -> Result<(), ServerError> {
        let Instance {
            node,
            mut events,
            circle,
            host_address,
            reconnect_timeout,
            restart,
            shutdown,
            ..
        } = self;
        info!("🚀 Starting {} {}", node.role, node.mailbox);

        let stop = shutdown.child_token();
        if let Some(circle) = circle {
            tokio::spawn(server::run_sync_delivery(node.clone(), circle, stop.clone()));
        }

        let (host_tx, mut host_rx) = mpsc::unbounded_channel();
        connect_to_host(node.clone(), host_address.clone(), host_tx.clone(), stop.clone());

        let mut bootstrap = BootstrapCore::new(node.role, node.mailbox.clone());
        let mut host_conn: Option<ConnectionId> = None;
        let mut rejoin = restart;
        let mut reconnect_deadline: Option<Instant> = None;

        loop {
            let actions = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("🛑 {} {} shutting down", node.role, node.mailbox);
                    let actions = bootstrap.leave();
                    execute(&node, actions, host_conn, &stop);
                    break;
                }
                _ = sleep_until(reconnect_deadline.unwrap_or_else(Instant::now)), if reconnect_deadline.is_some() => {
                    reconnect_deadline = None;
                    bootstrap.reconnect_timed_out()
                }
                Some(conn) = host_rx.recv() => {
                    host_conn = Some(conn);
                    let actions = bootstrap.on_host_connected(rejoin);
                    rejoin = true;
                    actions
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Package { conn, package }) if Some(conn) == host_conn => {
                        host_package(&node, &mut bootstrap, conn, package)
                    }
                    Some(TransportEvent::Package { conn, package }) => match node.handle_package(conn, package) {
                        Some(peer) => bootstrap.on_peer_connected(&peer),
                        None => Vec::new(),
                    },
                    Some(TransportEvent::Disconnected { conn }) => {
                        if Some(conn) == host_conn {
                            host_conn = None;
                            bootstrap.on_host_lost();
                            connect_to_host(node.clone(), host_address.clone(), host_tx.clone(), stop.clone());
                        } else {
                            node.on_disconnect(conn);
                        }
                        Vec::new()
                    }
                    Some(TransportEvent::Connected { conn, kind }) => {
                        debug!("🔗 Connection {} ({:?}) opened", conn, kind);
                        Vec::new()
                    }
                    None => break,
                },
            };

            let stopped = execute(&node, actions, host_conn, &stop);
            reconnect_deadline = match bootstrap.state() {
                BootstrapState::AwaitingReconnect => {
                    reconnect_deadline.or_else(|| Some(Instant::now() + reconnect_timeout))
                }
                _ => None,
            };
            node.publish_state(bootstrap.state());
            if stopped {
                break;
            }
        }

        node.publish_state(BootstrapState::Stopped);
        stop.cancel();
        node.transport.shutdown();
        info!("✅ {} {} stopped", node.role, node.mailbox);
        Ok(())
    }
}

/// Handles a package from the host manager.
fn host_package(
    node: &Arc<Node>,
    bootstrap: &mut BootstrapCore,
    conn: ConnectionId,
    package: Package,
) -> Vec<BootstrapAction> {
    match package {
        Package::Control(control) => bootstrap.on_control(&control),
        Package::HostCommand(command) => bootstrap.on_host_command(&command),
        Package::Ping(_) => {
            let pong = Package::Pong(Heartbeat {
                sender: node.mailbox.clone(),
            });
            if let Err(e) = node.transport.send(conn, &pong) {
                warn!("💔 Could not answer host manager ping: {}", e);
            }
            Vec::new()
        }
        other => {
            warn!("⚠️ Unexpected {:?} from the host manager", other.package_type());
            Vec::new()
        }
    }
}

/// Carries out bootstrap actions.
///
/// # Returns
///
/// `true` when the instance must stop.
fn execute(
    node: &Arc<Node>,
    actions: Vec<BootstrapAction>,
    host_conn: Option<ConnectionId>,
    stop: &CancellationToken,
) -> bool {
    let mut stopped = false;
    for action in actions {
        match action {
            BootstrapAction::SendToHost(package) => match host_conn {
                Some(conn) => {
                    if let Err(e) = node.transport.send(conn, &package) {
                        warn!("📤 Could not reach the host manager: {}", e);
                    }
                }
                None => warn!("📤 No host manager connection for {:?}", package.package_type()),
            },
            BootstrapAction::ApplyView(view) => node.apply_view(&view),
            BootstrapAction::ConnectPeers(peers) => {
                for peer in peers {
                    node.dial(peer, stop.clone());
                }
            }
            BootstrapAction::ReconnectPeer(peer) => node.reconnect_peer(peer, stop.clone()),
            BootstrapAction::Open => node.open_clients(),
            BootstrapAction::EnterRunning => {
                info!("✅ {} {} joined the cluster", node.role, node.mailbox);
            }
            BootstrapAction::Stop => stopped = true,
        }
    }
    stopped
}

/// Dials the host manager until it answers, then reports the connection.
fn connect_to_host(
    node: Arc<Node>,
    address: String,
    report: mpsc::UnboundedSender<ConnectionId>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        let mut attempts = 0u32;
        loop {
            match node.transport.connect(&address).await {
                Ok(connection) => {
                    info!("🔗 Connected to host manager at {}", address);
                    let _ = report.send(connection.id);
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts == 1 || attempts % 20 == 0 {
                        warn!("⏳ Host manager at {} unreachable ({}), retrying", address, e);
                    }
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(HOST_RETRY) => {}
                    }
                }
            }
        }
    });
}
