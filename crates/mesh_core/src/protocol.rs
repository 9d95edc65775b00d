//! Packages exchanged between mesh instances.
//!
//! Every frame on a mesh connection carries exactly one [`Package`]. The
//! transport dispatches on [`PackageType`] before handing the body to a
//! handler.

use crate::mailbox::MailBox;
use crate::rpc::{EntityRpc, EntityRpcCallBack};
use crate::sync::PropertySyncCommandList;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role an instance plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceRole {
    HostManager,
    Gate,
    Server,
    ServiceManager,
    /// Player connection attached to a gate
    Client,
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceRole::HostManager => "hostmanager",
            InstanceRole::Gate => "gate",
            InstanceRole::Server => "server",
            InstanceRole::ServiceManager => "servicemanager",
            InstanceRole::Client => "client",
        };
        f.write_str(name)
    }
}

impl FromStr for InstanceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "hostmanager" => Ok(InstanceRole::HostManager),
            "gate" => Ok(InstanceRole::Gate),
            "server" => Ok(InstanceRole::Server),
            "servicemanager" => Ok(InstanceRole::ServiceManager),
            "client" => Ok(InstanceRole::Client),
            other => Err(format!("unknown instance role '{other}'")),
        }
    }
}

/// Registration control verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlMessage {
    /// First registration; echoed back by the host manager as the ack
    Ready,
    /// Re-registration after a crash or redeploy
    Restart,
    /// Graceful leave
    ShutDown,
    /// Another restart is in flight; hold on
    WaitForReconnect,
    /// The restarted instance is fully reconnected
    ReconnectEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub from: InstanceRole,
    pub message: ControlMessage,
    /// Mailbox of the sending instance
    pub mailbox: MailBox,
}

/// Commands the host manager broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostCommandType {
    SyncGates,
    SyncServers,
    SyncServiceManager,
    ReconnectServer,
    ReconnectGate,
    /// Gates may start accepting clients
    Open,
    /// Cluster is shutting down
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCommand {
    pub kind: HostCommandType,
    pub args: Vec<MailBox>,
}

impl HostCommand {
    pub fn new(kind: HostCommandType, args: Vec<MailBox>) -> Self {
        Self { kind, args }
    }
}

/// Heartbeat probe and its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sender: MailBox,
}

/// First frame on every connection; answered with `ack` set.
///
/// A gate answers a client handshake with the client's routable mailbox,
/// re-addressed to the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub mailbox: MailBox,
    pub role: InstanceRole,
    pub ack: bool,
}

/// Sync deltas addressed to a shadow entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySync {
    pub target: MailBox,
    pub commands: PropertySyncCommandList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageType {
    Control,
    HostCommand,
    EntityRpc,
    EntityRpcCallBack,
    PropertySync,
    Ping,
    Pong,
    Handshake,
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Package {
    Control(Control),
    HostCommand(HostCommand),
    EntityRpc(EntityRpc),
    EntityRpcCallBack(EntityRpcCallBack),
    PropertySync(PropertySync),
    Ping(Heartbeat),
    Pong(Heartbeat),
    Handshake(Handshake),
}

impl Package {
    pub fn package_type(&self) -> PackageType {
        match self {
            Package::Control(_) => PackageType::Control,
            Package::HostCommand(_) => PackageType::HostCommand,
            Package::EntityRpc(_) => PackageType::EntityRpc,
            Package::EntityRpcCallBack(_) => PackageType::EntityRpcCallBack,
            Package::PropertySync(_) => PackageType::PropertySync,
            Package::Ping(_) => PackageType::Ping,
            Package::Pong(_) => PackageType::Pong,
            Package::Handshake(_) => PackageType::Handshake,
        }
    }
}
