//! Configuration settings structures
//!
//! Everything an instance needs to find the rest of the cluster: the host
//! manager address, the static list of gates and servers, the service
//! manager, and the tuning knobs for sync batching, RPC and logging.

use crate::error::ServerError;
use mesh_core::protocol::InstanceRole;
use mesh_core::sync::TimeCircleConfig;
use mesh_core::MailBox;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Mailbox id the host manager registers under.
pub const HOST_MANAGER_ID: &str = "host_manager";

/// Main configuration structure
///
/// Root of the TOML file shared by every instance of one cluster. Each
/// process picks its own entry by role and name.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MeshConfig {
    /// Cluster coordinator settings
    pub host_manager: HostManagerSettings,
    /// Client-facing edge instances
    #[serde(default)]
    pub gates: Vec<GateSettings>,
    /// Simulation instances
    #[serde(default)]
    pub servers: Vec<InstanceSettings>,
    /// Optional service tier coordinator
    #[serde(default)]
    pub service_manager: Option<InstanceSettings>,
    /// Sync batching
    #[serde(default)]
    pub time_circle: TimeCircleSettings,
    /// RPC dispatch behaviour
    #[serde(default)]
    pub rpc: RpcSettings,
    /// Logging output
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Host manager settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HostManagerSettings {
    /// Address the host manager listens on
    pub ip: String,
    pub port: u16,
    pub host_num: u32,

    /// Number of servers that must register before the mailbox sync barrier
    /// releases
    pub desired_servers: usize,

    /// Number of gates that must register before the barrier releases
    pub desired_gates: usize,

    /// Whether the barrier also waits for the service manager
    #[serde(default = "default_true")]
    pub expect_service_manager: bool,

    /// How often every registered instance is pinged (in milliseconds)
    ///
    /// An instance that has not answered the previous ping when the next
    /// one is due is marked dead.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// How long a restarted instance waits for its peers to reconnect
    /// before reporting the restart finished anyway (in milliseconds)
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout_ms: u64,
}

/// Address of a server or service manager instance
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InstanceSettings {
    /// Unique instance name, used as the instance mailbox id
    pub name: String,
    pub ip: String,
    /// Port for instance-to-instance connections
    pub port: u16,
    pub host_num: u32,
}

/// Address of a gate instance
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GateSettings {
    pub name: String,
    pub ip: String,
    /// Port for instance-to-instance connections
    pub port: u16,
    pub host_num: u32,
    /// Port clients connect to
    pub client_port: u16,
}

/// Time circle tuning
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeCircleSettings {
    /// Width of one slot and the sync tick period (in milliseconds)
    pub interval_ms: u64,
    /// Longest delay the ring can hold (in milliseconds)
    pub total_window_ms: u64,
    /// Delay used for properties that do not declare their own
    pub default_delay_ms: u64,
}

/// RPC dispatch settings
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcSettings {
    /// Send an error callback when a local method fails or panics
    ///
    /// When false (the default) the failure is only logged and an awaiting
    /// caller never hears back.
    #[serde(default)]
    pub report_dispatch_errors: bool,
}

/// Logging system configuration
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Logging level filter
    ///
    /// Valid values: "trace", "debug", "info", "warn", "error"
    pub level: String,

    /// Enable JSON-formatted log output
    pub json_format: bool,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_reconnect_timeout() -> u64 {
    5000
}

impl Default for TimeCircleSettings {
    fn default() -> Self {
        Self {
            interval_ms: 50,
            total_window_ms: 1000,
            default_delay_ms: 50,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for MeshConfig {
    /// A one-gate, one-server cluster on localhost suitable for development.
    fn default() -> Self {
        Self {
            host_manager: HostManagerSettings {
                ip: "127.0.0.1".to_string(),
                port: 9000,
                host_num: 1,
                desired_servers: 1,
                desired_gates: 1,
                expect_service_manager: true,
                heartbeat_interval_ms: default_heartbeat_interval(),
                reconnect_timeout_ms: default_reconnect_timeout(),
            },
            gates: vec![GateSettings {
                name: "gate_0".to_string(),
                ip: "127.0.0.1".to_string(),
                port: 9100,
                host_num: 1,
                client_port: 9200,
            }],
            servers: vec![InstanceSettings {
                name: "server_0".to_string(),
                ip: "127.0.0.1".to_string(),
                port: 9300,
                host_num: 1,
            }],
            service_manager: Some(InstanceSettings {
                name: "service_manager".to_string(),
                ip: "127.0.0.1".to_string(),
                port: 9400,
                host_num: 1,
            }),
            time_circle: TimeCircleSettings::default(),
            rpc: RpcSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl InstanceSettings {
    pub fn mailbox(&self) -> MailBox {
        MailBox::new(self.name.clone(), self.ip.clone(), self.port, self.host_num)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl GateSettings {
    pub fn mailbox(&self) -> MailBox {
        MailBox::new(self.name.clone(), self.ip.clone(), self.port, self.host_num)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn client_address(&self) -> String {
        format!("{}:{}", self.ip, self.client_port)
    }
}

impl HostManagerSettings {
    pub fn mailbox(&self) -> MailBox {
        MailBox::new(HOST_MANAGER_ID, self.ip.clone(), self.port, self.host_num)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl TimeCircleSettings {
    pub fn circle_config(&self) -> TimeCircleConfig {
        TimeCircleConfig {
            interval_ms: self.interval_ms,
            total_window_ms: self.total_window_ms,
        }
    }
}

impl MeshConfig {
    /// Looks up the mailbox of the instance `name` playing `role`.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] when no such instance is configured.
    pub fn instance_mailbox(&self, role: InstanceRole, name: &str) -> Result<MailBox, ServerError> {
        let found = match role {
            InstanceRole::HostManager => Some(self.host_manager.mailbox()),
            InstanceRole::Gate => self.gate(name).map(GateSettings::mailbox),
            InstanceRole::Server => self.server(name).map(InstanceSettings::mailbox),
            InstanceRole::ServiceManager => self
                .service_manager
                .as_ref()
                .filter(|sm| sm.name == name)
                .map(InstanceSettings::mailbox),
            InstanceRole::Client => None,
        };
        found.ok_or_else(|| ServerError::Config(format!("no {role} named '{name}' is configured")))
    }

    pub fn gate(&self, name: &str) -> Option<&GateSettings> {
        self.gates.iter().find(|g| g.name == name)
    }

    pub fn server(&self, name: &str) -> Option<&InstanceSettings> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] describing the first problem found:
    /// - a zero time circle interval or heartbeat interval
    /// - a time circle window shorter than one interval
    /// - two instances sharing a name
    /// - desired counts that disagree with the configured instances
    /// - an unknown log level
    pub fn validate(&self) -> Result<(), ServerError> {
        let tc = &self.time_circle;
        if tc.interval_ms == 0 {
            return Err(ServerError::Config("time_circle.interval_ms must be positive".to_string()));
        }
        if tc.total_window_ms < tc.interval_ms {
            return Err(ServerError::Config(format!(
                "time_circle.total_window_ms ({}) must be at least interval_ms ({})",
                tc.total_window_ms, tc.interval_ms
            )));
        }
        if self.host_manager.heartbeat_interval_ms == 0 {
            return Err(ServerError::Config("host_manager.heartbeat_interval_ms must be positive".to_string()));
        }
        if self.host_manager.reconnect_timeout_ms == 0 {
            return Err(ServerError::Config("host_manager.reconnect_timeout_ms must be positive".to_string()));
        }

        let mut names = HashSet::new();
        let all_names = self
            .gates
            .iter()
            .map(|g| g.name.as_str())
            .chain(self.servers.iter().map(|s| s.name.as_str()))
            .chain(self.service_manager.iter().map(|s| s.name.as_str()))
            .chain(std::iter::once(HOST_MANAGER_ID));
        for name in all_names {
            if !names.insert(name) {
                return Err(ServerError::Config(format!("duplicate instance name '{name}'")));
            }
        }

        if self.host_manager.desired_servers != self.servers.len() {
            return Err(ServerError::Config(format!(
                "host_manager.desired_servers is {} but {} servers are configured",
                self.host_manager.desired_servers,
                self.servers.len()
            )));
        }
        if self.host_manager.desired_gates != self.gates.len() {
            return Err(ServerError::Config(format!(
                "host_manager.desired_gates is {} but {} gates are configured",
                self.host_manager.desired_gates,
                self.gates.len()
            )));
        }
        if self.host_manager.expect_service_manager && self.service_manager.is_none() {
            return Err(ServerError::Config(
                "host_manager.expect_service_manager is set but no service_manager is configured".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ServerError::Config(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.time_circle.interval_ms, 50);
        assert_eq!(config.time_circle.total_window_ms, 1000);
        assert_eq!(config.host_manager.heartbeat_interval_ms, 1000);
        assert_eq!(config.host_manager.reconnect_timeout_ms, 5000);
        assert!(!config.rpc.report_dispatch_errors);
        assert_eq!(config.host_manager.mailbox().id, HOST_MANAGER_ID);
    }

    #[test]
    fn test_config_serialization() {
        let config = MeshConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: MeshConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.gates, deserialized.gates);
        assert_eq!(config.servers, deserialized.servers);
        assert_eq!(config.service_manager, deserialized.service_manager);
        assert_eq!(config.time_circle, deserialized.time_circle);
    }

    #[test]
    fn test_optional_sections_take_defaults() {
        let toml_str = r#"
[host_manager]
ip = "10.0.0.1"
port = 7000
host_num = 3
desired_servers = 0
desired_gates = 0
expect_service_manager = false
"#;
        let config: MeshConfig = toml::from_str(toml_str).unwrap();
        assert!(config.gates.is_empty());
        assert_eq!(config.host_manager.heartbeat_interval_ms, 1000);
        assert_eq!(config.time_circle, TimeCircleSettings::default());
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inconsistent_settings() {
        let mut config = MeshConfig::default();
        config.time_circle.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.time_circle.total_window_ms = 10;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.servers.push(InstanceSettings {
            name: "gate_0".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 9301,
            host_num: 1,
        });
        config.host_manager.desired_servers = 2;
        assert!(matches!(config.validate(), Err(ServerError::Config(msg)) if msg.contains("duplicate")));

        let mut config = MeshConfig::default();
        config.host_manager.desired_gates = 3;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.service_manager = None;
        assert!(config.validate().is_err());
        config.host_manager.expect_service_manager = false;
        assert!(config.validate().is_ok());

        let mut config = MeshConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_instance_lookup() {
        let config = MeshConfig::default();
        let gate = config.instance_mailbox(InstanceRole::Gate, "gate_0").unwrap();
        assert_eq!(gate.port, 9100);
        assert_eq!(config.gate("gate_0").unwrap().client_address(), "127.0.0.1:9200");
        assert!(config.instance_mailbox(InstanceRole::Server, "gate_0").is_err());
        assert!(config.instance_mailbox(InstanceRole::ServiceManager, "service_manager").is_ok());
    }
}
