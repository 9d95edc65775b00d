//! Configuration module for mesh instances
//!
//! This module handles configuration file parsing and provides default
//! settings for a local development cluster.

pub mod settings;

pub use settings::{
    GateSettings, HostManagerSettings, InstanceSettings, LoggingSettings, MeshConfig, RpcSettings,
    TimeCircleSettings, HOST_MANAGER_ID,
};

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

/// Load configuration from file or create default configuration
///
/// If the file doesn't exist, a default configuration file is written and
/// the defaults are returned.
///
/// # Arguments
/// * `path` - Path of the TOML configuration file
///
/// # Returns
/// * `Result<MeshConfig>` - The loaded or default configuration
///
/// # Errors
/// * Returns error if file I/O operations fail
/// * Returns error if TOML parsing fails
pub async fn load_config(path: &Path) -> Result<MeshConfig> {
    if path.exists() {
        let config_str = tokio::fs::read_to_string(path).await?;
        match toml::de::from_str::<MeshConfig>(&config_str) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Failed to parse config file {}: {}", path.display(), e);
                Err(e.into())
            }
        }
    } else {
        warn!("Configuration file not found: {}, using defaults", path.display());

        let default_config = MeshConfig::default();
        let config_str = toml::to_string_pretty(&default_config)?;
        tokio::fs::write(path, config_str).await?;
        info!("Created default configuration file: {}", path.display());

        Ok(default_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_load_config_default() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        // Delete the file to test default creation
        drop(temp_file);

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.host_manager.port, 9000);
        assert!(path.exists());

        let reloaded = load_config(&path).await.unwrap();
        assert_eq!(reloaded.gates, config.gates);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_load_config_existing() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_content = r#"
[host_manager]
ip = "10.1.0.1"
port = 7000
host_num = 2
desired_servers = 2
desired_gates = 1
expect_service_manager = false
heartbeat_interval_ms = 250

[[gates]]
name = "gate_a"
ip = "10.1.0.2"
port = 7100
host_num = 2
client_port = 7200

[[servers]]
name = "server_a"
ip = "10.1.0.3"
port = 7300
host_num = 2

[[servers]]
name = "server_b"
ip = "10.1.0.4"
port = 7300
host_num = 2

[time_circle]
interval_ms = 20
total_window_ms = 400
default_delay_ms = 40

[rpc]
report_dispatch_errors = true

[logging]
level = "debug"
json_format = true
        "#;

        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = load_config(temp_file.path()).await.unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.host_manager.heartbeat_interval_ms, 250);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.gate("gate_a").unwrap().client_port, 7200);
        assert_eq!(config.time_circle.circle_config().interval_ms, 20);
        assert!(config.rpc.report_dispatch_errors);
        assert!(config.logging.json_format);
    }

    #[tokio::test]
    async fn test_load_config_rejects_garbage() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[host_manager\nport = ").unwrap();
        assert!(load_config(temp_file.path()).await.is_err());
    }
}
