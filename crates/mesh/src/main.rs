//! Mesh launcher
//!
//! Loads the shared cluster configuration, initializes logging and signal
//! handling, then runs this process as the host manager or as one gate,
//! server or service manager instance.

mod cli;

use anyhow::{anyhow, Result};
use cli::CliArgs;
use mesh_core::protocol::InstanceRole;
use mesh_server::logging::setup_logging;
use mesh_server::shutdown::setup_shutdown_handler;
use mesh_server::{load_config, HostManager, Instance, MeshConfig};
use std::sync::Arc;
use tracing::{error, info};

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let core_count = num_cpus::get();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(core_count)
        .thread_name("mesh-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let config = prepare_config(&args).await?;
        setup_logging(&config.logging)?;
        info!("🧠 Detected {} CPU cores, using {} worker thread(s)", core_count, core_count);

        if let Err(e) = launch(args, config).await {
            error!("❌ Instance failed: {:?}", e);
            return Err(e);
        }
        Ok(())
    })
}

/// Loads the configuration file, applies command line overrides and
/// validates the result.
///
/// # Errors
/// * Configuration I/O or parse failures
/// * [`mesh_server::ServerError::Config`] from validation
async fn prepare_config(args: &CliArgs) -> Result<MeshConfig> {
    let mut config = load_config(&args.config_path).await?;
    args.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Runs the selected role until it stops or a termination signal arrives.
async fn launch(args: CliArgs, config: MeshConfig) -> Result<()> {
    let name = args
        .instance_name(&config)
        .ok_or_else(|| anyhow!("no {} is configured", args.role))?;
    let config = Arc::new(config);
    let shutdown = setup_shutdown_handler();

    match args.role {
        InstanceRole::HostManager => {
            info!("🚀 Launching host manager from {}", args.config_path.display());
            HostManager::new(config, shutdown).start().await?;
        }
        role => {
            info!("🚀 Launching {} '{}' from {}", role, name, args.config_path.display());
            Instance::bind(config, role, &name, shutdown)
                .await?
                .restarting(args.restart)
                .run()
                .await?;
        }
    }

    info!("👋 {} '{}' exited", args.role, name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_prepare_config_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        let args = CliArgs::try_parse_from([
            "mesh",
            "--role",
            "host-manager",
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "warn",
        ])
        .unwrap();

        let config = prepare_config(&args).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.logging.level, "warn");
        assert_eq!(args.instance_name(&config).as_deref(), Some("host_manager"));
    }

    #[tokio::test]
    async fn test_prepare_config_rejects_bad_override() {
        let mut file = NamedTempFile::new().unwrap();
        let content = toml::to_string_pretty(&MeshConfig::default()).unwrap();
        file.write_all(content.as_bytes()).unwrap();

        let args = CliArgs::try_parse_from([
            "mesh",
            "--role",
            "gate",
            "--config",
            file.path().to_str().unwrap(),
            "--log-level",
            "loud",
        ])
        .unwrap();
        assert!(prepare_config(&args).await.is_err());
    }

    #[tokio::test]
    async fn test_launch_unknown_instance() {
        let args = CliArgs::try_parse_from(["mesh", "--role", "server", "--name", "server_9"]).unwrap();
        let result = launch(args, MeshConfig::default()).await;
        assert!(result.is_err());
    }
}
