//! Command line interface for the mesh launcher.
//!
//! One binary runs every role; `--role` and `--name` pick which entry of the
//! shared cluster configuration this process is.

use clap::error::ErrorKind;
use clap::{Arg, ArgAction, ArgMatches, Command};
use mesh_core::protocol::InstanceRole;
use mesh_server::MeshConfig;
use std::path::PathBuf;

/// Command line arguments
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub role: InstanceRole,
    pub name: Option<String>,
    pub config_path: PathBuf,
    pub log_level: Option<String>,
    pub json_logs: bool,
    pub restart: bool,
}

impl CliArgs {
    /// Parse command line arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches()).unwrap_or_else(|e| e.exit())
    }

    /// Parse an explicit argument list.
    ///
    /// # Errors
    ///
    /// The clap error describing the first invalid or missing argument.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::from_matches(&command().try_get_matches_from(args)?)
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self, clap::Error> {
        let role = matches
            .get_one::<InstanceRole>("role")
            .copied()
            .ok_or_else(|| clap::Error::raw(ErrorKind::MissingRequiredArgument, "--role is required\n"))?;

        Ok(Self {
            role,
            name: matches.get_one::<String>("name").cloned(),
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            restart: matches.get_flag("restart"),
        })
    }

    /// Applies command line overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut MeshConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
    }

    /// The configured instance this process runs as.
    ///
    /// Without `--name` the first configured instance of the role is used.
    ///
    /// # Returns
    ///
    /// `None` when the role has no configured instance.
    pub fn instance_name(&self, config: &MeshConfig) -> Option<String> {
        if let Some(name) = &self.name {
            return Some(name.clone());
        }
        match self.role {
            InstanceRole::Gate => config.gates.first().map(|g| g.name.clone()),
            InstanceRole::Server => config.servers.first().map(|s| s.name.clone()),
            InstanceRole::ServiceManager => config.service_manager.as_ref().map(|s| s.name.clone()),
            InstanceRole::HostManager => Some(mesh_server::config::HOST_MANAGER_ID.to_string()),
            InstanceRole::Client => None,
        }
    }
}

fn parse_role(value: &str) -> Result<InstanceRole, String> {
    match value.parse::<InstanceRole>()? {
        InstanceRole::Client => Err("clients connect with MeshClient, not the launcher".to_string()),
        role => Ok(role),
    }
}

fn command() -> Command {
    Command::new("Mesh")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Entity mesh instance launcher")
        .arg(
            Arg::new("role")
                .short('r')
                .long("role")
                .value_name("ROLE")
                .help("Instance role (host-manager, gate, server, service-manager)")
                .required(true)
                .value_parser(parse_role),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .value_name("NAME")
                .help("Instance name from the configuration (defaults to the first of the role)"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("restart")
                .long("restart")
                .help("Rejoin a running cluster in place of a crashed instance")
                .action(ArgAction::SetTrue),
        )
}
