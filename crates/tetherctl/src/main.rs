//! # tetherctl - Tether coordination CLI
//!
//! Thin operator front-end over the `tether` client: first-writer-wins
//! creates, lease management, keep-alives, and ephemeral node registration.
//!
//! ## Architecture
//! ```text
//! tetherctl → tether::Client → etcd (or in-process memory store)
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether::{Backend, Client, ClientConfig};

mod commands;
mod node;

use commands::Command;

/// Tether - lease-based coordination client
#[derive(Parser, Debug)]
#[command(name = "tetherctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/tether.toml")]
    config: String,

    /// Store backend (overrides config)
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Comma-separated store endpoints (overrides config)
    #[arg(short, long, env = "ETCD_ENDPOINT", value_delimiter = ',')]
    endpoints: Option<Vec<String>>,

    /// Store username (overrides config)
    #[arg(long, env = "ETCD_USER")]
    user: Option<String>,

    /// Store password (overrides config)
    #[arg(long, env = "ETCD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Etcd,
    Memory,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Etcd => Backend::Etcd,
            BackendArg::Memory => Backend::Memory,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env first so clap's `env = ...` fallbacks can see it
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    let config = load_config(&args)?;
    info!(
        backend = ?config.backend,
        endpoints = ?config.endpoints,
        "Configuration loaded from {}",
        args.config
    );

    let client = Client::connect(config)
        .await
        .context("Failed to connect to store")?;

    let result = commands::run(&client, args.command).await;

    client.close().await.context("Failed to close connection")?;
    result
}

/// Load the config file, then apply CLI overrides
fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = ClientConfig::load(&args.config).context("Failed to load configuration")?;

    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    if let Some(ref endpoints) = args.endpoints {
        config.endpoints = endpoints.clone();
    }
    if let Some(ref user) = args.user {
        config.username = Some(user.clone());
    }
    if let Some(ref password) = args.password {
        config.password = Some(password.clone());
    }

    Ok(config)
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "tetherctl",
            "--config",
            "/nonexistent/tether.toml",
            "--backend",
            "memory",
            "--endpoints",
            "10.0.0.1:2379,10.0.0.2:2379",
            "--user",
            "root",
            "--password",
            "password",
            "get",
            "foo",
        ])
        .unwrap();

        let config = load_config(&args).unwrap();
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.endpoints, vec!["10.0.0.1:2379", "10.0.0.2:2379"]);
        assert!(config.credentials().is_some());
    }

    #[test]
    fn test_args_verify() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
