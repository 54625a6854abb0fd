//! Subcommand handlers.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use tracing::{debug, info, warn};

use tether::{CallOptions, Client, FieldsMode, KeyValue, LeaseId, MatchMode, codec};
use tether_common::constants::{DEFAULT_REGISTRATION_TTL_SECS, keys::NODE_PREFIX};

use crate::node::NodeInfo;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create KEY only if it does not exist yet
    Create {
        key: String,
        value: String,
        /// Bind the key to a lease (hex id)
        #[arg(long, value_parser = parse_lease_id)]
        lease: Option<LeaseId>,
    },

    /// Write KEY unconditionally
    Put {
        key: String,
        value: String,
        /// Bind the key to a lease (hex id)
        #[arg(long, value_parser = parse_lease_id)]
        lease: Option<LeaseId>,
    },

    /// Read a key, or every key under a prefix
    Get {
        key: String,
        /// Treat KEY as a prefix
        #[arg(long)]
        prefix: bool,
        /// Print keys without values
        #[arg(long)]
        keys_only: bool,
    },

    /// Lease management
    #[command(subcommand)]
    Lease(LeaseCommand),

    /// Renew a lease until interrupted
    KeepAlive {
        #[arg(value_parser = parse_lease_id)]
        lease: LeaseId,
        /// Stop after this many renewals
        #[arg(long)]
        count: Option<usize>,
    },

    /// Register this node under an ephemeral key until interrupted
    Register {
        /// Node id (random if omitted)
        #[arg(long)]
        node_id: Option<String>,
        /// Registration lease TTL in seconds
        #[arg(long, default_value_t = DEFAULT_REGISTRATION_TTL_SECS)]
        ttl: i64,
        /// Key prefix for registrations
        #[arg(long, default_value = NODE_PREFIX)]
        prefix: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum LeaseCommand {
    /// Grant a lease with the given TTL in seconds
    Grant { ttl: i64 },
    /// Revoke a lease and delete its keys
    Revoke {
        #[arg(value_parser = parse_lease_id)]
        id: LeaseId,
    },
    /// Show a lease's remaining TTL
    Ttl {
        #[arg(value_parser = parse_lease_id)]
        id: LeaseId,
    },
}

/// Lease ids are shown and accepted in hex, with or without `0x`
fn parse_lease_id(s: &str) -> Result<LeaseId, String> {
    let digits = s.trim_start_matches("0x");
    i64::from_str_radix(digits, 16)
        .map(LeaseId::new)
        .map_err(|e| format!("invalid lease id {:?}: {}", s, e))
}

pub async fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Create { key, value, lease } => {
            let lease = lease.unwrap_or(LeaseId::NONE);
            let created = client
                .create_if_absent_with(&key, &value, lease, &CallOptions::default())
                .await
                .with_context(|| format!("Failed to create {}", key))?;
            println!("{}", if created { "created" } else { "exists" });
        }
        Command::Put { key, value, lease } => {
            client
                .write_with_lease(&key, &value, lease.unwrap_or(LeaseId::NONE))
                .await
                .with_context(|| format!("Failed to put {}", key))?;
            println!("OK");
        }
        Command::Get { key, prefix, keys_only } => {
            let match_mode = if prefix { MatchMode::Prefix } else { MatchMode::Exact };
            let fields_mode = if keys_only { FieldsMode::KeysOnly } else { FieldsMode::Full };

            let kvs = client
                .get(&key, match_mode, fields_mode)
                .await
                .with_context(|| format!("Failed to get {}", key))?;
            for kv in &kvs {
                println!("{}", format_entry(kv, keys_only));
            }
        }
        Command::Lease(cmd) => run_lease(client, cmd).await?,
        Command::KeepAlive { lease, count } => keep_alive(client, lease, count).await?,
        Command::Register { node_id, ttl, prefix } => register(client, &prefix, node_id, ttl).await?,
    }

    Ok(())
}

async fn run_lease(client: &Client, command: LeaseCommand) -> Result<()> {
    match command {
        LeaseCommand::Grant { ttl } => {
            let lease = client.create_lease(ttl).await.context("Failed to grant lease")?;
            println!("lease {} granted with TTL({}s)", lease.id, lease.ttl);
        }
        LeaseCommand::Revoke { id } => {
            client.revoke_lease(id).await.context("Failed to revoke lease")?;
            println!("lease {} revoked", id);
        }
        LeaseCommand::Ttl { id } => match client.lease_ttl(id).await? {
            Some(ttl) => println!("lease {} remaining TTL({}s)", id, ttl),
            None => println!("lease {} already expired", id),
        },
    }
    Ok(())
}

async fn keep_alive(client: &Client, lease: LeaseId, count: Option<usize>) -> Result<()> {
    let mut renewals = client
        .keep_alive(lease)
        .await
        .context("Failed to start keep-alive")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut seen = 0;

    loop {
        tokio::select! {
            ack = renewals.next() => match ack {
                Some(ack) => {
                    println!("lease {} keepalived with TTL({})", ack.id, ack.ttl);
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
                None => bail!("Keep-alive ended: {:?}", renewals.end_reason()),
            },
            res = &mut ctrl_c => {
                res.context("Failed to listen for Ctrl+C")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    renewals.cancel();
    Ok(())
}

/// Publish this node under `{prefix}{node_id}` for as long as we run
async fn register(client: &Client, prefix: &str, node_id: Option<String>, ttl: i64) -> Result<()> {
    let node = NodeInfo::collect(node_id);
    let key = format!("{}{}", prefix, node.node_id);
    let payload = codec::encode(&node)?;

    let lease = client.create_lease(ttl).await.context("Failed to grant lease")?;
    let created = client
        .create_if_absent_with(&key, &payload, lease.id, &CallOptions::default())
        .await
        .with_context(|| format!("Failed to register {}", key))?;

    if !created {
        if let Err(e) = client.revoke_lease(lease.id).await {
            warn!(lease_id = %lease.id, error = %e, "Failed to revoke unused lease");
        }
        bail!("{} is already registered", key);
    }

    info!(key = %key, lease_id = %lease.id, ttl = lease.ttl, "Node registered");

    let mut renewals = client
        .keep_alive(lease.id)
        .await
        .context("Failed to start keep-alive")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            ack = renewals.next() => match ack {
                Some(ack) => debug!(lease_id = %ack.id, ttl = ack.ttl, "Registration renewed"),
                None => bail!("Registration {} lost: {:?}", key, renewals.end_reason()),
            },
            res = &mut ctrl_c => {
                res.context("Failed to listen for Ctrl+C")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    renewals.cancel();
    if let Err(e) = client.revoke_lease(lease.id).await {
        warn!(lease_id = %lease.id, error = %e, "Failed to revoke registration lease");
    }
    info!(key = %key, "Node deregistered");

    Ok(())
}

fn format_entry(kv: &KeyValue, keys_only: bool) -> String {
    let key = String::from_utf8_lossy(&kv.key);
    if keys_only {
        format!("{} (version {})", key, kv.version)
    } else {
        format!("{} = {}", key, String::from_utf8_lossy(&kv.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether::{Backend, ClientConfig};

    #[test]
    fn test_parse_lease_id() {
        assert_eq!(parse_lease_id("2a").unwrap(), LeaseId::new(42));
        assert_eq!(parse_lease_id("0x2a").unwrap(), LeaseId::new(42));
        assert!(parse_lease_id("zz").is_err());
    }

    #[test]
    fn test_format_entry() {
        let kv = KeyValue {
            key: b"foo".to_vec(),
            value: b"100".to_vec(),
            version: 3,
            ..Default::default()
        };
        assert_eq!(format_entry(&kv, false), "foo = 100");
        assert_eq!(format_entry(&kv, true), "foo (version 3)");
    }

    #[tokio::test]
    async fn test_run_against_memory_store() {
        let client = Client::connect(ClientConfig {
            backend: Backend::Memory,
            ..Default::default()
        })
        .await
        .unwrap();

        let create = Command::Create {
            key: "foo".to_string(),
            value: "100".to_string(),
            lease: None,
        };
        run(&client, create).await.unwrap();

        run(&client, Command::Lease(LeaseCommand::Grant { ttl: 30 }))
            .await
            .unwrap();
        run(
            &client,
            Command::Get {
                key: "f".to_string(),
                prefix: true,
                keys_only: true,
            },
        )
        .await
        .unwrap();

        let kvs = client.get("foo", MatchMode::Exact, FieldsMode::Full).await.unwrap();
        assert_eq!(kvs[0].value, b"100");

        let bad_lease = Command::Put {
            key: "bar".to_string(),
            value: "1".to_string(),
            lease: Some(LeaseId::new(1)),
        };
        assert!(run(&client, bad_lease).await.is_err());

        client.close().await.unwrap();
    }
}
