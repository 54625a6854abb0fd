//! # Tether
//!
//! Coordination primitives on top of a linearizable key-value store:
//! first-writer-wins key creation, lease-bound (ephemeral) writes, and
//! keep-alive streams that renew a lease until the caller lets go.
//!
//! ## Architecture
//! ```text
//! Client ──borrows──> KvStore (etcd | memory)
//!   │                    ▲
//!   └─spawns─> Renewer ──┘  (one task per keep-alive stream,
//!                            cancelled by Client::close)
//! ```
//!
//! ## Example
//! ```no_run
//! # async fn run() -> tether::Result<()> {
//! use tether::{Client, ClientConfig, FieldsMode, MatchMode};
//!
//! let client = Client::connect(ClientConfig::default()).await?;
//! let lease = client.create_lease(10).await?;
//! client.write_with_lease("/services/api/node-1", "10.0.0.7:8080", lease.id).await?;
//!
//! let mut renewals = client.keep_alive(lease.id).await?;
//! while let Some(ack) = renewals.next().await {
//!     tracing::debug!(ttl = ack.ttl, "lease renewed");
//! }
//!
//! let nodes = client.get("/services/api/", MatchMode::Prefix, FieldsMode::KeysOnly).await?;
//! # let _ = nodes;
//! client.close().await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod keepalive;
pub mod store;

pub use client::{CallOptions, Client};
pub use config::{Backend, ClientConfig, KeepAliveConfig};
pub use keepalive::{EndReason, KeepAliveStream};
pub use store::{GetOptions, KvStore, LeaseKeeper, MemoryStore};
pub use tether_common::{
    FieldsMode, KeepAliveAck, KeyValue, Lease, LeaseId, MatchMode, Result, TetherError, codec,
};

#[cfg(feature = "etcd")]
pub use store::EtcdStore;
