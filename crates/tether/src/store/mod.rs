//! Store RPC boundary.
//!
//! The client never talks to a store directly; it goes through [`KvStore`],
//! which mirrors the handful of etcd v3 RPCs the coordination protocols need:
//! - Txn (compare version == 0, then put)
//! - Put / Range
//! - LeaseGrant / LeaseRevoke / LeaseTimeToLive / LeaseKeepAlive

use async_trait::async_trait;
use tether_common::{FieldsMode, KeepAliveAck, KeyValue, Lease, LeaseId, MatchMode, Result};

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "etcd")]
mod etcd;
#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;

/// Range options; `prefix` and `keys_only` are independent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Match every key sharing the given prefix
    pub prefix: bool,
    /// Omit values from the response
    pub keys_only: bool,
}

impl GetOptions {
    pub fn new(match_mode: MatchMode, fields_mode: FieldsMode) -> Self {
        Self {
            prefix: match_mode == MatchMode::Prefix,
            keys_only: fields_mode == FieldsMode::KeysOnly,
        }
    }
}

/// A session to a linearizable key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Cheap round trip used to prove an endpoint is reachable
    async fn status(&self) -> Result<()>;

    /// Put `key` only if its version is 0 (absent), atomically.
    ///
    /// Returns whether the put executed.
    async fn create_if_absent(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<bool>;

    /// Unconditional put, bound to `lease` unless it is `LeaseId::NONE`
    async fn put(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<()>;

    /// Range read in ascending key order
    async fn get(&self, key: &[u8], options: GetOptions) -> Result<Vec<KeyValue>>;

    /// Grant a lease with the given TTL in seconds
    async fn grant(&self, ttl: i64) -> Result<Lease>;

    /// Revoke a lease, deleting every key bound to it
    async fn revoke(&self, id: LeaseId) -> Result<()>;

    /// Remaining TTL of a lease, or `None` if the store no longer knows it
    async fn time_to_live(&self, id: LeaseId) -> Result<Option<i64>>;

    /// Open a renewal channel for a lease
    async fn keep_alive(&self, id: LeaseId) -> Result<Box<dyn LeaseKeeper>>;

    /// Release the session
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One lease's renewal channel.
///
/// Renewals are long-lived: implementations must not apply a request
/// deadline to them.
#[async_trait]
pub trait LeaseKeeper: Send {
    /// Send one renewal request and wait for its acknowledgement.
    ///
    /// An acknowledgement with `ttl <= 0` means the lease is gone.
    async fn renew(&mut self) -> Result<KeepAliveAck>;
}
