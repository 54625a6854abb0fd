//! In-process store with etcd semantics.
//!
//! Keeps per-key versions and a global revision, grants leases with
//! server-side expiry, and hands out renewal channels, all behind one mutex
//! so every operation is linearizable. Expiry is evaluated lazily against
//! `tokio::time::Instant`, which lets tests drive lease time with a paused
//! clock.
//!
//! Fault injection (`set_unavailable`, `set_latency`, `set_stall_renewals`)
//! simulates a lost session, a slow store, or a renewal channel that has
//! silently stopped answering.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use tether_common::constants::MAX_LEASE_TTL_SECS;
use tether_common::{KeepAliveAck, KeyValue, Lease, LeaseId, Result, TetherError};

use super::{GetOptions, KvStore, LeaseKeeper};

/// In-memory linearizable store
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct Faults {
    /// Every RPC fails with a connection error while set
    unavailable: AtomicBool,
    /// Added before every bounded RPC (not renewals)
    latency_ms: AtomicU64,
    /// Renewal requests received
    renewals: AtomicU64,
    /// Renewal requests are accepted but never answered while set
    stall_renewals: AtomicBool,
}

struct Entry {
    value: Vec<u8>,
    version: i64,
    create_revision: i64,
    mod_revision: i64,
    lease: LeaseId,
}

struct LeaseRecord {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<Vec<u8>>,
}

struct State {
    revision: i64,
    next_lease: i64,
    entries: BTreeMap<Vec<u8>, Entry>,
    leases: HashMap<LeaseId, LeaseRecord>,
}

impl State {
    /// Drop leases past their deadline, along with their keys
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let removed = self.remove_lease(id);
            tracing::debug!(lease_id = %id, keys = removed, "Lease expired");
        }
    }

    fn remove_lease(&mut self, id: LeaseId) -> usize {
        let Some(record) = self.leases.remove(&id) else {
            return 0;
        };

        let mut removed = 0;
        for key in record.keys {
            if self.entries.get(&key).is_some_and(|e| e.lease == id) {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            self.revision += 1;
        }
        removed
    }

    fn put_entry(&mut self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<()> {
        if !lease.is_none() && !self.leases.contains_key(&lease) {
            return Err(TetherError::NotFound(format!("requested lease {} not found", lease)));
        }

        self.revision += 1;
        let revision = self.revision;

        let previous_lease = match self.entries.get_mut(key) {
            Some(entry) => {
                let previous = entry.lease;
                entry.value = value.to_vec();
                entry.version += 1;
                entry.mod_revision = revision;
                entry.lease = lease;
                Some(previous)
            }
            None => {
                self.entries.insert(
                    key.to_vec(),
                    Entry {
                        value: value.to_vec(),
                        version: 1,
                        create_revision: revision,
                        mod_revision: revision,
                        lease,
                    },
                );
                None
            }
        };

        if let Some(previous) = previous_lease.filter(|p| *p != lease) {
            if let Some(record) = self.leases.get_mut(&previous) {
                record.keys.remove(key);
            }
        }
        if let Some(record) = self.leases.get_mut(&lease) {
            record.keys.insert(key.to_vec());
        }

        Ok(())
    }

    fn range(&self, key: &[u8], options: GetOptions) -> Vec<KeyValue> {
        let to_kv = |(k, e): (&Vec<u8>, &Entry)| KeyValue {
            key: k.clone(),
            value: if options.keys_only {
                Vec::new()
            } else {
                e.value.clone()
            },
            version: e.version,
            create_revision: e.create_revision,
            mod_revision: e.mod_revision,
            lease: e.lease,
        };

        if options.prefix {
            self.entries
                .range(key.to_vec()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(to_kv)
                .collect()
        } else {
            self.entries.get_key_value(key).map(to_kv).into_iter().collect()
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        use rand::Rng;

        // Lease ids are opaque; start somewhere unpredictable like a real store
        let next_lease = rand::rng().random_range(1..1i64 << 40);

        Self {
            state: Arc::new(Mutex::new(State {
                revision: 1,
                next_lease,
                entries: BTreeMap::new(),
                leases: HashMap::new(),
            })),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Make every RPC fail with a connection error until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every bounded RPC by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Accept renewal requests without ever answering them, like a
    /// half-open keep-alive stream
    pub fn set_stall_renewals(&self, stall: bool) {
        self.faults.stall_renewals.store(stall, Ordering::SeqCst);
    }

    /// Renewal requests received so far
    pub fn renewal_count(&self) -> u64 {
        self.faults.renewals.load(Ordering::SeqCst)
    }

    /// Live leases right now
    pub async fn lease_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        state.leases.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(TetherError::Connection("memory store unavailable".to_string()));
        }
        Ok(())
    }

    /// Apply injected faults ahead of a bounded RPC
    async fn ready(&self) -> Result<()> {
        self.check_available()?;
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        Ok(())
    }

    async fn renew_lease(&self, id: LeaseId) -> Result<KeepAliveAck> {
        self.check_available()?;
        self.faults.renewals.fetch_add(1, Ordering::SeqCst);
        if self.faults.stall_renewals.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        let ttl = match state.leases.get_mut(&id) {
            Some(record) => {
                record.deadline = now + Duration::from_secs(record.ttl as u64);
                record.ttl
            }
            None => 0,
        };

        Ok(KeepAliveAck { id, ttl })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn status(&self) -> Result<()> {
        self.ready().await
    }

    async fn create_if_absent(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<bool> {
        self.ready().await?;
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());

        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.put_entry(key, value, lease)?;
        Ok(true)
    }

    async fn put(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<()> {
        self.ready().await?;
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        state.put_entry(key, value, lease)
    }

    async fn get(&self, key: &[u8], options: GetOptions) -> Result<Vec<KeyValue>> {
        self.ready().await?;
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        Ok(state.range(key, options))
    }

    async fn grant(&self, ttl: i64) -> Result<Lease> {
        self.ready().await?;
        if ttl <= 0 {
            return Err(TetherError::InvalidArgument(format!("lease TTL must be positive, got {}", ttl)));
        }
        if ttl > MAX_LEASE_TTL_SECS {
            return Err(TetherError::InvalidArgument(format!(
                "lease TTL {} exceeds the maximum of {}",
                ttl, MAX_LEASE_TTL_SECS
            )));
        }

        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        state.next_lease += 1;
        let id = LeaseId::new(state.next_lease);
        state.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline: now + Duration::from_secs(ttl as u64),
                keys: BTreeSet::new(),
            },
        );

        Ok(Lease { id, ttl })
    }

    async fn revoke(&self, id: LeaseId) -> Result<()> {
        self.ready().await?;
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());

        if !state.leases.contains_key(&id) {
            return Err(TetherError::NotFound(format!("requested lease {} not found", id)));
        }
        state.remove_lease(id);
        Ok(())
    }

    async fn time_to_live(&self, id: LeaseId) -> Result<Option<i64>> {
        self.ready().await?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        Ok(state
            .leases
            .get(&id)
            .map(|record| record.deadline.saturating_duration_since(now).as_secs() as i64))
    }

    async fn keep_alive(&self, id: LeaseId) -> Result<Box<dyn LeaseKeeper>> {
        self.ready().await?;
        Ok(Box::new(MemoryKeeper {
            store: self.clone(),
            id,
        }))
    }
}

/// Renewal channel into a [`MemoryStore`]
struct MemoryKeeper {
    store: MemoryStore,
    id: LeaseId,
}

#[async_trait]
impl LeaseKeeper for MemoryKeeper {
    async fn renew(&mut self) -> Result<KeepAliveAck> {
        self.store.renew_lease(self.id).await
    }
}
