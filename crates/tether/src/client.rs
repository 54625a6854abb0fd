//! Connection handle and the coordination protocols built on it.
//!
//! A [`Client`] owns one store session. Bounded calls borrow it (`&Client`)
//! and may run concurrently; each is wrapped in a deadline and can be
//! aborted by a caller-supplied cancellation token. Keep-alive streams are
//! spawned on the client's task tracker and hold a child of its shutdown
//! token, so [`Client::close`] ends all of them before the session is
//! released.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use tether_common::constants::MAX_LEASE_TTL_SECS;
use tether_common::{
    FieldsMode, KeyValue, Lease, LeaseId, MatchMode, Result, TetherError,
};

use crate::config::{Backend, ClientConfig};
use crate::keepalive::{self, KeepAliveStream};
use crate::store::{GetOptions, KvStore, MemoryStore};

/// Per-call overrides for bounded operations
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline for this call (defaults to the client's `op_timeout`)
    pub timeout: Option<Duration>,
    /// Aborts the call with `TetherError::Cancelled` when triggered
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Connection handle to the store
pub struct Client {
    config: ClientConfig,
    /// `None` once closed
    session: RwLock<Option<Arc<dyn KvStore>>>,
    /// Parent of every keep-alive stream's token
    shutdown: CancellationToken,
    /// Keep-alive renewers spawned from this handle
    tasks: TaskTracker,
}

impl Client {
    /// Open a session to the configured backend.
    ///
    /// Fails with `TetherError::Connection` if no endpoint answers within
    /// `dial_timeout`.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let store: Arc<dyn KvStore> = match config.backend {
            Backend::Memory => Arc::new(MemoryStore::new()),
            #[cfg(feature = "etcd")]
            Backend::Etcd => Arc::new(
                crate::store::EtcdStore::connect(
                    &config.endpoints,
                    config.credentials(),
                    config.dial_timeout(),
                )
                .await?,
            ),
            #[cfg(not(feature = "etcd"))]
            Backend::Etcd => {
                return Err(TetherError::Config(
                    "etcd backend requires the `etcd` feature".to_string(),
                ));
            }
        };

        Self::with_store(store, config).await
    }

    /// Wrap an existing store session, probing it within `dial_timeout`
    pub async fn with_store(store: Arc<dyn KvStore>, config: ClientConfig) -> Result<Self> {
        let dial_timeout = config.dial_timeout();

        match tokio::time::timeout(dial_timeout, store.status()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TetherError::Connection(e.to_string())),
            Err(_) => {
                return Err(TetherError::Connection(format!(
                    "store did not answer within {:?}",
                    dial_timeout
                )));
            }
        }

        tracing::info!(
            backend = ?config.backend,
            endpoints = ?config.endpoints,
            "Connected to store"
        );

        Ok(Self {
            config,
            session: RwLock::new(Some(store)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn session(&self) -> Result<Arc<dyn KvStore>> {
        self.session.read().await.clone().ok_or(TetherError::Closed)
    }

    /// Run a store call under the deadline, the caller's cancellation token,
    /// and the handle's shutdown token
    async fn bounded<T>(
        &self,
        op: &'static str,
        options: &CallOptions,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = options.timeout.unwrap_or_else(|| self.config.op_timeout());
        let caller_cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TetherError::Closed),
            _ = caller_cancelled => {
                tracing::debug!(op = op, "Operation cancelled by caller");
                Err(TetherError::Cancelled)
            }
            res = tokio::time::timeout(timeout, call) => match res {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(op = op, timeout = ?timeout, "Operation deadline exceeded");
                    Err(TetherError::Timeout(format!("{} exceeded {:?}", op, timeout)))
                }
            },
        }
    }

    // === Atomic creation ===

    /// Create `key` only if it does not exist.
    ///
    /// Returns `false` (not an error) when another writer already holds the
    /// key. On `Timeout` the write may or may not have landed; retrying this
    /// call is safe.
    pub async fn create_if_absent(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<bool> {
        self.create_if_absent_with(key, value, LeaseId::NONE, &CallOptions::default())
            .await
    }

    /// [`Client::create_if_absent`], optionally bound to a lease
    pub async fn create_if_absent_with(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        lease: LeaseId,
        options: &CallOptions,
    ) -> Result<bool> {
        let (key, value) = (key.as_ref(), value.as_ref());
        let store = self.session().await?;

        let created = self
            .bounded("create_if_absent", options, store.create_if_absent(key, value, lease))
            .await?;

        tracing::debug!(
            key = %String::from_utf8_lossy(key),
            lease_id = %lease,
            created = created,
            "Create if absent"
        );
        Ok(created)
    }

    // === Writes ===

    /// Durable, unconditional write
    pub async fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.put_with(key, value, LeaseId::NONE, &CallOptions::default())
            .await
    }

    /// Unconditional write bound to `lease` (`LeaseId::NONE` for a durable write).
    ///
    /// Fails with `TetherError::NotFound` if the lease has expired.
    pub async fn write_with_lease(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        lease: LeaseId,
    ) -> Result<()> {
        self.put_with(key, value, lease, &CallOptions::default())
            .await
    }

    pub async fn put_with(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        lease: LeaseId,
        options: &CallOptions,
    ) -> Result<()> {
        let (key, value) = (key.as_ref(), value.as_ref());
        let store = self.session().await?;

        self.bounded("put", options, store.put(key, value, lease))
            .await?;

        tracing::debug!(key = %String::from_utf8_lossy(key), lease_id = %lease, "Put");
        Ok(())
    }

    // === Reads ===

    /// Read a key or every key under a prefix, in ascending key order.
    ///
    /// A missing key yields an empty vector.
    pub async fn get(
        &self,
        key: impl AsRef<[u8]>,
        match_mode: MatchMode,
        fields_mode: FieldsMode,
    ) -> Result<Vec<KeyValue>> {
        self.get_with(key, match_mode, fields_mode, &CallOptions::default())
            .await
    }

    pub async fn get_with(
        &self,
        key: impl AsRef<[u8]>,
        match_mode: MatchMode,
        fields_mode: FieldsMode,
        options: &CallOptions,
    ) -> Result<Vec<KeyValue>> {
        let key = key.as_ref();
        let store = self.session().await?;

        let kvs = self
            .bounded("get", options, store.get(key, GetOptions::new(match_mode, fields_mode)))
            .await?;

        tracing::debug!(
            key = %String::from_utf8_lossy(key),
            match_mode = ?match_mode,
            fields_mode = ?fields_mode,
            count = kvs.len(),
            "Get"
        );
        Ok(kvs)
    }

    // === Leases ===

    /// Grant a lease. A non-positive TTL is rejected before any store call.
    pub async fn create_lease(&self, ttl_seconds: i64) -> Result<Lease> {
        self.create_lease_with(ttl_seconds, &CallOptions::default())
            .await
    }

    pub async fn create_lease_with(&self, ttl_seconds: i64, options: &CallOptions) -> Result<Lease> {
        if ttl_seconds <= 0 {
            return Err(TetherError::InvalidArgument(format!(
                "lease TTL must be positive, got {}",
                ttl_seconds
            )));
        }
        if ttl_seconds > MAX_LEASE_TTL_SECS {
            return Err(TetherError::InvalidArgument(format!(
                "lease TTL {} exceeds the maximum of {}",
                ttl_seconds, MAX_LEASE_TTL_SECS
            )));
        }
        let store = self.session().await?;

        let lease = self
            .bounded("create_lease", options, store.grant(ttl_seconds))
            .await?;

        tracing::debug!(lease_id = %lease.id, ttl = lease.ttl, "Lease granted");
        Ok(lease)
    }

    /// Revoke a lease now, deleting every key bound to it
    pub async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        if lease.is_none() {
            return Err(TetherError::InvalidArgument("cannot revoke the empty lease".to_string()));
        }
        let store = self.session().await?;

        self.bounded("revoke_lease", &CallOptions::default(), store.revoke(lease))
            .await?;

        tracing::debug!(lease_id = %lease, "Lease revoked");
        Ok(())
    }

    /// Remaining TTL in seconds, or `None` if the lease is gone
    pub async fn lease_ttl(&self, lease: LeaseId) -> Result<Option<i64>> {
        let store = self.session().await?;
        self.bounded("lease_ttl", &CallOptions::default(), store.time_to_live(lease))
            .await
    }

    // === Keep-alive ===

    /// Start renewing `lease` in the background.
    ///
    /// Registration is bounded by `op_timeout`; renewal afterwards is not.
    /// The stream ends on `cancel()`/drop, on `close()`, or when the lease is
    /// lost.
    pub async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        if lease.is_none() {
            return Err(TetherError::InvalidArgument(
                "cannot keep the empty lease alive".to_string(),
            ));
        }
        let store = self.session().await?;

        keepalive::start(
            store,
            lease,
            self.config.keep_alive.clone(),
            self.config.op_timeout(),
            &self.shutdown,
            &self.tasks,
        )
        .await
    }

    // === Shutdown ===

    /// End every keep-alive stream, then release the session.
    ///
    /// Later calls fail with `TetherError::Closed`. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let Some(store) = self.session.write().await.take() else {
            return Ok(());
        };

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        store.close().await?;

        tracing::info!("Connection closed");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Renewers must not outlive the handle even without close()
        self.shutdown.cancel();
    }
}
