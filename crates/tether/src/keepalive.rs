//! Keep-alive streams.
//!
//! Each stream owns a background renewer task that renews one lease every
//! third of its TTL, independent of how fast the caller reads. Acks go
//! through a single-slot `watch` channel: an unread ack is replaced by the
//! next one instead of blocking renewal.
//!
//! The renewer stops when:
//! - the caller cancels (or drops) the stream,
//! - the owning `Client` closes,
//! - the store reports the lease gone, or the last ack's TTL runs out
//!   without another answer,
//! - transient failures outlast the retry budget.
//!
//! Each renewal request is raced against the renewal interval and the time
//! left on the lease, so a renewal channel that stops answering counts as a
//! transient failure rather than a hang.
//!
//! In every case the ack channel closes, so `next()` returns `None`
//! instead of stalling.

use futures::Stream;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use tether_common::constants::MAX_LEASE_TTL_SECS;
use tether_common::{KeepAliveAck, LeaseId, Result, TetherError};

use crate::config::KeepAliveConfig;
use crate::store::{KvStore, LeaseKeeper};

/// Why a keep-alive stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The caller cancelled or dropped the stream
    Cancelled,
    /// The owning client was closed
    HandleClosed,
    /// The store no longer knows the lease (expired or revoked)
    LeaseExpired,
    /// Renewal failed for good
    Failed(String),
}

/// Renewal acknowledgements for one lease
pub struct KeepAliveStream {
    lease: LeaseId,
    acks: watch::Receiver<Option<KeepAliveAck>>,
    end: Arc<OnceLock<EndReason>>,
    cancel: CancellationToken,
}

impl KeepAliveStream {
    /// The lease being kept alive
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Wait for the next acknowledgement.
    ///
    /// Returns the most recent unread ack (older unread ones are dropped),
    /// or `None` once renewal has stopped.
    pub async fn next(&mut self) -> Option<KeepAliveAck> {
        loop {
            if self.acks.changed().await.is_err() {
                return None;
            }
            if let Some(ack) = *self.acks.borrow_and_update() {
                return Some(ack);
            }
        }
    }

    /// Stop renewing. An ack that was already buffered is still returned by
    /// the next `next()`; after that the stream ends.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the renewer has stopped
    pub fn is_finished(&self) -> bool {
        self.end.get().is_some()
    }

    /// Why renewal stopped, once it has
    pub fn end_reason(&self) -> Option<EndReason> {
        self.end.get().cloned()
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = KeepAliveAck> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|ack| (ack, stream))
        })
    }
}

impl Drop for KeepAliveStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Register a renewal channel for `lease` and spawn its renewer on `tasks`.
///
/// Registration and the first renewal are bounded by `register_timeout`;
/// later renewals are not.
pub(crate) async fn start(
    store: Arc<dyn KvStore>,
    lease: LeaseId,
    config: KeepAliveConfig,
    register_timeout: Duration,
    shutdown: &CancellationToken,
    tasks: &TaskTracker,
) -> Result<KeepAliveStream> {
    let register = async {
        let mut keeper = store.keep_alive(lease).await?;
        let ack = keeper.renew().await?;
        Ok::<_, TetherError>((keeper, ack))
    };

    let (keeper, first) = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(TetherError::Closed),
        res = tokio::time::timeout(register_timeout, register) => res.map_err(|_| {
            TetherError::Timeout(format!(
                "keep-alive registration for lease {} exceeded {:?}",
                lease, register_timeout
            ))
        })??,
    };

    if first.ttl <= 0 {
        return Err(TetherError::NotFound(format!("requested lease {} not found", lease)));
    }
    // close() may have drained the tracker while registration finished
    if shutdown.is_cancelled() {
        return Err(TetherError::Closed);
    }

    let cancel = shutdown.child_token();
    let (tx, rx) = watch::channel(None);
    tx.send_replace(Some(first));
    let end = Arc::new(OnceLock::new());

    let renewer = Renewer {
        store,
        lease,
        keeper,
        config,
        shutdown: shutdown.clone(),
        cancel: cancel.clone(),
        acks: tx,
        end: end.clone(),
        expires_at: lease_deadline(first.ttl),
    };
    tasks.spawn(renewer.run(first.ttl));

    tracing::info!(lease_id = %lease, ttl = first.ttl, "Keep-alive started");

    Ok(KeepAliveStream {
        lease,
        acks: rx,
        end,
        cancel,
    })
}

/// Background renewal loop for one lease
struct Renewer {
    store: Arc<dyn KvStore>,
    lease: LeaseId,
    keeper: Box<dyn LeaseKeeper>,
    config: KeepAliveConfig,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    acks: watch::Sender<Option<KeepAliveAck>>,
    end: Arc<OnceLock<EndReason>>,
    /// When the lease lapses unless another ack arrives
    expires_at: Instant,
}

impl Renewer {
    async fn run(mut self, ttl: i64) {
        let reason = self.renew_loop(ttl).await;

        match &reason {
            EndReason::Cancelled | EndReason::HandleClosed => {
                tracing::info!(lease_id = %self.lease, reason = ?reason, "Keep-alive stopped");
            }
            EndReason::LeaseExpired => {
                tracing::warn!(lease_id = %self.lease, "Keep-alive ended: lease expired or revoked");
            }
            EndReason::Failed(error) => {
                tracing::error!(lease_id = %self.lease, error = %error, "Keep-alive failed");
            }
        }

        let _ = self.end.set(reason);
        // Dropping `self.acks` here closes the channel and ends the stream
    }

    async fn renew_loop(&mut self, mut ttl: i64) -> EndReason {
        loop {
            let interval = self.config.renew_interval(ttl);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return EndReason::HandleClosed,
                _ = self.cancel.cancelled() => return EndReason::Cancelled,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.renew_with_retry(interval).await {
                Ok(ack) if ack.ttl > 0 => {
                    tracing::trace!(lease_id = %self.lease, ttl = ack.ttl, "Lease renewed");
                    ttl = ack.ttl;
                    self.expires_at = lease_deadline(ack.ttl);
                    self.acks.send_replace(Some(ack));
                }
                Ok(_) => return EndReason::LeaseExpired,
                Err(reason) => return reason,
            }
        }
    }

    /// One renewal round, retrying transient failures with exponential
    /// backoff and a fresh renewal channel per retry.
    ///
    /// An attempt gets at most `interval`, and never more than the time left
    /// on the lease. Once the lease has run out the round ends as
    /// `LeaseExpired`.
    async fn renew_with_retry(&mut self, interval: Duration) -> Result<KeepAliveAck, EndReason> {
        let mut attempt = 0;
        let mut backoff = self.config.initial_backoff();

        loop {
            let remaining = self.expires_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EndReason::LeaseExpired);
            }
            let limit = interval.min(remaining);

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(EndReason::HandleClosed),
                _ = self.cancel.cancelled() => return Err(EndReason::Cancelled),
                res = tokio::time::timeout(
                    limit,
                    Self::attempt(&self.store, &mut self.keeper, self.lease, attempt > 0),
                ) => res.unwrap_or_else(|_| {
                    Err(TetherError::Timeout(format!("no renewal response within {:?}", limit)))
                }),
            };

            let error = match result {
                Ok(ack) => return Ok(ack),
                Err(TetherError::NotFound(_)) => return Err(EndReason::LeaseExpired),
                Err(e) => e,
            };

            if Instant::now() >= self.expires_at {
                return Err(EndReason::LeaseExpired);
            }
            if !error.is_retryable() || attempt >= self.config.max_retries {
                return Err(EndReason::Failed(error.to_string()));
            }

            attempt += 1;
            let delay = with_jitter(backoff);
            tracing::warn!(
                lease_id = %self.lease,
                attempt = attempt,
                max_retries = self.config.max_retries,
                delay = ?delay,
                error = %error,
                "Lease renewal failed, retrying"
            );

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(EndReason::HandleClosed),
                _ = self.cancel.cancelled() => return Err(EndReason::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff());
        }
    }

    async fn attempt(
        store: &Arc<dyn KvStore>,
        keeper: &mut Box<dyn LeaseKeeper>,
        lease: LeaseId,
        reconnect: bool,
    ) -> Result<KeepAliveAck> {
        if reconnect {
            *keeper = store.keep_alive(lease).await?;
        }
        keeper.renew().await
    }
}

/// When a lease acknowledged just now with `ttl` lapses
fn lease_deadline(ttl: i64) -> Instant {
    let now = Instant::now();
    let ttl = Duration::from_secs(ttl.clamp(0, MAX_LEASE_TTL_SECS) as u64);
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64))
}

/// Up to 25% extra delay so renewers sharing a failed store spread out
fn with_jitter(backoff: Duration) -> Duration {
    use rand::Rng;

    let extra = backoff.as_millis() as u64 / 4;
    if extra == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::rng().random_range(0..=extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GetOptions, MemoryStore};
    use tether_common::{KeyValue, Lease};
    use futures::StreamExt;
    use tokio_test::{assert_pending, assert_ready, task};

    struct Harness {
        store: MemoryStore,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }
        }

        async fn start(&self, lease: LeaseId) -> Result<KeepAliveStream> {
            start(
                Arc::new(self.store.clone()),
                lease,
                KeepAliveConfig::default(),
                Duration::from_secs(5),
                &self.shutdown,
                &self.tasks,
            )
            .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_ack_is_immediate() {
        let h = Harness::new();
        let lease = h.store.grant(30).await.unwrap();

        let mut stream = h.start(lease.id).await.unwrap();
        assert_eq!(stream.lease(), lease.id);

        let mut next = task::spawn(stream.next());
        let ack = assert_ready!(next.poll());
        assert_eq!(ack, Some(KeepAliveAck { id: lease.id, ttl: 30 }));
        drop(next);

        // Next renewal is ttl/3 away
        let mut next = task::spawn(stream.next());
        assert_pending!(next.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_lease_fails_registration() {
        let h = Harness::new();
        let result = h.start(LeaseId::new(99)).await;
        assert!(matches!(result, Err(TetherError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_fails_registration() {
        let h = Harness::new();
        let lease = h.store.grant(10).await.unwrap();
        h.store.set_unavailable(true);

        let result = h.start(lease.id).await;
        assert!(matches!(result, Err(TetherError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_registration_times_out() {
        let h = Harness::new();
        let lease = h.store.grant(30).await.unwrap();
        h.store.set_latency(Duration::from_secs(10));

        let result = h.start(lease.id).await;
        assert!(matches!(result, Err(TetherError::Timeout(_))));
        assert!(h.tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_registration() {
        let h = Harness::new();
        let lease = h.store.grant(30).await.unwrap();
        h.store.set_latency(Duration::from_secs(2));

        let (result, _) = tokio::join!(h.start(lease.id), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.shutdown.cancel();
        });
        assert!(matches!(result, Err(TetherError::Closed)));
        assert!(h.tasks.is_empty());
    }

    /// Cancels the shutdown token as soon as a renewal channel is opened, so
    /// registration completes after close has begun
    struct CloseOnKeepAlive {
        inner: MemoryStore,
        shutdown: CancellationToken,
    }

    #[async_trait::async_trait]
    impl KvStore for CloseOnKeepAlive {
        async fn status(&self) -> Result<()> {
            self.inner.status().await
        }
        async fn create_if_absent(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<bool> {
            self.inner.create_if_absent(key, value, lease).await
        }
        async fn put(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<()> {
            self.inner.put(key, value, lease).await
        }
        async fn get(&self, key: &[u8], options: GetOptions) -> Result<Vec<KeyValue>> {
            self.inner.get(key, options).await
        }
        async fn grant(&self, ttl: i64) -> Result<Lease> {
            self.inner.grant(ttl).await
        }
        async fn revoke(&self, id: LeaseId) -> Result<()> {
            self.inner.revoke(id).await
        }
        async fn time_to_live(&self, id: LeaseId) -> Result<Option<i64>> {
            self.inner.time_to_live(id).await
        }
        async fn keep_alive(&self, id: LeaseId) -> Result<Box<dyn LeaseKeeper>> {
            self.shutdown.cancel();
            self.inner.keep_alive(id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_renewer_after_close() {
        let h = Harness::new();
        let lease = h.store.grant(30).await.unwrap();
        let store = CloseOnKeepAlive {
            inner: h.store.clone(),
            shutdown: h.shutdown.clone(),
        };

        let result = start(
            Arc::new(store),
            lease.id,
            KeepAliveConfig::default(),
            Duration::from_secs(5),
            &h.shutdown,
            &h.tasks,
        )
        .await;
        assert!(matches!(result, Err(TetherError::Closed)));
        assert!(h.tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_renewal_ends_when_lease_runs_out() {
        let h = Harness::new();
        let lease = h.store.grant(3).await.unwrap();
        let mut stream = h.start(lease.id).await.unwrap();
        assert!(stream.next().await.is_some());
        let started = Instant::now();

        // Requests are accepted but never answered, on every new channel too
        h.store.set_stall_renewals(true);

        assert_eq!(stream.next().await, None);
        assert_eq!(stream.end_reason(), Some(EndReason::LeaseExpired));
        assert!(started.elapsed() <= Duration::from_secs(3));
        assert!(h.store.renewal_count() >= 3);
        assert_eq!(h.store.time_to_live(lease.id).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_renewal_recovers_on_fresh_channel() {
        let h = Harness::new();
        let lease = h.store.grant(3).await.unwrap();
        let mut stream = h.start(lease.id).await.unwrap();
        assert!(stream.next().await.is_some());

        // The renewal sent at 1s hangs; the retry after its 1s window succeeds
        h.store.set_stall_renewals(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.store.set_stall_renewals(false);

        let ack = stream.next().await.unwrap();
        assert_eq!(ack, KeepAliveAck { id: lease.id, ttl: 3 });
        assert!(!stream.is_finished());
        assert!(h.store.time_to_live(lease.id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_does_not_stall_renewal() {
        let h = Harness::new();
        let lease = h.store.grant(3).await.unwrap();
        let mut stream = h.start(lease.id).await.unwrap();

        // Nobody reads for several TTLs
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.store.renewal_count() >= 9);
        assert!(h.store.time_to_live(lease.id).await.unwrap().is_some());

        // Only the latest ack is buffered
        let ack = stream.next().await.unwrap();
        assert_eq!(ack.ttl, 3);
        let mut next = task::spawn(stream.next());
        assert_pending!(next.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_stream() {
        let h = Harness::new();
        let lease = h.store.grant(3).await.unwrap();
        let mut stream = h.start(lease.id).await.unwrap();
        assert!(stream.next().await.is_some());

        stream.cancel();
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.end_reason(), Some(EndReason::Cancelled));

        // Cancelling stops renewal, so the lease lapses
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.store.lease_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_renewal() {
        let h = Harness::new();
        let lease = h.store.grant(3).await.unwrap();
        let stream = h.start(lease.id).await.unwrap();
        drop(stream);

        h.tasks.close();
        h.tasks.wait().await;
        let renewals = h.store.renewal_count();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.store.renewal_count(), renewals);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_lease_ends_stream() {
        let h = Harness::new();
        let lease = h.store.grant(3).await.unwrap();
        let mut stream = h.start(lease.id).await.unwrap();
        assert!(stream.next().await.is_some());

        h.store.revoke(lease.id).await.unwrap();
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.end_reason(), Some(EndReason::LeaseExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_every_stream() {
        let h = Harness::new();
        let a = h.store.grant(3).await.unwrap();
        let b = h.store.grant(6).await.unwrap();
        let mut first = h.start(a.id).await.unwrap();
        let mut second = h.start(b.id).await.unwrap();

        h.shutdown.cancel();
        h.tasks.close();
        h.tasks.wait().await;

        assert!(first.is_finished() && second.is_finished());
        assert_eq!(first.end_reason(), Some(EndReason::HandleClosed));
        assert_eq!(second.end_reason(), Some(EndReason::HandleClosed));

        // Initial acks were never read; they are still delivered before the end
        assert!(first.next().await.is_some());
        assert_eq!(first.next().await, None);
        assert!(second.next().await.is_some());
        assert_eq!(second.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let h = Harness::new();
        let lease = h.store.grant(3).await.unwrap();
        let mut stream = h.start(lease.id).await.unwrap();
        assert!(stream.next().await.is_some());

        // Fail the next renewal, then come back before the retries run out
        h.store.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        h.store.set_unavailable(false);

        let ack = stream.next().await.unwrap();
        assert_eq!(ack.ttl, 3);
        assert!(!stream.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_ends_stream() {
        let h = Harness::new();
        let lease = h.store.grant(3).await.unwrap();
        let mut stream = h.start(lease.id).await.unwrap();
        assert!(stream.next().await.is_some());

        h.store.set_unavailable(true);
        assert_eq!(stream.next().await, None);
        assert!(matches!(stream.end_reason(), Some(EndReason::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_into_stream() {
        let h = Harness::new();
        let lease = h.store.grant(3).await.unwrap();
        let stream = h.start(lease.id).await.unwrap();

        let acks: Vec<KeepAliveAck> = stream.into_stream().take(3).collect().await;
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|ack| ack.id == lease.id && ack.ttl == 3));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(200);
        for _ in 0..100 {
            let delay = with_jitter(base);
            assert!(delay >= base && delay <= Duration::from_millis(250));
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }
}
