//! Shared constants for Tether components.

/// Default store endpoint
pub const DEFAULT_ENDPOINT: &str = "localhost:2379";

/// Default dial timeout when establishing a session (seconds)
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;

/// Default deadline for bounded operations (seconds)
pub const DEFAULT_OP_TIMEOUT_SECS: u64 = 5;

/// Largest lease TTL a store grants (seconds), matching etcd's MaxLeaseTTL
pub const MAX_LEASE_TTL_SECS: i64 = 9_000_000_000;

/// Lower bound on the keep-alive renewal interval (milliseconds)
pub const MIN_RENEW_INTERVAL_MILLIS: u64 = 500;

/// Transient renewal failures tolerated before a keep-alive stream ends
pub const KEEP_ALIVE_MAX_RETRIES: u32 = 3;

/// First backoff step after a failed renewal (milliseconds)
pub const KEEP_ALIVE_INITIAL_BACKOFF_MILLIS: u64 = 200;

/// Backoff ceiling for renewal retries (milliseconds)
pub const KEEP_ALIVE_MAX_BACKOFF_MILLIS: u64 = 2_000;

/// Prefix for environment variable overrides (TETHER_ENDPOINTS, ...)
pub const ENV_PREFIX: &str = "TETHER";

/// Default TTL for node registrations (seconds)
pub const DEFAULT_REGISTRATION_TTL_SECS: i64 = 10;

/// Store key prefixes
pub mod keys {
    /// Node registrations: /tether/nodes/{node_id}
    pub const NODE_PREFIX: &str = "/tether/nodes/";
}
