//! Core types shared across Tether components.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TetherError};

/// Store-assigned lease identifier.
///
/// Opaque to callers. `LeaseId::NONE` (0) means "no lease": a write bound to
/// it is an ordinary durable write.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LeaseId(i64);

impl LeaseId {
    pub const NONE: LeaseId = LeaseId(0);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Returns true for the "no lease" sentinel
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl From<i64> for LeaseId {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A time-bounded grant issued by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Store-assigned identifier
    pub id: LeaseId,
    /// Granted time-to-live in seconds
    pub ttl: i64,
}

/// One renewal round's acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveAck {
    /// Renewed lease
    pub id: LeaseId,
    /// Remaining TTL after renewal (seconds). Zero or less means the lease is gone.
    pub ttl: i64,
}

/// How the read key is matched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Only the exact key
    #[default]
    Exact,
    /// Every key sharing the given prefix
    Prefix,
}

/// Which fields a read returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldsMode {
    /// Keys, values, and metadata
    #[default]
    Full,
    /// Keys and metadata only; values are left empty
    KeysOnly,
}

/// A key/value pair as returned by the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,

    /// Empty when read with `FieldsMode::KeysOnly`
    pub value: Vec<u8>,

    /// Per-key write counter, starting at 1
    pub version: i64,

    /// Store revision of the key's creation
    pub create_revision: i64,

    /// Store revision of the key's last modification
    pub mod_revision: i64,

    /// Lease the key is bound to (`LeaseId::NONE` if durable)
    pub lease: LeaseId,
}

impl KeyValue {
    /// Key as UTF-8, if it is valid UTF-8
    pub fn key_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.key).ok()
    }

    /// Value as UTF-8, if it is valid UTF-8
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Decode a value written with [`crate::codec::encode`]
    pub fn decode_value<T: DeserializeOwned>(&self) -> Result<T> {
        let text = self
            .value_str()
            .ok_or_else(|| TetherError::Decoding("value is not valid UTF-8".to_string()))?;
        crate::codec::decode(text)
    }
}
