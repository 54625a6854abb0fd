//! # Tether Common
//!
//! Shared types, errors, and utilities used across Tether components.
//!
//! ## Modules
//! - `types` - Core data structures (LeaseId, KeyValue, KeepAliveAck, etc.)
//! - `error` - Common error taxonomy
//! - `codec` - Transport-safe payload encoding
//! - `constants` - Shared configuration defaults

pub mod codec;
pub mod constants;
pub mod error;
pub mod types;

pub use error::{Result, TetherError};
pub use types::*;
