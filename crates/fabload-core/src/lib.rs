//! Core fabload primitives shared across crates.
//!
//! Includes endpoint descriptors, transaction identifiers, hash helpers, and
//! base errors.

pub mod bytes_serde;
pub mod hash;
pub mod types;

pub use types::{Endpoint, Nonce, TxId, NONCE_LEN};
use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid caller input or malformed primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Endpoint descriptor is unusable.
    #[error("invalid endpoint `{addr}`: {reason}")]
    InvalidEndpoint { addr: String, reason: &'static str },
}
