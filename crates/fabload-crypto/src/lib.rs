//! Cryptographic helpers used by fabload.
//!
//! Includes the `Signer` capability consumed by the benchmark pipeline,
//! ECDSA/Ed25519 signing keys, and loading of identity material.

pub mod identity;
pub mod signing;

pub use identity::{Identity, IdentityConfig, IdentityError, SerializedIdentity};
pub use signing::{Signer, SigningAlgorithm, SigningError, SigningKey};
