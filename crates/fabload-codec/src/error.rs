use fabload_crypto::SigningError;
use thiserror::Error;

/// Errors returned by message encoding and builder operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// The signer could not produce a signature.
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
    /// Message-level validation failure.
    #[error("invalid message: {0}")]
    Invalid(&'static str),
}
