use fabload_codec::CodecError;
use fabload_crypto::IdentityError;
use thiserror::Error;

/// Errors surfaced by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Message could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The remote side rejected the call.
    #[error("remote error: {0}")]
    Rpc(String),
    /// The operation did not complete in time.
    #[error("{op} timed out")]
    Timeout { op: &'static str },
    /// A frame length prefix exceeded the maximum frame size.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    /// The peer sent a frame that is not valid at this point of the exchange.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
    /// The stream or connection is closed.
    #[error("stream closed")]
    Closed,
    /// Local identity material for a simulated endpoint could not be built.
    #[error(transparent)]
    Identity(#[from] IdentityError),
    /// Failure injected by the simulated ledger.
    #[error("injected failure: {0}")]
    Injected(&'static str),
}
