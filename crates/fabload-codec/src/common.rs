use std::time::{SystemTime, UNIX_EPOCH};

use fabload_core::hash::derive_tx_id;
use fabload_core::{Nonce, TxId, NONCE_LEN};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Encodes a message as CBOR.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|err| CodecError::Encode(err.to_string()))?;
    Ok(out)
}

/// Decodes a CBOR message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::de::from_reader(bytes).map_err(|err| CodecError::Decode(err.to_string()))
}

/// Status codes carried by ordering acknowledgements and delivery feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Success,
    BadRequest,
    Forbidden,
    NotFound,
    RequestEntityTooLarge,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::RequestEntityTooLarge => 413,
            Status::InternalServerError => 500,
            Status::NotImplemented => 501,
            Status::ServiceUnavailable => 503,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Success => "SUCCESS",
            Status::BadRequest => "BAD_REQUEST",
            Status::Forbidden => "FORBIDDEN",
            Status::NotFound => "NOT_FOUND",
            Status::RequestEntityTooLarge => "REQUEST_ENTITY_TOO_LARGE",
            Status::InternalServerError => "INTERNAL_SERVER_ERROR",
            Status::NotImplemented => "NOT_IMPLEMENTED",
            Status::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        };
        write!(f, "{name}({})", self.code())
    }
}

/// Per-envelope acknowledgement returned on the ordering stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub status: Status,
    #[serde(default)]
    pub info: String,
}

impl BroadcastResponse {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            info: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderType {
    EndorserTransaction,
    DeliverSeekInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHeader {
    pub header_type: HeaderType,
    pub channel_id: String,
    pub tx_id: TxId,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureHeader {
    #[serde(with = "fabload_core::bytes_serde")]
    pub creator: Vec<u8>,
    pub nonce: Nonce,
}

impl SignatureHeader {
    /// Fresh header for `creator` with a random nonce.
    pub fn new(creator: &[u8]) -> Self {
        let mut nonce = [0_u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            creator: creator.to_vec(),
            nonce,
        }
    }

    pub fn tx_id(&self) -> TxId {
        derive_tx_id(&self.nonce, &self.creator)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub channel_header: ChannelHeader,
    pub signature_header: SignatureHeader,
}

impl Header {
    /// Builds a header whose transaction id is derived from the fresh nonce.
    pub fn new(header_type: HeaderType, channel_id: &str, creator: &[u8]) -> Self {
        let signature_header = SignatureHeader::new(creator);
        Self {
            channel_header: ChannelHeader {
                header_type,
                channel_id: channel_id.to_string(),
                tx_id: signature_header.tx_id(),
                timestamp_ms: now_unix_ms(),
            },
            signature_header,
        }
    }
}

/// Signed payload body of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub header: Header,
    #[serde(with = "fabload_core::bytes_serde")]
    pub data: Vec<u8>,
}

/// Submittable, signed unit sent to the ordering endpoint or deliver feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "fabload_core::bytes_serde")]
    pub payload: Vec<u8>,
    #[serde(with = "fabload_core::bytes_serde")]
    pub signature: Vec<u8>,
}

impl Envelope {
    pub fn decode_payload(&self) -> Result<Payload, CodecError> {
        decode(&self.payload)
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
