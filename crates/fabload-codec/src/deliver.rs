use fabload_core::TxId;
use fabload_crypto::Signer;
use serde::{Deserialize, Serialize};

use crate::common::{encode, Envelope, Header, HeaderType, Payload, Status};
use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekPosition {
    Newest,
    Oldest,
    Specified(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekBehavior {
    BlockUntilReady,
    FailIfNotReady,
}

/// Range of blocks requested from the delivery feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekInfo {
    pub start: SeekPosition,
    pub stop: SeekPosition,
    pub behavior: SeekBehavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxValidationCode {
    Valid,
    MvccReadConflict,
    EndorsementPolicyFailure,
    BadPayload,
    DuplicateTxId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredTransaction {
    pub tx_id: TxId,
    pub validation_code: TxValidationCode,
}

/// Committed block reduced to its transaction ids and validation codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredBlock {
    pub channel_id: String,
    pub number: u64,
    pub filtered_transactions: Vec<FilteredTransaction>,
}

impl FilteredBlock {
    pub fn tx_count(&self) -> usize {
        self.filtered_transactions.len()
    }
}

/// One message on the delivery feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliverResponse {
    Status(Status),
    Block(FilteredBlock),
}

/// Builds a signed request to stream every block from the current tip on.
pub fn create_signed_deliver_newest_env(
    channel_id: &str,
    signer: &dyn Signer,
) -> Result<Envelope, CodecError> {
    let seek = SeekInfo {
        start: SeekPosition::Newest,
        stop: SeekPosition::Specified(u64::MAX),
        behavior: SeekBehavior::BlockUntilReady,
    };
    let payload = encode(&Payload {
        header: Header::new(HeaderType::DeliverSeekInfo, channel_id, signer.identity()),
        data: encode(&seek)?,
    })?;
    let signature = signer.sign(&payload)?;
    Ok(Envelope { payload, signature })
}
