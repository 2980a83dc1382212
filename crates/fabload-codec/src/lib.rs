//! Ledger message model and CBOR encoding for fabload.
//!
//! Covers the proposal/endorsement/envelope flow, ordering acknowledgements,
//! and the filtered-block delivery feed, plus the builders that turn a
//! request into signed wire messages.

pub mod common;
pub mod deliver;
pub mod error;
pub mod proposal;

pub use common::{
    decode, encode, BroadcastResponse, ChannelHeader, Envelope, Header, HeaderType, Payload,
    SignatureHeader, Status,
};
pub use deliver::{
    create_signed_deliver_newest_env, DeliverResponse, FilteredBlock, FilteredTransaction,
    SeekBehavior, SeekInfo, SeekPosition, TxValidationCode,
};
pub use error::CodecError;
pub use proposal::{
    create_proposal, create_signed_tx, endorse_proposal, sign_proposal, ChaincodeInvocation,
    Endorsement, Proposal, ProposalResponse, ProposalResponsePayload, Response, SignedProposal,
    Transaction,
};
