use fabload_core::hash::blake3_32;
use fabload_core::TxId;
use fabload_crypto::Signer;
use serde::{Deserialize, Serialize};

use crate::common::{decode, encode, Envelope, Header, HeaderType, Payload};
use crate::error::CodecError;

/// Contract invocation carried by a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeInvocation {
    pub chaincode: String,
    pub function: String,
    pub args: Vec<Vec<u8>>,
}

/// Unsigned transaction proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub header: Header,
    pub invocation: ChaincodeInvocation,
}

impl Proposal {
    pub fn tx_id(&self) -> TxId {
        self.header.channel_header.tx_id
    }
}

/// Proposal bytes plus the creator's signature over them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedProposal {
    #[serde(with = "fabload_core::bytes_serde")]
    pub proposal_bytes: Vec<u8>,
    #[serde(with = "fabload_core::bytes_serde")]
    pub signature: Vec<u8>,
}

impl SignedProposal {
    pub fn decode_proposal(&self) -> Result<Proposal, CodecError> {
        decode(&self.proposal_bytes)
    }
}

/// Endorser's verdict on a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, with = "fabload_core::bytes_serde")]
    pub payload: Vec<u8>,
}

impl Response {
    /// Endorsement statuses in `[200, 400)` count as success.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Simulation result the endorser signed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResponsePayload {
    pub proposal_hash: [u8; 32],
    #[serde(default, with = "fabload_core::bytes_serde")]
    pub extension: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorsement {
    #[serde(with = "fabload_core::bytes_serde")]
    pub endorser: Vec<u8>,
    #[serde(with = "fabload_core::bytes_serde")]
    pub signature: Vec<u8>,
}

/// Endorsing endpoint's reply to a signed proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResponse {
    pub response: Response,
    #[serde(default, with = "fabload_core::bytes_serde")]
    pub payload: Vec<u8>,
    pub endorsement: Option<Endorsement>,
}

/// Assembled transaction body wrapped into the submitted envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub invocation: ChaincodeInvocation,
    #[serde(with = "fabload_core::bytes_serde")]
    pub response_payload: Vec<u8>,
    pub endorsements: Vec<Endorsement>,
}

/// Builds an unsigned proposal invoking `function(args)` on `chaincode`.
pub fn create_proposal(
    creator: &[u8],
    channel_id: &str,
    chaincode: &str,
    function: &str,
    args: Vec<Vec<u8>>,
) -> Proposal {
    Proposal {
        header: Header::new(HeaderType::EndorserTransaction, channel_id, creator),
        invocation: ChaincodeInvocation {
            chaincode: chaincode.to_string(),
            function: function.to_string(),
            args,
        },
    }
}

/// Signs the encoded proposal with `signer`.
pub fn sign_proposal(proposal: &Proposal, signer: &dyn Signer) -> Result<SignedProposal, CodecError> {
    let proposal_bytes = encode(proposal)?;
    let signature = signer.sign(&proposal_bytes)?;
    Ok(SignedProposal {
        proposal_bytes,
        signature,
    })
}

/// Produces an endorsement for `signed` as a simulating endorser would.
///
/// Non-success statuses carry no endorsement, matching what a rejecting
/// endorser returns.
pub fn endorse_proposal(
    signed: &SignedProposal,
    endorser: &dyn Signer,
    status: i32,
    message: impl Into<String>,
) -> Result<ProposalResponse, CodecError> {
    let response = Response {
        status,
        message: message.into(),
        payload: Vec::new(),
    };
    if !response.is_success() {
        return Ok(ProposalResponse {
            response,
            payload: Vec::new(),
            endorsement: None,
        });
    }
    let payload = encode(&ProposalResponsePayload {
        proposal_hash: blake3_32(&signed.proposal_bytes),
        extension: Vec::new(),
    })?;
    let mut signed_bytes = payload.clone();
    signed_bytes.extend_from_slice(endorser.identity());
    let signature = endorser.sign(&signed_bytes)?;
    Ok(ProposalResponse {
        response,
        payload,
        endorsement: Some(Endorsement {
            endorser: endorser.identity().to_vec(),
            signature,
        }),
    })
}

/// Assembles endorsed responses and the original proposal into a signed
/// envelope ready for ordering.
pub fn create_signed_tx(
    proposal: &Proposal,
    signer: &dyn Signer,
    responses: &[ProposalResponse],
) -> Result<Envelope, CodecError> {
    if responses.is_empty() {
        return Err(CodecError::Invalid("at least one proposal response is required"));
    }
    if proposal.header.signature_header.creator != signer.identity() {
        return Err(CodecError::Invalid("signer must be the proposal creator"));
    }

    let mut endorsements = Vec::with_capacity(responses.len());
    let response_payload = responses[0].payload.clone();
    for response in responses {
        if !response.response.is_success() {
            return Err(CodecError::Invalid("proposal response was not successful"));
        }
        if response.payload != response_payload {
            return Err(CodecError::Invalid("proposal response payloads do not match"));
        }
        if let Some(endorsement) = &response.endorsement {
            endorsements.push(endorsement.clone());
        }
    }

    let data = encode(&Transaction {
        invocation: proposal.invocation.clone(),
        response_payload,
        endorsements,
    })?;
    let payload = encode(&Payload {
        header: proposal.header.clone(),
        data,
    })?;
    let signature = signer.sign(&payload)?;
    Ok(Envelope { payload, signature })
}
