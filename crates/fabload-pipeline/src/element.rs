use fabload_codec::{Envelope, Proposal, ProposalResponse, SignedProposal};
use thiserror::Error;

/// How far a unit has progressed. Fields are filled strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnitStage {
    Requested,
    Signed,
    Endorsed,
    Submittable,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("unit {seq}: cannot attach {field} at stage {stage:?}")]
    OutOfOrder {
        seq: u64,
        field: &'static str,
        stage: UnitStage,
    },
}

/// One transaction travelling through the pipeline.
///
/// Exactly one stage owns a unit at a time; ownership moves through the
/// bounded queues between stages.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    seq: u64,
    request: Proposal,
    signed_request: Option<SignedProposal>,
    endorsement: Option<ProposalResponse>,
    submittable: Option<Envelope>,
}

impl WorkUnit {
    pub fn new(seq: u64, request: Proposal) -> Self {
        Self {
            seq,
            request,
            signed_request: None,
            endorsement: None,
            submittable: None,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn request(&self) -> &Proposal {
        &self.request
    }

    pub fn signed_request(&self) -> Option<&SignedProposal> {
        self.signed_request.as_ref()
    }

    pub fn endorsement(&self) -> Option<&ProposalResponse> {
        self.endorsement.as_ref()
    }

    pub fn submittable(&self) -> Option<&Envelope> {
        self.submittable.as_ref()
    }

    pub fn stage(&self) -> UnitStage {
        if self.submittable.is_some() {
            UnitStage::Submittable
        } else if self.endorsement.is_some() {
            UnitStage::Endorsed
        } else if self.signed_request.is_some() {
            UnitStage::Signed
        } else {
            UnitStage::Requested
        }
    }

    fn expect_stage(&self, expected: UnitStage, field: &'static str) -> Result<(), UnitError> {
        let stage = self.stage();
        if stage != expected {
            return Err(UnitError::OutOfOrder {
                seq: self.seq,
                field,
                stage,
            });
        }
        Ok(())
    }

    pub fn attach_signed_request(&mut self, signed: SignedProposal) -> Result<(), UnitError> {
        self.expect_stage(UnitStage::Requested, "signed request")?;
        self.signed_request = Some(signed);
        Ok(())
    }

    pub fn attach_endorsement(&mut self, response: ProposalResponse) -> Result<(), UnitError> {
        self.expect_stage(UnitStage::Signed, "endorsement")?;
        self.endorsement = Some(response);
        Ok(())
    }

    pub fn attach_submittable(&mut self, envelope: Envelope) -> Result<(), UnitError> {
        self.expect_stage(UnitStage::Endorsed, "submittable")?;
        self.submittable = Some(envelope);
        Ok(())
    }

    /// Consumes a fully assembled unit, yielding the envelope to submit.
    pub fn into_envelope(self) -> Result<Envelope, UnitError> {
        let stage = self.stage();
        match self.submittable {
            Some(envelope) => Ok(envelope),
            None => Err(UnitError::OutOfOrder {
                seq: self.seq,
                field: "envelope",
                stage,
            }),
        }
    }
}
