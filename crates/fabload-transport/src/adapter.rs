use std::sync::Arc;

use async_trait::async_trait;
use fabload_codec::{BroadcastResponse, DeliverResponse, Envelope, ProposalResponse, SignedProposal};
use fabload_core::Endpoint;

use crate::TransportError;

/// Unary endorsement call against one endorsing endpoint.
///
/// A client is shared by every concurrency task of one proposer worker, so
/// implementations must allow overlapping in-flight calls.
#[async_trait]
pub trait EndorserClient: Send + Sync {
    /// Sends a signed proposal. `Ok(None)` is an empty response.
    async fn process_proposal(
        &self,
        signed: &SignedProposal,
    ) -> Result<Option<ProposalResponse>, TransportError>;

    /// Endpoint this client is connected to.
    fn endpoint(&self) -> &Endpoint;
}

/// Send half of an ordering stream.
#[async_trait]
pub trait EnvelopeSink: Send {
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Receive half of an ordering stream. `Ok(None)` is a clean end-of-stream.
#[async_trait]
pub trait AckSource: Send {
    async fn recv(&mut self) -> Result<Option<BroadcastResponse>, TransportError>;
}

/// Bidirectional ordering stream split so sending and draining acks never
/// block one another.
pub struct BroadcastStream {
    pub sink: Box<dyn EnvelopeSink>,
    pub acks: Box<dyn AckSource>,
}

impl std::fmt::Debug for BroadcastStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastStream").finish_non_exhaustive()
    }
}

/// Committed-block feed. The client sends one seek envelope, then receives.
#[async_trait]
pub trait DeliverStream: Send {
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError>;
    /// Next feed message. `Ok(None)` means the feed ended.
    async fn recv(&mut self) -> Result<Option<DeliverResponse>, TransportError>;
}

/// Opens connections of each contract kind to a given endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn endorser(&self, endpoint: &Endpoint) -> Result<Arc<dyn EndorserClient>, TransportError>;
    async fn broadcast(&self, endpoint: &Endpoint) -> Result<BroadcastStream, TransportError>;
    async fn deliver(&self, endpoint: &Endpoint) -> Result<Box<dyn DeliverStream>, TransportError>;
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    async fn endorser(&self, endpoint: &Endpoint) -> Result<Arc<dyn EndorserClient>, TransportError> {
        (**self).endorser(endpoint).await
    }

    async fn broadcast(&self, endpoint: &Endpoint) -> Result<BroadcastStream, TransportError> {
        (**self).broadcast(endpoint).await
    }

    async fn deliver(&self, endpoint: &Endpoint) -> Result<Box<dyn DeliverStream>, TransportError> {
        (**self).deliver(endpoint).await
    }
}
