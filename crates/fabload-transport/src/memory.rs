use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fabload_codec::{
    decode, endorse_proposal, BroadcastResponse, DeliverResponse, Envelope, FilteredBlock,
    FilteredTransaction, HeaderType, ProposalResponse, SeekInfo, SeekPosition, SignedProposal,
    Status, TxValidationCode,
};
use fabload_core::{Endpoint, TxId};
use fabload_crypto::{Identity, SigningAlgorithm};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapter::{AckSource, BroadcastStream, Connector, DeliverStream, EndorserClient, EnvelopeSink};
use crate::TransportError;

const ORDER_QUEUE_CAPACITY: usize = 4096;
const ACK_QUEUE_CAPACITY: usize = 1024;
const BLOCK_FEED_CAPACITY: usize = 1024;

/// How simulated endorsers answer proposals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndorsePolicy {
    /// Response status returned for every answered proposal.
    pub status: i32,
    pub message: String,
    /// Every n-th call (ledger-wide, 1-based) fails at the transport level.
    pub transport_error_every: Option<u64>,
    /// Every n-th call returns an empty response.
    pub nil_response_every: Option<u64>,
    /// Simulated processing time per call.
    pub latency: Duration,
}

impl Default for EndorsePolicy {
    fn default() -> Self {
        Self {
            status: 200,
            message: String::new(),
            transport_error_every: None,
            nil_response_every: None,
            latency: Duration::ZERO,
        }
    }
}

/// Behaviour of an [`InMemoryLedger`].
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    pub channel_id: String,
    pub endorse: EndorsePolicy,
    /// Status acknowledged for each well-formed envelope. Only successfully
    /// acknowledged envelopes are ordered into blocks.
    pub ack_status: Status,
    pub max_block_txs: usize,
    /// A partially filled block is cut once its first transaction has
    /// waited this long.
    pub block_timeout: Duration,
    /// Ack streams fail after delivering this many acks.
    pub fail_ack_stream_after: Option<u64>,
    /// Deliver streams fail after delivering this many blocks.
    pub fail_deliver_after: Option<u64>,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            channel_id: "mychannel".to_string(),
            endorse: EndorsePolicy::default(),
            ack_status: Status::Success,
            max_block_txs: 100,
            block_timeout: Duration::from_millis(200),
            fail_ack_stream_after: None,
            fail_deliver_after: None,
        }
    }
}

impl LedgerOptions {
    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    pub fn with_endorse_status(mut self, status: i32) -> Self {
        self.endorse.status = status;
        self
    }

    pub fn with_block_size(mut self, max_block_txs: usize, block_timeout: Duration) -> Self {
        self.max_block_txs = max_block_txs;
        self.block_timeout = block_timeout;
        self
    }

    pub fn fail_ack_stream_after(mut self, acks: u64) -> Self {
        self.fail_ack_stream_after = Some(acks);
        self
    }

    pub fn fail_deliver_after(mut self, blocks: u64) -> Self {
        self.fail_deliver_after = Some(blocks);
        self
    }
}

struct Chain {
    tip: FilteredBlock,
    blocks: broadcast::Sender<FilteredBlock>,
}

struct Shared {
    options: LedgerOptions,
    peer: Identity,
    endorse_calls: AtomicU64,
    committed: Arc<AtomicU64>,
    chain: Arc<Mutex<Chain>>,
    order_tx: mpsc::Sender<TxId>,
}

/// Simulated ledger network serving endorsement, ordering and delivery.
///
/// Every endpoint handed to the [`Connector`] methods is served by the same
/// ledger. A single ordering task sequences envelopes from all broadcast
/// streams and cuts numbered blocks, starting at 1 above an empty genesis
/// block. Must be created inside a tokio runtime.
pub struct InMemoryLedger {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLedger")
            .field("options", &self.shared.options)
            .field("height", &self.height())
            .finish()
    }
}

impl InMemoryLedger {
    pub fn new(options: LedgerOptions) -> Result<Self, TransportError> {
        let peer = Identity::ephemeral("SimPeerMSP", SigningAlgorithm::Ed25519)?;
        let (blocks, _) = broadcast::channel(BLOCK_FEED_CAPACITY);
        let chain = Arc::new(Mutex::new(Chain {
            tip: FilteredBlock {
                channel_id: options.channel_id.clone(),
                number: 0,
                filtered_transactions: Vec::new(),
            },
            blocks,
        }));
        let committed = Arc::new(AtomicU64::new(0));
        let (order_tx, order_rx) = mpsc::channel(ORDER_QUEUE_CAPACITY);

        tokio::spawn(run_orderer(
            order_rx,
            chain.clone(),
            committed.clone(),
            options.channel_id.clone(),
            options.max_block_txs.max(1),
            options.block_timeout,
        ));

        Ok(Self {
            shared: Arc::new(Shared {
                options,
                peer,
                endorse_calls: AtomicU64::new(0),
                committed,
                chain,
                order_tx,
            }),
        })
    }

    pub fn options(&self) -> &LedgerOptions {
        &self.shared.options
    }

    /// Number of blocks including genesis.
    pub fn height(&self) -> u64 {
        lock(&self.shared.chain).tip.number + 1
    }

    /// Transactions committed into blocks so far.
    pub fn committed_txs(&self) -> u64 {
        self.shared.committed.load(Ordering::SeqCst)
    }

    /// Endorsement calls received so far, including failed ones.
    pub fn endorse_calls(&self) -> u64 {
        self.shared.endorse_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for InMemoryLedger {
    async fn endorser(&self, endpoint: &Endpoint) -> Result<Arc<dyn EndorserClient>, TransportError> {
        Ok(Arc::new(MemoryEndorser {
            endpoint: endpoint.clone(),
            shared: self.shared.clone(),
        }))
    }

    async fn broadcast(&self, _endpoint: &Endpoint) -> Result<BroadcastStream, TransportError> {
        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_CAPACITY);
        Ok(BroadcastStream {
            sink: Box::new(MemorySink {
                shared: self.shared.clone(),
                acks: ack_tx,
            }),
            acks: Box::new(MemoryAcks {
                rx: ack_rx,
                delivered: 0,
                fail_after: self.shared.options.fail_ack_stream_after,
            }),
        })
    }

    async fn deliver(&self, _endpoint: &Endpoint) -> Result<Box<dyn DeliverStream>, TransportError> {
        Ok(Box::new(MemoryDeliver {
            shared: self.shared.clone(),
            state: DeliverState::Unpositioned,
            delivered: 0,
        }))
    }
}

fn lock(chain: &Mutex<Chain>) -> MutexGuard<'_, Chain> {
    chain.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_nth(every: Option<u64>, call: u64) -> bool {
    matches!(every, Some(n) if n > 0 && call % n == 0)
}

struct MemoryEndorser {
    endpoint: Endpoint,
    shared: Arc<Shared>,
}

#[async_trait]
impl EndorserClient for MemoryEndorser {
    async fn process_proposal(
        &self,
        signed: &SignedProposal,
    ) -> Result<Option<ProposalResponse>, TransportError> {
        let policy = &self.shared.options.endorse;
        let call = self.shared.endorse_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !policy.latency.is_zero() {
            tokio::time::sleep(policy.latency).await;
        }
        if is_nth(policy.transport_error_every, call) {
            return Err(TransportError::Injected("endorser unavailable"));
        }
        if is_nth(policy.nil_response_every, call) {
            return Ok(None);
        }

        let proposal = signed.decode_proposal()?;
        if proposal.header.channel_header.channel_id != self.shared.options.channel_id {
            let response = endorse_proposal(signed, &self.shared.peer, 404, "channel not found")?;
            return Ok(Some(response));
        }
        let response = endorse_proposal(signed, &self.shared.peer, policy.status, policy.message.clone())?;
        Ok(Some(response))
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

struct MemorySink {
    shared: Arc<Shared>,
    acks: mpsc::Sender<BroadcastResponse>,
}

#[async_trait]
impl EnvelopeSink for MemorySink {
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        // A tx is only ordered once its ack has a slot to land in.
        let permit = self.acks.reserve().await.map_err(|_| TransportError::Closed)?;
        let status = match envelope.decode_payload() {
            Ok(payload)
                if payload.header.channel_header.header_type == HeaderType::EndorserTransaction
                    && payload.header.channel_header.channel_id == self.shared.options.channel_id =>
            {
                let status = self.shared.options.ack_status;
                if status.is_success() {
                    self.shared
                        .order_tx
                        .send(payload.header.channel_header.tx_id)
                        .await
                        .map_err(|_| TransportError::Closed)?;
                }
                status
            }
            Ok(_) => Status::BadRequest,
            Err(err) => {
                warn!(error = %err, "rejecting malformed envelope");
                Status::BadRequest
            }
        };
        permit.send(BroadcastResponse {
            status,
            info: String::new(),
        });
        Ok(())
    }
}

struct MemoryAcks {
    rx: mpsc::Receiver<BroadcastResponse>,
    delivered: u64,
    fail_after: Option<u64>,
}

#[async_trait]
impl AckSource for MemoryAcks {
    async fn recv(&mut self) -> Result<Option<BroadcastResponse>, TransportError> {
        if matches!(self.fail_after, Some(limit) if self.delivered >= limit) {
            return Err(TransportError::Injected("ack stream reset"));
        }
        match self.rx.recv().await {
            Some(ack) => {
                self.delivered += 1;
                Ok(Some(ack))
            }
            None => Ok(None),
        }
    }
}

enum DeliverState {
    Unpositioned,
    Positioned {
        first: Option<FilteredBlock>,
        after: u64,
        feed: broadcast::Receiver<FilteredBlock>,
    },
    Rejected(Option<Status>),
}

struct MemoryDeliver {
    shared: Arc<Shared>,
    state: DeliverState,
    delivered: u64,
}

#[async_trait]
impl DeliverStream for MemoryDeliver {
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        let payload = envelope.decode_payload()?;
        if payload.header.channel_header.header_type != HeaderType::DeliverSeekInfo
            || payload.header.channel_header.channel_id != self.shared.options.channel_id
        {
            self.state = DeliverState::Rejected(Some(Status::BadRequest));
            return Ok(());
        }
        let seek: SeekInfo = decode(&payload.data)?;
        self.state = match seek.start {
            SeekPosition::Newest => {
                let chain = lock(&self.shared.chain);
                DeliverState::Positioned {
                    after: chain.tip.number,
                    first: Some(chain.tip.clone()),
                    feed: chain.blocks.subscribe(),
                }
            }
            SeekPosition::Oldest | SeekPosition::Specified(_) => {
                DeliverState::Rejected(Some(Status::NotImplemented))
            }
        };
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<DeliverResponse>, TransportError> {
        if matches!(self.shared.options.fail_deliver_after, Some(limit) if self.delivered >= limit) {
            return Err(TransportError::Injected("deliver stream reset"));
        }
        match &mut self.state {
            DeliverState::Unpositioned => {
                Err(TransportError::Rpc("deliver stream has not been positioned".to_string()))
            }
            DeliverState::Rejected(status) => Ok(status.take().map(DeliverResponse::Status)),
            DeliverState::Positioned { first, after, feed } => {
                if let Some(tip) = first.take() {
                    self.delivered += 1;
                    return Ok(Some(DeliverResponse::Block(tip)));
                }
                loop {
                    match feed.recv().await {
                        Ok(block) if block.number <= *after => continue,
                        Ok(block) => {
                            *after = block.number;
                            self.delivered += 1;
                            return Ok(Some(DeliverResponse::Block(block)));
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            return Err(TransportError::Rpc(format!(
                                "deliver feed lagged by {missed} blocks"
                            )));
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(None),
                    }
                }
            }
        }
    }
}

async fn run_orderer(
    mut rx: mpsc::Receiver<TxId>,
    chain: Arc<Mutex<Chain>>,
    committed: Arc<AtomicU64>,
    channel_id: String,
    max_block_txs: usize,
    block_timeout: Duration,
) {
    let mut pending: Vec<TxId> = Vec::new();
    let mut deadline: Option<Instant> = None;
    loop {
        let batch_timer = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
        tokio::select! {
            next = rx.recv() => match next {
                Some(tx_id) => {
                    if pending.is_empty() {
                        deadline = Some(Instant::now() + block_timeout);
                    }
                    pending.push(tx_id);
                    if pending.len() >= max_block_txs {
                        cut_block(&chain, &committed, &channel_id, &mut pending);
                        deadline = None;
                    }
                }
                None => {
                    if !pending.is_empty() {
                        cut_block(&chain, &committed, &channel_id, &mut pending);
                    }
                    break;
                }
            },
            _ = batch_timer, if deadline.is_some() => {
                cut_block(&chain, &committed, &channel_id, &mut pending);
                deadline = None;
            }
        }
    }
    debug!("orderer stopped");
}

fn cut_block(chain: &Mutex<Chain>, committed: &AtomicU64, channel_id: &str, pending: &mut Vec<TxId>) {
    let filtered_transactions: Vec<FilteredTransaction> = pending
        .drain(..)
        .map(|tx_id| FilteredTransaction {
            tx_id,
            validation_code: TxValidationCode::Valid,
        })
        .collect();
    let tx_count = filtered_transactions.len() as u64;

    let mut chain = lock(chain);
    let block = FilteredBlock {
        channel_id: channel_id.to_string(),
        number: chain.tip.number + 1,
        filtered_transactions,
    };
    committed.fetch_add(tx_count, Ordering::SeqCst);
    debug!(block = block.number, txs = tx_count, "cut block");
    chain.tip = block.clone();
    // No subscribers is not an error: blocks are still committed.
    let _ = chain.blocks.send(block);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fabload_codec::{
        create_proposal, create_signed_deliver_newest_env, create_signed_tx, sign_proposal,
        DeliverResponse, Envelope, Status,
    };
    use fabload_core::Endpoint;
    use fabload_crypto::{Identity, Signer, SigningAlgorithm};

    use super::{EndorsePolicy, InMemoryLedger, LedgerOptions};
    use crate::adapter::Connector;
    use crate::TransportError;

    fn client() -> Identity {
        Identity::ephemeral("Org1MSP", SigningAlgorithm::Ecdsa).expect("client identity")
    }

    fn peer() -> Endpoint {
        Endpoint::new("peer0:7051", "peer0.org1")
    }

    async fn endorsed_envelope(ledger: &InMemoryLedger, client: &Identity, seq: u64) -> Envelope {
        let proposal = create_proposal(
            client.identity(),
            &ledger.options().channel_id,
            "fileasset",
            "addFile",
            vec![seq.to_string().into_bytes()],
        );
        let signed = sign_proposal(&proposal, client).expect("sign should succeed");
        let endorser = ledger.endorser(&peer()).await.expect("endorser should connect");
        let response = endorser
            .process_proposal(&signed)
            .await
            .expect("endorse call should succeed")
            .expect("response should be present");
        create_signed_tx(&proposal, client, &[response]).expect("assemble should succeed")
    }

    #[tokio::test]
    async fn endorser_applies_configured_status() {
        let ledger = InMemoryLedger::new(LedgerOptions::default().with_endorse_status(500))
            .expect("ledger should start");
        let client = client();
        let proposal = create_proposal(client.identity(), "mychannel", "cc", "fn", Vec::new());
        let signed = sign_proposal(&proposal, &client).expect("sign");
        let endorser = ledger.endorser(&peer()).await.expect("endorser");

        let response = endorser
            .process_proposal(&signed)
            .await
            .expect("call should succeed")
            .expect("response should be present");
        assert_eq!(response.response.status, 500);
        assert!(response.endorsement.is_none());
        assert_eq!(endorser.endpoint(), &peer());
    }

    #[tokio::test]
    async fn endorser_injects_transport_errors_and_nil_responses() {
        let options = LedgerOptions {
            endorse: EndorsePolicy {
                transport_error_every: Some(3),
                nil_response_every: Some(2),
                ..EndorsePolicy::default()
            },
            ..LedgerOptions::default()
        };
        let ledger = InMemoryLedger::new(options).expect("ledger");
        let client = client();
        let proposal = create_proposal(client.identity(), "mychannel", "cc", "fn", Vec::new());
        let signed = sign_proposal(&proposal, &client).expect("sign");
        let endorser = ledger.endorser(&peer()).await.expect("endorser");

        let first = endorser.process_proposal(&signed).await.expect("call 1 ok");
        assert!(first.is_some());
        let second = endorser.process_proposal(&signed).await.expect("call 2 ok");
        assert!(second.is_none());
        let third = endorser.process_proposal(&signed).await;
        assert!(matches!(third, Err(TransportError::Injected(_))));
        assert_eq!(ledger.endorse_calls(), 3);
    }

    #[tokio::test]
    async fn proposals_for_other_channels_are_not_endorsed() {
        let ledger = InMemoryLedger::new(LedgerOptions::default()).expect("ledger");
        let client = client();
        let proposal = create_proposal(client.identity(), "otherchannel", "cc", "fn", Vec::new());
        let signed = sign_proposal(&proposal, &client).expect("sign");
        let endorser = ledger.endorser(&peer()).await.expect("endorser");

        let response = endorser
            .process_proposal(&signed)
            .await
            .expect("call ok")
            .expect("response");
        assert_eq!(response.response.status, 404);
    }

    #[tokio::test]
    async fn broadcast_orders_blocks_and_deliver_streams_from_tip() {
        let ledger = InMemoryLedger::new(
            LedgerOptions::default().with_block_size(2, Duration::from_secs(60)),
        )
        .expect("ledger");
        let client = client();

        let mut deliver = ledger.deliver(&peer()).await.expect("deliver connects");
        let seek = create_signed_deliver_newest_env("mychannel", &client).expect("seek env");
        deliver.send(seek).await.expect("seek should be accepted");
        match deliver.recv().await.expect("tip should arrive") {
            Some(DeliverResponse::Block(block)) => {
                assert_eq!(block.number, 0);
                assert_eq!(block.tx_count(), 0);
            }
            other => panic!("unexpected first response: {other:?}"),
        }

        let mut stream = ledger.broadcast(&peer()).await.expect("broadcast connects");
        for seq in 0..2 {
            let env = endorsed_envelope(&ledger, &client, seq).await;
            stream.sink.send(env).await.expect("send should succeed");
        }
        for _ in 0..2 {
            let ack = stream
                .acks
                .recv()
                .await
                .expect("ack should be readable")
                .expect("ack should be present");
            assert_eq!(ack.status, Status::Success);
        }

        match deliver.recv().await.expect("block should arrive") {
            Some(DeliverResponse::Block(block)) => {
                assert_eq!(block.number, 1);
                assert_eq!(block.tx_count(), 2);
            }
            other => panic!("unexpected block response: {other:?}"),
        }
        assert_eq!(ledger.committed_txs(), 2);
        assert_eq!(ledger.height(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn block_timeout_cuts_partial_blocks() {
        let ledger = InMemoryLedger::new(
            LedgerOptions::default().with_block_size(100, Duration::from_millis(500)),
        )
        .expect("ledger");
        let client = client();
        let mut stream = ledger.broadcast(&peer()).await.expect("broadcast");
        let env = endorsed_envelope(&ledger, &client, 0).await;
        stream.sink.send(env).await.expect("send");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ledger.committed_txs(), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(ledger.committed_txs(), 1);
    }

    #[tokio::test]
    async fn ack_stream_fails_after_configured_acks() {
        let ledger = InMemoryLedger::new(LedgerOptions::default().fail_ack_stream_after(1))
            .expect("ledger");
        let client = client();
        let mut stream = ledger.broadcast(&peer()).await.expect("broadcast");
        for seq in 0..2 {
            let env = endorsed_envelope(&ledger, &client, seq).await;
            stream.sink.send(env).await.expect("send");
        }

        assert!(stream.acks.recv().await.expect("first ack").is_some());
        let err = stream.acks.recv().await.expect_err("second read should fail");
        assert!(matches!(err, TransportError::Injected("ack stream reset")));
    }

    #[tokio::test]
    async fn dropping_sink_ends_ack_stream_cleanly() {
        let ledger = InMemoryLedger::new(LedgerOptions::default()).expect("ledger");
        let client = client();
        let mut stream = ledger.broadcast(&peer()).await.expect("broadcast");
        let env = endorsed_envelope(&ledger, &client, 0).await;
        stream.sink.send(env).await.expect("send");
        drop(stream.sink);

        assert!(stream.acks.recv().await.expect("ack").is_some());
        assert!(stream.acks.recv().await.expect("eof is not an error").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn envelopes_are_not_ordered_once_the_ack_reader_is_gone() {
        let ledger = InMemoryLedger::new(
            LedgerOptions::default().with_block_size(1, Duration::from_millis(100)),
        )
        .expect("ledger");
        let client = client();
        let stream = ledger.broadcast(&peer()).await.expect("broadcast");
        let mut sink = stream.sink;
        drop(stream.acks);
        let env = endorsed_envelope(&ledger, &client, 0).await;

        let err = sink.send(env).await.expect_err("send without an ack reader should fail");
        assert!(matches!(err, TransportError::Closed));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ledger.committed_txs(), 0);
    }

    #[tokio::test]
    async fn malformed_envelopes_are_rejected_with_bad_request() {
        let ledger = InMemoryLedger::new(LedgerOptions::default()).expect("ledger");
        let mut stream = ledger.broadcast(&peer()).await.expect("broadcast");
        stream
            .sink
            .send(Envelope {
                payload: vec![0xff, 0x00],
                signature: Vec::new(),
            })
            .await
            .expect("send");
        let ack = stream.acks.recv().await.expect("ack").expect("present");
        assert_eq!(ack.status, Status::BadRequest);
    }

    #[tokio::test]
    async fn recv_before_seek_is_an_error() {
        let ledger = InMemoryLedger::new(LedgerOptions::default()).expect("ledger");
        let mut deliver = ledger.deliver(&peer()).await.expect("deliver");
        assert!(deliver.recv().await.is_err());
    }
}
