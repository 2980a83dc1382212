use std::sync::Arc;

use async_trait::async_trait;
use fabload_codec::ProposalResponse;
use fabload_core::Endpoint;
use fabload_transport::{EndorserClient, TransportError};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatcher::{Handler, QueueGauge};
use crate::element::WorkUnit;
use crate::error::{PipelineError, Stage};
use crate::stats::{Outcome, StatItem, StatsHandle, WorkerId};

/// Why an endorsement call did not produce a usable response.
#[derive(Debug, Error)]
pub enum EndorseFailure {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("empty response")]
    Empty,
    #[error("status {status}: {message}")]
    Status { status: i32, message: String },
}

/// Classifies an endorsement call result. Checks, in order: transport
/// error, empty response, status outside `[200, 400)`.
pub fn classify_endorsement(
    result: Result<Option<ProposalResponse>, TransportError>,
) -> Result<ProposalResponse, EndorseFailure> {
    let response = result?.ok_or(EndorseFailure::Empty)?;
    if !response.response.is_success() {
        return Err(EndorseFailure::Status {
            status: response.response.status,
            message: response.response.message,
        });
    }
    Ok(response)
}

/// Endorsement worker bound to one connection of one endorsing endpoint.
///
/// `concurrency` tasks share the connection and pull from the worker's
/// queue, so a single connection carries several calls at once.
pub struct Proposer {
    queue: mpsc::Sender<WorkUnit>,
}

/// What the worker's tasks need besides the queue.
struct ProposerTask {
    client: Arc<dyn EndorserClient>,
    queue: Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
    output: mpsc::Sender<WorkUnit>,
    stats: StatsHandle,
    worker: WorkerId,
    cancel: CancellationToken,
}

impl Proposer {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        client: Arc<dyn EndorserClient>,
        concurrency: usize,
        capacity: usize,
        output: mpsc::Sender<WorkUnit>,
        stats: StatsHandle,
        worker: WorkerId,
        cancel: CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> (Self, QueueGauge) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let gauge = QueueGauge::for_sender(client.endpoint().to_string(), &queue);
        let shared = Arc::new(Mutex::new(rx));
        for _ in 0..concurrency.max(1) {
            let task = ProposerTask {
                client: client.clone(),
                queue: shared.clone(),
                output: output.clone(),
                stats: stats.clone(),
                worker,
                cancel: cancel.clone(),
            };
            tasks.spawn(task.run());
        }
        (Self { queue }, gauge)
    }
}

#[async_trait]
impl Handler for Proposer {
    async fn handle(&self, unit: WorkUnit) -> Result<(), PipelineError> {
        self.queue.send(unit).await.map_err(|_| PipelineError::QueueClosed {
            stage: Stage::Endorsement,
        })
    }
}

impl ProposerTask {
    fn endpoint(&self) -> &Endpoint {
        self.client.endpoint()
    }

    async fn next_unit(&self) -> Option<WorkUnit> {
        let mut queue = self.queue.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            unit = queue.recv() => unit,
        }
    }

    async fn record(&self, outcome: Outcome) {
        self.stats.record_for(self.worker, StatItem::Endorsement, outcome).await;
    }

    async fn run(self) {
        while let Some(mut unit) = self.next_unit().await {
            self.record(Outcome::Attempted).await;
            let Some(signed) = unit.signed_request() else {
                warn!(seq = unit.seq(), endpoint = %self.endpoint(), "unit reached endorsement unsigned");
                self.record(Outcome::Failed).await;
                continue;
            };

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.client.process_proposal(signed) => result,
            };
            let response = match classify_endorsement(result) {
                Ok(response) => response,
                Err(failure) => {
                    warn!(
                        seq = unit.seq(),
                        endpoint = %self.endpoint(),
                        error = %failure,
                        "endorsement failed"
                    );
                    self.record(Outcome::Failed).await;
                    continue;
                }
            };
            if let Err(err) = unit.attach_endorsement(response) {
                warn!(endpoint = %self.endpoint(), error = %err, "dropping unit");
                self.record(Outcome::Failed).await;
                continue;
            }
            self.record(Outcome::Succeeded).await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = self.output.send(unit) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(endpoint = %self.endpoint(), "proposer task stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use fabload_codec::{create_proposal, ProposalResponse, Response, SignedProposal};
    use fabload_core::Endpoint;
    use fabload_transport::{EndorserClient, TransportError};
    use tokio::sync::mpsc;
    use tokio::task::JoinSet;
    use tokio_util::sync::CancellationToken;

    use super::{classify_endorsement, EndorseFailure, Proposer};
    use crate::dispatcher::Handler;
    use crate::element::{UnitStage, WorkUnit};
    use crate::stats::StatsAggregator;

    fn response(status: i32) -> ProposalResponse {
        ProposalResponse {
            response: Response {
                status,
                message: format!("status {status}"),
                payload: Vec::new(),
            },
            payload: Vec::new(),
            endorsement: None,
        }
    }

    #[test]
    fn status_boundaries_are_inclusive_exclusive() {
        for status in [199, 400, 500, 0] {
            let failure = classify_endorsement(Ok(Some(response(status))))
                .expect_err("status outside [200, 400) must fail");
            assert!(matches!(failure, EndorseFailure::Status { status: s, .. } if s == status));
        }
        for status in [200, 201, 399] {
            let ok = classify_endorsement(Ok(Some(response(status)))).expect("status should pass");
            assert_eq!(ok.response.status, status);
        }
    }

    #[test]
    fn transport_error_wins_over_everything_else() {
        let failure = classify_endorsement(Err(TransportError::Closed)).expect_err("must fail");
        assert!(matches!(failure, EndorseFailure::Transport(TransportError::Closed)));
        let failure = classify_endorsement(Ok(None)).expect_err("must fail");
        assert!(matches!(failure, EndorseFailure::Empty));
    }

    struct FixedStatus {
        endpoint: Endpoint,
        status: i32,
    }

    #[async_trait]
    impl EndorserClient for FixedStatus {
        async fn process_proposal(
            &self,
            _signed: &SignedProposal,
        ) -> Result<Option<ProposalResponse>, TransportError> {
            Ok(Some(response(self.status)))
        }

        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }
    }

    fn signed_unit(seq: u64) -> WorkUnit {
        let mut unit = WorkUnit::new(seq, create_proposal(b"c", "ch", "cc", "fn", Vec::new()));
        unit.attach_signed_request(SignedProposal {
            proposal_bytes: vec![1],
            signature: vec![2],
        })
        .expect("sign");
        unit
    }

    async fn run_worker(status: i32, units: u64) -> (Vec<WorkUnit>, crate::stats::StatsSnapshot) {
        let (stats, _agg) = StatsAggregator::spawn(64);
        let worker = stats.register_worker("peer0:7051").await;
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let mut tasks = JoinSet::new();
        let client = Arc::new(FixedStatus {
            endpoint: Endpoint::new("peer0:7051", ""),
            status,
        });
        let (proposer, gauge) = Proposer::spawn(
            client,
            3,
            16,
            out_tx,
            stats.clone(),
            worker,
            CancellationToken::new(),
            &mut tasks,
        );
        assert_eq!(gauge.label(), "peer0:7051");
        for seq in 0..units {
            proposer.handle(signed_unit(seq)).await.expect("queue accepts");
        }
        drop(proposer);
        while tasks.join_next().await.is_some() {}

        let mut forwarded = Vec::new();
        while let Some(unit) = out_rx.recv().await {
            forwarded.push(unit);
        }
        let report = stats.report().await.expect("report");
        (forwarded, report.totals)
    }

    #[tokio::test]
    async fn successes_are_forwarded_endorsed() {
        let (forwarded, totals) = run_worker(200, 10).await;
        assert_eq!(forwarded.len(), 10);
        assert!(forwarded.iter().all(|unit| unit.stage() == UnitStage::Endorsed));
        assert_eq!(totals.endorsement.attempted, 10);
        assert_eq!(totals.endorsement.succeeded, 10);
        assert_eq!(totals.endorsement.failed, 0);
    }

    #[tokio::test]
    async fn failures_are_counted_and_dropped() {
        let (forwarded, totals) = run_worker(500, 10).await;
        assert!(forwarded.is_empty());
        assert_eq!(totals.endorsement.attempted, 10);
        assert_eq!(totals.endorsement.failed, 10);
    }
}
