use async_trait::async_trait;
use fabload_core::Endpoint;
use fabload_transport::{AckSource, BroadcastStream, EnvelopeSink};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dispatcher::{Handler, QueueGauge};
use crate::element::WorkUnit;
use crate::error::{PipelineError, Stage};
use crate::stats::{Outcome, StatItem, StatsHandle};

/// Submission worker owning one ordering stream.
///
/// A send task writes envelopes from the worker queue while a drain task
/// reads acknowledgements; neither waits on the other.
pub struct Broadcaster {
    queue: mpsc::Sender<WorkUnit>,
}

impl Broadcaster {
    pub fn spawn(
        endpoint: Endpoint,
        stream: BroadcastStream,
        capacity: usize,
        stats: StatsHandle,
        fatal: mpsc::Sender<PipelineError>,
        cancel: CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> (Self, QueueGauge) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let gauge = QueueGauge::for_sender(format!("broadcast {endpoint}"), &queue);
        tasks.spawn(send_envelopes(
            endpoint.clone(),
            stream.sink,
            rx,
            stats.clone(),
            cancel.clone(),
        ));
        tasks.spawn(drain_acks(endpoint, stream.acks, stats, fatal, cancel));
        (Self { queue }, gauge)
    }
}

#[async_trait]
impl Handler for Broadcaster {
    async fn handle(&self, unit: WorkUnit) -> Result<(), PipelineError> {
        self.queue.send(unit).await.map_err(|_| PipelineError::QueueClosed {
            stage: Stage::Submission,
        })
    }
}

/// Dropping the sink on exit ends the stream so the drain task sees a
/// clean end once outstanding acks arrive.
async fn send_envelopes(
    endpoint: Endpoint,
    mut sink: Box<dyn EnvelopeSink>,
    mut queue: mpsc::Receiver<WorkUnit>,
    stats: StatsHandle,
    cancel: CancellationToken,
) {
    loop {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            unit = queue.recv() => unit,
        };
        let Some(unit) = unit else {
            break;
        };
        let seq = unit.seq();
        stats.record(StatItem::Submission, Outcome::Attempted).await;
        let envelope = match unit.into_envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "unit reached submission unassembled");
                stats.record(StatItem::Submission, Outcome::Failed).await;
                continue;
            }
        };
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = sink.send(envelope) => sent,
        };
        if let Err(err) = sent {
            warn!(seq, endpoint = %endpoint, error = %err, "failed to broadcast envelope");
            stats.record(StatItem::Submission, Outcome::Failed).await;
        }
    }
    debug!(endpoint = %endpoint, "broadcast send task stopped");
}

async fn drain_acks(
    endpoint: Endpoint,
    mut acks: Box<dyn AckSource>,
    stats: StatsHandle,
    fatal: mpsc::Sender<PipelineError>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = acks.recv() => next,
        };
        match next {
            Ok(Some(ack)) if ack.status.is_success() => {
                stats.record(StatItem::Submission, Outcome::Succeeded).await;
            }
            Ok(Some(ack)) => {
                warn!(endpoint = %endpoint, status = %ack.status, info = %ack.info, "broadcast rejected");
                stats.record(StatItem::Submission, Outcome::Failed).await;
            }
            Ok(None) => break,
            Err(err) => {
                error!(endpoint = %endpoint, error = %err, "broadcast ack stream failed");
                let _ = fatal.try_send(PipelineError::StreamFatal {
                    stage: Stage::Submission,
                    reason: format!("{endpoint}: {err}"),
                });
                break;
            }
        }
    }
    debug!(endpoint = %endpoint, "broadcast drain task stopped");
}
