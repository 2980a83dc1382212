use fabload_codec::{create_signed_deliver_newest_env, DeliverResponse, FilteredBlock, TxValidationCode};
use fabload_core::Endpoint;
use fabload_crypto::Signer;
use fabload_transport::{Connector, DeliverStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PipelineError, Stage};
use crate::stats::{Outcome, StatItem, StatsHandle};

fn feed_error(endpoint: &Endpoint, reason: impl std::fmt::Display) -> PipelineError {
    PipelineError::StreamFatal {
        stage: Stage::Observer,
        reason: format!("{endpoint}: {reason}"),
    }
}

/// Counts transactions on the ledger's commit feed, independent of the
/// submission pipeline.
pub struct Observer {
    endpoint: Endpoint,
    feed: Box<dyn DeliverStream>,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer").field("endpoint", &self.endpoint).finish()
    }
}

impl Observer {
    /// Subscribes from the current tip and drains the tip block, so only
    /// blocks cut afterwards are counted.
    pub async fn connect(
        connector: &dyn Connector,
        endpoint: &Endpoint,
        channel: &str,
        signer: &dyn Signer,
    ) -> Result<Self, PipelineError> {
        let mut feed = connector
            .deliver(endpoint)
            .await
            .map_err(|source| PipelineError::Connect {
                stage: Stage::Observer,
                endpoint: endpoint.to_string(),
                source,
            })?;
        let seek = create_signed_deliver_newest_env(channel, signer).map_err(|source| {
            PipelineError::Signer {
                stage: Stage::Observer,
                source,
            }
        })?;
        feed.send(seek).await.map_err(|err| feed_error(endpoint, err))?;
        match feed.recv().await.map_err(|err| feed_error(endpoint, err))? {
            Some(DeliverResponse::Block(tip)) => {
                debug!(endpoint = %endpoint, tip = tip.number, "commit feed positioned");
            }
            Some(DeliverResponse::Status(status)) => {
                return Err(feed_error(endpoint, format!("seek rejected with {status}")));
            }
            None => return Err(feed_error(endpoint, "feed closed before positioning")),
        }
        Ok(Self {
            endpoint: endpoint.clone(),
            feed,
        })
    }

    /// Receives blocks until `target` transactions were observed or
    /// `cancel` fires. Progress is published on `progress`; feed errors
    /// go to `errors` instead of ending the process.
    pub async fn run(
        mut self,
        target: u64,
        stats: StatsHandle,
        progress: watch::Sender<u64>,
        errors: mpsc::Sender<PipelineError>,
        cancel: CancellationToken,
    ) -> u64 {
        let started = Instant::now();
        let mut observed = 0_u64;
        while observed < target {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.feed.recv() => next,
            };
            let block = match next {
                Ok(Some(DeliverResponse::Block(block))) => block,
                Ok(Some(DeliverResponse::Status(status))) => {
                    let _ = errors.try_send(feed_error(&self.endpoint, format!("feed ended with {status}")));
                    break;
                }
                Ok(None) => {
                    let _ = errors.try_send(feed_error(&self.endpoint, "feed closed"));
                    break;
                }
                Err(err) => {
                    let _ = errors.try_send(feed_error(&self.endpoint, err));
                    break;
                }
            };
            observed += block.tx_count() as u64;
            record_block(&stats, &block).await;
            progress.send_replace(observed);

            let elapsed = started.elapsed();
            let tps = observed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
            info!(
                elapsed = ?elapsed,
                block = block.number,
                txs = block.tx_count(),
                total = observed,
                tps = %format!("{tps:.2}"),
                "block committed"
            );
        }
        debug!(endpoint = %self.endpoint, observed, "observer stopped");
        observed
    }
}

/// Every observed transaction is attempted; invalid ones count as failed.
async fn record_block(stats: &StatsHandle, block: &FilteredBlock) {
    let total = block.tx_count() as u64;
    let valid = block
        .filtered_transactions
        .iter()
        .filter(|tx| tx.validation_code == TxValidationCode::Valid)
        .count() as u64;
    stats.record_n(StatItem::Commit, Outcome::Attempted, None, total).await;
    stats.record_n(StatItem::Commit, Outcome::Succeeded, None, valid).await;
    if total > valid {
        stats.record_n(StatItem::Commit, Outcome::Failed, None, total - valid).await;
    }
}
