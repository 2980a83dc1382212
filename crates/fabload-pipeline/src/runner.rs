use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;

use fabload_crypto::Signer;
use fabload_transport::Connector;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::assembler::AssemblyPool;
use crate::broadcaster::Broadcaster;
use crate::config::RunConfig;
use crate::dispatcher::{Dispatcher, Handler, QueueGauge};
use crate::error::{PipelineError, Stage};
use crate::observer::Observer;
use crate::proposer::Proposer;
use crate::rate::{Generator, GeneratorState};
use crate::stats::{Counters, StatsAggregator, StatsHandle, StatsReport, StatsSnapshot};

/// Tracing target of the periodic statistics report.
pub const STATS_TARGET: &str = "fabload::stats";

const STATS_MAILBOX_CAPACITY: usize = 4096;
const FATAL_CAPACITY: usize = 16;

/// Whether every generated unit is accounted for: committed on the ledger
/// or dropped at endorsement or submission.
pub fn reconciled(generator: &GeneratorState, stats: &StatsSnapshot, committed: u64) -> bool {
    generator.finished && committed.saturating_add(stats.dropped()) >= generator.emitted
}

/// Requests early termination of generation. In-flight units still drain
/// and the run still reconciles. Stopping twice is harmless.
#[derive(Debug, Clone)]
pub struct StopHandle {
    generation: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.generation.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.generation.is_cancelled()
    }
}

/// Outcome of a run that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub emitted: u64,
    pub endorsement: Counters,
    pub submission: Counters,
    pub committed: u64,
    pub elapsed: Duration,
    /// Generation ended before the configured total.
    pub stopped_early: bool,
    /// False when the run was cancelled before reconciling.
    pub completed: bool,
}

impl RunSummary {
    pub fn dropped(&self) -> u64 {
        self.endorsement.failed.saturating_add(self.submission.failed)
    }

    pub fn committed_tps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.committed as f64 / secs
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generated {} | endorsed {}/{} (failed {}) | submitted {}/{} (failed {}) | committed {} in {:.2?} ({:.2} tps)",
            self.emitted,
            self.endorsement.succeeded,
            self.endorsement.attempted,
            self.endorsement.failed,
            self.submission.succeeded,
            self.submission.attempted,
            self.submission.failed,
            self.committed,
            self.elapsed,
            self.committed_tps(),
        )
    }
}

/// Renders a statistics report with per-endorser lines and queue depths.
pub fn render_report(report: &StatsReport, queues: &[QueueGauge], endorsers: &[QueueGauge]) -> String {
    let mut out = format!("Statistic:\n{report}");
    if !report.workers.is_empty() {
        out.push_str("Endorsers:\n");
    }
    for worker in &report.workers {
        let waited = endorsers.get(worker.id.0).map(QueueGauge::depth).unwrap_or(0);
        let _ = writeln!(
            out,
            "\t{:>10}({:>10}){:>10}({:>10}){:>10}({:>10})\t waited:{:>10}\tnode:{}",
            worker.totals.attempted,
            worker.speed.attempted,
            worker.totals.succeeded,
            worker.speed.succeeded,
            worker.totals.failed,
            worker.speed.failed,
            waited,
            worker.label,
        );
    }
    out.push_str("Queues:");
    for gauge in queues {
        let _ = write!(out, " {}={}", gauge.label(), gauge.depth());
    }
    out
}

async fn report_loop(
    stats: StatsHandle,
    interval: Duration,
    queues: Vec<QueueGauge>,
    endorsers: Vec<QueueGauge>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(report) = stats.report().await else {
            break;
        };
        info!(target: STATS_TARGET, "{}", render_report(&report, &queues, &endorsers));
    }
}

fn spawn_dispatcher(
    tasks: &mut JoinSet<()>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    fatal: mpsc::Sender<PipelineError>,
) {
    tasks.spawn(async move {
        if let Err(err) = dispatcher.run(cancel).await {
            let _ = fatal.try_send(err);
        }
    });
}

enum Completion {
    Reconciled,
    Cancelled,
}

/// Progress channels the wait loop reconciles.
struct Progress {
    generator: watch::Receiver<GeneratorState>,
    committed: watch::Receiver<u64>,
    queues: Vec<QueueGauge>,
    endorsers: Vec<QueueGauge>,
}

/// One benchmark run: builds every stage, drives generation and waits
/// until the run reconciles, is cancelled, or fails.
pub struct Benchmark {
    config: Arc<RunConfig>,
    connector: Arc<dyn Connector>,
    signer: Arc<dyn Signer>,
    shutdown: CancellationToken,
    generation: CancellationToken,
}

impl fmt::Debug for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Benchmark").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Benchmark {
    pub fn new(
        config: RunConfig,
        connector: Arc<dyn Connector>,
        signer: Arc<dyn Signer>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let generation = shutdown.child_token();
        Ok(Self {
            config: Arc::new(config),
            connector,
            signer,
            shutdown,
            generation,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            generation: self.generation.clone(),
        }
    }

    /// Cancelling this token aborts the whole run without reconciling.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let (stats, _aggregator) = StatsAggregator::spawn(STATS_MAILBOX_CAPACITY);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(FATAL_CAPACITY);
        let mut tasks = JoinSet::new();

        let outcome = match self.start(&stats, fatal_tx, &mut tasks).await {
            Ok(mut progress) => match self.wait(&stats, &mut fatal_rx, &mut progress).await {
                Ok(completion) => Ok((completion, progress)),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        let final_report = stats.report().await;
        self.shutdown.cancel();
        tasks.shutdown().await;

        let (completion, progress) = match outcome {
            Ok(done) => done,
            Err(err) => {
                error!(stage = ?err.stage(), error = %err, "benchmark failed");
                return Err(err);
            }
        };
        let generator = *progress.generator.borrow();
        let committed = *progress.committed.borrow();
        if let Some(report) = &final_report {
            info!(target: STATS_TARGET, "{}", render_report(report, &progress.queues, &progress.endorsers));
        }
        let totals = final_report.map(|report| report.totals).unwrap_or_else(|| stats.snapshot());
        let summary = RunSummary {
            emitted: generator.emitted,
            endorsement: totals.endorsement,
            submission: totals.submission,
            committed,
            elapsed: started.elapsed(),
            stopped_early: generator.emitted < self.config.total,
            completed: matches!(completion, Completion::Reconciled),
        };
        info!(%summary, completed = summary.completed, "benchmark finished");
        Ok(summary)
    }

    /// Connects every worker and spawns every stage, downstream first so
    /// each queue has a consumer before anything is produced into it.
    async fn start(
        &self,
        stats: &StatsHandle,
        fatal: mpsc::Sender<PipelineError>,
        tasks: &mut JoinSet<()>,
    ) -> Result<Progress, PipelineError> {
        let config = &self.config;
        let cancel = &self.shutdown;
        let mut queues = Vec::new();

        let observer = Observer::connect(
            self.connector.as_ref(),
            config.observer_endpoint(),
            &config.channel,
            self.signer.as_ref(),
        )
        .await?;

        let mut broadcasters: Vec<Arc<dyn Handler>> = Vec::with_capacity(config.connections);
        for _ in 0..config.connections {
            let stream = self
                .connector
                .broadcast(&config.orderer)
                .await
                .map_err(|source| PipelineError::Connect {
                    stage: Stage::Submission,
                    endpoint: config.orderer.to_string(),
                    source,
                })?;
            let (broadcaster, gauge) = Broadcaster::spawn(
                config.orderer.clone(),
                stream,
                config.queue_capacity,
                stats.clone(),
                fatal.clone(),
                cancel.clone(),
                tasks,
            );
            broadcasters.push(Arc::new(broadcaster));
            queues.push(gauge);
        }
        let (submit_tx, submit_dispatcher) =
            Dispatcher::new("submission", config.queue_capacity, broadcasters);
        queues.push(QueueGauge::for_sender("submission dispatcher", &submit_tx));
        spawn_dispatcher(tasks, submit_dispatcher, cancel.clone(), fatal.clone());

        let (endorsed_tx, endorsed_rx) = mpsc::channel(config.queue_capacity);
        queues.push(QueueGauge::for_sender("assembly", &endorsed_tx));

        let mut proposers: Vec<Arc<dyn Handler>> = Vec::with_capacity(config.endorsement_workers());
        let mut endorsers = Vec::with_capacity(config.endorsement_workers());
        for endpoint in &config.endorsers {
            for _ in 0..config.connections {
                let client = self
                    .connector
                    .endorser(endpoint)
                    .await
                    .map_err(|source| PipelineError::Connect {
                        stage: Stage::Endorsement,
                        endpoint: endpoint.to_string(),
                        source,
                    })?;
                let worker = stats.register_worker(endpoint.to_string()).await;
                let (proposer, gauge) = Proposer::spawn(
                    client,
                    config.concurrency,
                    config.queue_capacity,
                    endorsed_tx.clone(),
                    stats.clone(),
                    worker,
                    cancel.clone(),
                    tasks,
                );
                proposers.push(Arc::new(proposer));
                endorsers.push(gauge);
            }
        }
        drop(endorsed_tx);
        let (endorse_tx, endorse_dispatcher) =
            Dispatcher::new("endorsement", config.queue_capacity, proposers);
        queues.push(QueueGauge::for_sender("endorsement dispatcher", &endorse_tx));
        spawn_dispatcher(tasks, endorse_dispatcher, cancel.clone(), fatal.clone());

        AssemblyPool::integrators(
            self.signer.clone(),
            endorsed_rx,
            submit_tx,
            fatal.clone(),
            cancel.clone(),
        )
        .spawn(config.assembler_tasks, tasks);

        let (raw_tx, raw_rx) = mpsc::channel(config.queue_capacity);
        queues.push(QueueGauge::for_sender("generator", &raw_tx));
        AssemblyPool::signers(self.signer.clone(), raw_rx, endorse_tx, fatal.clone(), cancel.clone())
            .spawn(config.signer_tasks, tasks);

        let (committed_tx, committed_rx) = watch::channel(0_u64);
        let observer_stats = stats.clone();
        let observer_cancel = cancel.clone();
        let target = config.total;
        tasks.spawn(async move {
            observer
                .run(target, observer_stats, committed_tx, fatal, observer_cancel)
                .await;
        });

        let (generator, generator_rx) = Generator::new(
            config.clone(),
            self.signer.identity().to_vec(),
            raw_tx,
            self.generation.clone(),
        );
        tasks.spawn(async move {
            generator.run().await;
        });

        tasks.spawn(report_loop(
            stats.clone(),
            config.report_interval,
            queues.clone(),
            endorsers.clone(),
            cancel.clone(),
        ));

        info!(
            endorsers = config.endorsers.len(),
            connections = config.connections,
            concurrency = config.concurrency,
            rate = config.rate,
            total = config.total,
            "benchmark started"
        );
        Ok(Progress {
            generator: generator_rx,
            committed: committed_rx,
            queues,
            endorsers,
        })
    }

    /// Waits until generation finished and committed plus dropped units
    /// cover everything emitted.
    async fn wait(
        &self,
        stats: &StatsHandle,
        fatal: &mut mpsc::Receiver<PipelineError>,
        progress: &mut Progress,
    ) -> Result<Completion, PipelineError> {
        let mut snapshots = stats.subscribe();
        let (mut generator_open, mut stats_open, mut committed_open) = (true, true, true);
        loop {
            let generator = *progress.generator.borrow_and_update();
            let snapshot = *snapshots.borrow_and_update();
            let committed = *progress.committed.borrow_and_update();
            if reconciled(&generator, &snapshot, committed) {
                return Ok(Completion::Reconciled);
            }
            tokio::select! {
                Some(err) = fatal.recv() => return Err(err),
                _ = self.shutdown.cancelled() => return Ok(Completion::Cancelled),
                changed = progress.generator.changed(), if generator_open => {
                    generator_open = changed.is_ok();
                }
                changed = snapshots.changed(), if stats_open => {
                    stats_open = changed.is_ok();
                }
                changed = progress.committed.changed(), if committed_open => {
                    committed_open = changed.is_ok();
                }
            }
        }
    }
}
