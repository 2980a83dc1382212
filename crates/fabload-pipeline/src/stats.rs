use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Pipeline item a counter triple belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatItem {
    Endorsement,
    Submission,
    Commit,
}

impl StatItem {
    pub const ALL: [StatItem; 3] = [StatItem::Endorsement, StatItem::Submission, StatItem::Commit];

    pub fn label(self) -> &'static str {
        match self {
            StatItem::Endorsement => "endorsement",
            StatItem::Submission => "submission",
            StatItem::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Attempted,
    Succeeded,
    Failed,
}

/// Monotonic attempted/succeeded/failed triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl Counters {
    fn bump(&mut self, outcome: Outcome, count: u64) {
        let slot = match outcome {
            Outcome::Attempted => &mut self.attempted,
            Outcome::Succeeded => &mut self.succeeded,
            Outcome::Failed => &mut self.failed,
        };
        *slot = slot.saturating_add(count);
    }

    pub fn delta(&self, previous: &Counters) -> Counters {
        Counters {
            attempted: self.attempted.saturating_sub(previous.attempted),
            succeeded: self.succeeded.saturating_sub(previous.succeeded),
            failed: self.failed.saturating_sub(previous.failed),
        }
    }
}

/// Immutable copy of every item's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub endorsement: Counters,
    pub submission: Counters,
    pub commit: Counters,
}

impl StatsSnapshot {
    pub fn get(&self, item: StatItem) -> Counters {
        match item {
            StatItem::Endorsement => self.endorsement,
            StatItem::Submission => self.submission,
            StatItem::Commit => self.commit,
        }
    }

    fn get_mut(&mut self, item: StatItem) -> &mut Counters {
        match item {
            StatItem::Endorsement => &mut self.endorsement,
            StatItem::Submission => &mut self.submission,
            StatItem::Commit => &mut self.commit,
        }
    }

    /// Per-item growth since `previous`.
    pub fn delta(&self, previous: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            endorsement: self.endorsement.delta(&previous.endorsement),
            submission: self.submission.delta(&previous.submission),
            commit: self.commit.delta(&previous.commit),
        }
    }

    /// Units dropped at endorsement or submission; they never reach the
    /// commit feed.
    pub fn dropped(&self) -> u64 {
        self.endorsement.failed.saturating_add(self.submission.failed)
    }
}

/// Identifies one worker's private counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub id: WorkerId,
    pub label: String,
    pub totals: Counters,
    pub speed: Counters,
}

/// Totals plus growth since the previous report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub totals: StatsSnapshot,
    pub speed: StatsSnapshot,
    pub workers: Vec<WorkerReport>,
}

fn write_counters(f: &mut fmt::Formatter<'_>, totals: &Counters, speed: &Counters) -> fmt::Result {
    write!(
        f,
        "{:>10}({:>10}){:>10}({:>10}){:>10}({:>10})",
        totals.attempted, speed.attempted, totals.succeeded, speed.succeeded, totals.failed, speed.failed
    )
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<15}     Total(     Speed)   Success(     Speed)      Fail(     Speed)",
            ""
        )?;
        for item in StatItem::ALL {
            write!(f, "{:<15}", item.label())?;
            write_counters(f, &self.totals.get(item), &self.speed.get(item))?;
            writeln!(f)?;
        }
        Ok(())
    }
}

enum StatsCommand {
    Record {
        item: StatItem,
        outcome: Outcome,
        worker: Option<WorkerId>,
        count: u64,
    },
    RegisterWorker {
        id: WorkerId,
        label: String,
    },
    Report {
        reply: oneshot::Sender<StatsReport>,
    },
}

#[derive(Debug, Default)]
struct WorkerCounters {
    label: String,
    current: Counters,
    previous: Counters,
}

/// Single owner of every counter. Producers reach it through
/// [`StatsHandle`] messages only.
pub struct StatsAggregator {
    rx: mpsc::Receiver<StatsCommand>,
    current: StatsSnapshot,
    previous: StatsSnapshot,
    workers: BTreeMap<WorkerId, WorkerCounters>,
    published: watch::Sender<StatsSnapshot>,
}

impl StatsAggregator {
    /// Starts the aggregator task. It stops once every handle is dropped and
    /// returns the final totals.
    pub fn spawn(mailbox_capacity: usize) -> (StatsHandle, JoinHandle<StatsSnapshot>) {
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let (published, snapshots) = watch::channel(StatsSnapshot::default());
        let aggregator = StatsAggregator {
            rx,
            current: StatsSnapshot::default(),
            previous: StatsSnapshot::default(),
            workers: BTreeMap::new(),
            published,
        };
        let handle = StatsHandle {
            tx,
            snapshots,
            next_worker: Arc::new(AtomicUsize::new(0)),
        };
        (handle, tokio::spawn(aggregator.run()))
    }

    async fn run(mut self) -> StatsSnapshot {
        while let Some(command) = self.rx.recv().await {
            self.apply(command);
        }
        self.current
    }

    fn apply(&mut self, command: StatsCommand) {
        match command {
            StatsCommand::Record {
                item,
                outcome,
                worker,
                count,
            } => {
                self.current.get_mut(item).bump(outcome, count);
                if let Some(id) = worker {
                    self.workers.entry(id).or_default().current.bump(outcome, count);
                }
                self.published.send_replace(self.current);
            }
            StatsCommand::RegisterWorker { id, label } => {
                self.workers.entry(id).or_default().label = label;
            }
            StatsCommand::Report { reply } => {
                let _ = reply.send(self.report());
            }
        }
    }

    /// Swaps current into previous so the next report's speed starts fresh.
    fn report(&mut self) -> StatsReport {
        let speed = self.current.delta(&self.previous);
        self.previous = self.current;
        let workers = self
            .workers
            .iter_mut()
            .map(|(id, worker)| {
                let speed = worker.current.delta(&worker.previous);
                worker.previous = worker.current;
                WorkerReport {
                    id: *id,
                    label: worker.label.clone(),
                    totals: worker.current,
                    speed,
                }
            })
            .collect();
        StatsReport {
            totals: self.current,
            speed,
            workers,
        }
    }
}

/// Cloneable producer side of the aggregator mailbox.
///
/// Recording waits when the mailbox is full. Records sent after the
/// aggregator stopped are discarded.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::Sender<StatsCommand>,
    snapshots: watch::Receiver<StatsSnapshot>,
    next_worker: Arc<AtomicUsize>,
}

impl fmt::Debug for StatsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsHandle")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl StatsHandle {
    pub async fn record(&self, item: StatItem, outcome: Outcome) {
        self.record_n(item, outcome, None, 1).await;
    }

    /// Records into the item totals and the worker's own counters.
    pub async fn record_for(&self, worker: WorkerId, item: StatItem, outcome: Outcome) {
        self.record_n(item, outcome, Some(worker), 1).await;
    }

    pub async fn record_n(&self, item: StatItem, outcome: Outcome, worker: Option<WorkerId>, count: u64) {
        let _ = self
            .tx
            .send(StatsCommand::Record {
                item,
                outcome,
                worker,
                count,
            })
            .await;
    }

    /// Allocates per-worker counters shown under `label` in reports.
    pub async fn register_worker(&self, label: impl Into<String>) -> WorkerId {
        let id = WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed));
        let _ = self
            .tx
            .send(StatsCommand::RegisterWorker {
                id,
                label: label.into(),
            })
            .await;
        id
    }

    /// Takes a report and resets the speed window. `None` once the
    /// aggregator has stopped.
    pub async fn report(&self) -> Option<StatsReport> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StatsCommand::Report { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Latest totals without touching the speed window.
    pub fn snapshot(&self) -> StatsSnapshot {
        *self.snapshots.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.snapshots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{Counters, Outcome, StatItem, StatsAggregator, StatsSnapshot};

    #[tokio::test]
    async fn records_from_many_producers_are_all_counted() {
        let (stats, _task) = StatsAggregator::spawn(16);
        let mut producers = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            producers.push(tokio::spawn(async move {
                for _ in 0..25 {
                    stats.record(StatItem::Endorsement, Outcome::Attempted).await;
                    stats.record(StatItem::Endorsement, Outcome::Succeeded).await;
                }
            }));
        }
        for producer in producers {
            producer.await.expect("producer should finish");
        }

        let report = stats.report().await.expect("aggregator should be running");
        assert_eq!(report.totals.endorsement.attempted, 200);
        assert_eq!(report.totals.endorsement.succeeded, 200);
        assert_eq!(report.totals.submission, Counters::default());
        assert_eq!(stats.snapshot(), report.totals);
    }

    #[tokio::test]
    async fn consecutive_reports_without_events_have_zero_speed() {
        let (stats, _task) = StatsAggregator::spawn(16);
        stats.record(StatItem::Submission, Outcome::Attempted).await;
        stats.record(StatItem::Submission, Outcome::Failed).await;

        let first = stats.report().await.expect("first report");
        assert_eq!(first.speed.submission.attempted, 1);
        assert_eq!(first.speed.submission.failed, 1);

        let second = stats.report().await.expect("second report");
        assert_eq!(second.speed, StatsSnapshot::default());
        assert_eq!(second.totals, first.totals);
    }

    #[tokio::test]
    async fn worker_counters_track_their_own_speed() {
        let (stats, _task) = StatsAggregator::spawn(16);
        let a = stats.register_worker("peer0:7051-peer0").await;
        let b = stats.register_worker("peer1:7051-peer1").await;
        stats.record_for(a, StatItem::Endorsement, Outcome::Attempted).await;
        stats.record_for(b, StatItem::Endorsement, Outcome::Attempted).await;
        stats.record_for(b, StatItem::Endorsement, Outcome::Failed).await;

        let report = stats.report().await.expect("report");
        assert_eq!(report.totals.endorsement.attempted, 2);
        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.workers[0].label, "peer0:7051-peer0");
        assert_eq!(report.workers[1].totals.failed, 1);

        let next = stats.report().await.expect("report");
        assert_eq!(next.workers[1].speed, Counters::default());
        assert_eq!(next.workers[1].totals.failed, 1);
    }

    #[test]
    fn snapshot_delta_is_pure_and_saturating() {
        let previous = StatsSnapshot {
            commit: Counters {
                attempted: 5,
                succeeded: 5,
                failed: 0,
            },
            ..StatsSnapshot::default()
        };
        let current = StatsSnapshot {
            commit: Counters {
                attempted: 9,
                succeeded: 8,
                failed: 1,
            },
            ..StatsSnapshot::default()
        };
        let delta = current.delta(&previous);
        assert_eq!(delta.commit.attempted, 4);
        assert_eq!(delta.commit.succeeded, 3);
        assert_eq!(delta.commit.failed, 1);
        assert_eq!(previous.delta(&current), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn report_table_lists_every_item() {
        let (stats, _task) = StatsAggregator::spawn(4);
        stats.record(StatItem::Commit, Outcome::Succeeded).await;
        let report = stats.report().await.expect("report");
        let table = report.to_string();
        for item in StatItem::ALL {
            assert!(table.contains(item.label()), "missing {}", item.label());
        }
        assert_eq!(table.lines().count(), 4);
    }
}
