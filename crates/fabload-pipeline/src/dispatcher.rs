use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::element::WorkUnit;
use crate::error::PipelineError;

/// A worker that accepts units from a dispatcher.
///
/// `handle` waits while the worker's own queue is full.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, unit: WorkUnit) -> Result<(), PipelineError>;
}

/// Reads the current depth of a bounded queue without holding it open.
#[derive(Clone)]
pub struct QueueGauge {
    label: String,
    depth: Arc<dyn Fn() -> usize + Send + Sync>,
}

impl fmt::Debug for QueueGauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueGauge")
            .field("label", &self.label)
            .field("depth", &self.depth())
            .finish()
    }
}

impl QueueGauge {
    pub fn for_sender<T: Send + 'static>(label: impl Into<String>, sender: &mpsc::Sender<T>) -> Self {
        let weak = sender.downgrade();
        Self {
            label: label.into(),
            depth: Arc::new(move || {
                weak.upgrade()
                    .map(|sender| sender.max_capacity() - sender.capacity())
                    .unwrap_or(0)
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn depth(&self) -> usize {
        (self.depth)()
    }
}

/// Worker index selection wrapping modulo the pool size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRobin {
    next: usize,
    len: usize,
}

impl RoundRobin {
    pub fn new(len: usize) -> Self {
        Self {
            next: 0,
            len: len.max(1),
        }
    }

    pub fn next_index(&mut self) -> usize {
        let index = self.next;
        self.next = (self.next + 1) % self.len;
        index
    }
}

/// Fans units from one bounded input queue out to a fixed worker set.
///
/// Unit `k` goes to worker `k mod W`. The dispatcher owns no connection;
/// when its input closes it drops the workers, which closes their queues.
pub struct Dispatcher {
    name: &'static str,
    input: mpsc::Receiver<WorkUnit>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new(
        name: &'static str,
        capacity: usize,
        handlers: Vec<Arc<dyn Handler>>,
    ) -> (mpsc::Sender<WorkUnit>, Self) {
        let (tx, input) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                name,
                input,
                handlers,
            },
        )
    }

    pub fn workers(&self) -> usize {
        self.handlers.len()
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let mut selector = RoundRobin::new(self.handlers.len());
        loop {
            let unit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                unit = self.input.recv() => unit,
            };
            let Some(unit) = unit else {
                break;
            };
            let Some(handler) = self.handlers.get(selector.next_index()) else {
                break;
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                handled = handler.handle(unit) => handled?,
            }
        }
        debug!(dispatcher = self.name, "dispatcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use fabload_codec::create_proposal;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{Dispatcher, Handler, QueueGauge, RoundRobin};
    use crate::element::WorkUnit;
    use crate::error::PipelineError;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, unit: WorkUnit) -> Result<(), PipelineError> {
            self.seen.lock().expect("recorder lock").push(unit.seq());
            Ok(())
        }
    }

    fn unit(seq: u64) -> WorkUnit {
        WorkUnit::new(seq, create_proposal(b"c", "ch", "cc", "fn", Vec::new()))
    }

    #[test]
    fn round_robin_wraps() {
        let mut rr = RoundRobin::new(3);
        let picks: Vec<usize> = (0..7).map(|_| rr.next_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn units_are_spread_fairly_by_sequence() {
        const WORKERS: usize = 4;
        const UNITS: u64 = 23;
        let recorders: Vec<Arc<Recorder>> = (0..WORKERS).map(|_| Arc::new(Recorder::default())).collect();
        let handlers: Vec<Arc<dyn Handler>> = recorders
            .iter()
            .map(|recorder| recorder.clone() as Arc<dyn Handler>)
            .collect();
        let (input, dispatcher) = Dispatcher::new("test", 8, handlers);
        assert_eq!(dispatcher.workers(), WORKERS);
        let task = tokio::spawn(dispatcher.run(CancellationToken::new()));

        for seq in 0..UNITS {
            input.send(unit(seq)).await.expect("dispatcher should accept");
        }
        drop(input);
        task.await
            .expect("dispatcher should join")
            .expect("dispatcher should finish cleanly");

        for (index, recorder) in recorders.iter().enumerate() {
            let seen = recorder.seen.lock().expect("recorder lock").clone();
            let count = seen.len() as u64;
            assert!(count == UNITS / WORKERS as u64 || count == UNITS.div_ceil(WORKERS as u64));
            assert!(seen.iter().all(|seq| *seq % WORKERS as u64 == index as u64));
        }
    }

    struct Closed;

    #[async_trait]
    impl Handler for Closed {
        async fn handle(&self, _unit: WorkUnit) -> Result<(), PipelineError> {
            Err(PipelineError::QueueClosed {
                stage: crate::error::Stage::Submission,
            })
        }
    }

    #[tokio::test]
    async fn closed_worker_queue_stops_the_dispatcher() {
        let (input, dispatcher) = Dispatcher::new("test", 2, vec![Arc::new(Closed)]);
        let task = tokio::spawn(dispatcher.run(CancellationToken::new()));
        input.send(unit(0)).await.expect("send");
        let result = task.await.expect("join");
        assert!(matches!(result, Err(PipelineError::QueueClosed { .. })));
    }

    #[tokio::test]
    async fn gauge_reports_queued_units() {
        let (tx, mut rx) = mpsc::channel::<u8>(10);
        let gauge = QueueGauge::for_sender("raw", &tx);
        tx.send(1).await.expect("send");
        tx.send(2).await.expect("send");
        assert_eq!(gauge.depth(), 2);
        rx.recv().await.expect("recv");
        assert_eq!(gauge.depth(), 1);
        assert_eq!(gauge.label(), "raw");
        drop(tx);
        assert_eq!(gauge.depth(), 0);
    }
}
