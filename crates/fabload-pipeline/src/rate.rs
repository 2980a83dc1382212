use std::sync::Arc;

use fabload_codec::create_proposal;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::element::WorkUnit;

/// Per-tick quotas spreading a per-second rate over `slices` ticks.
///
/// Every quota is `rate / slices`; the first `rate % slices` get one more,
/// so quotas sum to `rate` and differ by at most one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeedSlices {
    quotas: Vec<u64>,
    next: usize,
}

impl SpeedSlices {
    pub fn new(rate: u64, slices: usize) -> Self {
        let slices = slices.max(1);
        let base = rate / slices as u64;
        let remainder = (rate % slices as u64) as usize;
        let quotas = (0..slices)
            .map(|index| base + u64::from(index < remainder))
            .collect();
        Self { quotas, next: 0 }
    }

    pub fn quotas(&self) -> &[u64] {
        &self.quotas
    }

    /// Quota for the next tick; rotates through the slices as ticks pass.
    pub fn next_quota(&mut self) -> u64 {
        let quota = self.quotas[self.next];
        self.next = (self.next + 1) % self.quotas.len();
        quota
    }
}

/// Generator progress, published after every emitted unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorState {
    pub emitted: u64,
    /// No further units will be emitted: budget exhausted or stopped.
    pub finished: bool,
}

/// Emits exactly `total` freshly built requests at the configured rate.
pub struct Generator {
    config: Arc<RunConfig>,
    creator: Vec<u8>,
    output: mpsc::Sender<WorkUnit>,
    state: watch::Sender<GeneratorState>,
    stop: CancellationToken,
}

impl Generator {
    pub fn new(
        config: Arc<RunConfig>,
        creator: Vec<u8>,
        output: mpsc::Sender<WorkUnit>,
        stop: CancellationToken,
    ) -> (Self, watch::Receiver<GeneratorState>) {
        let (state, state_rx) = watch::channel(GeneratorState::default());
        (
            Self {
                config,
                creator,
                output,
                state,
                stop,
            },
            state_rx,
        )
    }

    fn build(&self, seq: u64) -> WorkUnit {
        let request = create_proposal(
            &self.creator,
            &self.config.channel,
            &self.config.chaincode,
            &self.config.function,
            self.config.args_for(seq),
        );
        WorkUnit::new(seq, request)
    }

    /// Runs until the budget is spent or `stop` fires, then closes the
    /// output queue. The first tick fires immediately.
    pub async fn run(self) -> GeneratorState {
        let mut slices = SpeedSlices::new(self.config.rate, self.config.speed_slices);
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut remaining = self.config.total;
        let mut seq = 0_u64;

        'ticks: while remaining > 0 && self.config.rate > 0 {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break 'ticks,
                _ = ticker.tick() => {}
            }
            let quota = slices.next_quota().min(remaining);
            for _ in 0..quota {
                let unit = self.build(seq);
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break 'ticks,
                    sent = self.output.send(unit) => {
                        if sent.is_err() {
                            debug!(seq, "generator output closed");
                            break 'ticks;
                        }
                    }
                }
                seq += 1;
                remaining -= 1;
                self.state.send_modify(|state| state.emitted = seq);
            }
        }

        self.state.send_modify(|state| state.finished = true);
        let state = *self.state.borrow();
        let stopped_early = remaining > 0;
        info!(emitted = state.emitted, stopped_early, "generation finished");
        state
    }
}
