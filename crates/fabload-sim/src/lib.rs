//! Simulation helpers for fabload: canned ledger scenarios and one-call
//! in-memory benchmark runs.

pub mod scenarios;

use std::sync::Arc;

use fabload_core::Endpoint;
use fabload_crypto::{Identity, IdentityError, SigningAlgorithm};
use fabload_pipeline::{Benchmark, PipelineError, RunConfig, RunSummary};
use fabload_transport::{InMemoryLedger, TransportError};
use thiserror::Error;

pub use scenarios::LedgerScenario;

/// MSP id of the throwaway identities used in simulated runs.
pub const SIM_MSP_ID: &str = "SimOrgMSP";

#[derive(Debug, Error)]
pub enum SimError {
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("ledger error: {0}")]
    Ledger(#[from] TransportError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Endpoints of the simulated peers: `peer0.sim:7051`, `peer1.sim:7051`, ...
pub fn simulated_peers(count: usize) -> Vec<Endpoint> {
    (0..count)
        .map(|index| Endpoint::new(format!("peer{index}.sim:7051"), format!("peer{index}")))
        .collect()
}

pub fn simulated_orderer() -> Endpoint {
    Endpoint::new("orderer0.sim:7050", "orderer0")
}

/// Run configuration against `peers` simulated endorsers.
pub fn simulated_config(total: u64, rate: u64, peers: usize) -> RunConfig {
    RunConfig::new(total, rate, simulated_peers(peers.max(1)), simulated_orderer())
}

/// Builds a ledger for `scenario` and a benchmark against it. Must be called
/// inside a tokio runtime.
pub fn simulated_benchmark(
    scenario: &LedgerScenario,
    mut config: RunConfig,
) -> Result<(Benchmark, Arc<InMemoryLedger>), SimError> {
    let options = scenario.options();
    config.channel = options.channel_id.clone();
    let ledger = Arc::new(InMemoryLedger::new(options)?);
    let signer = Arc::new(Identity::ephemeral(SIM_MSP_ID, SigningAlgorithm::Ecdsa)?);
    let benchmark = Benchmark::new(config, ledger.clone(), signer)?;
    Ok((benchmark, ledger))
}

/// Runs one benchmark to completion against a fresh simulated ledger.
pub async fn run_in_memory(scenario: &LedgerScenario, config: RunConfig) -> Result<RunSummary, SimError> {
    let (benchmark, _ledger) = simulated_benchmark(scenario, config)?;
    Ok(benchmark.run().await?)
}
