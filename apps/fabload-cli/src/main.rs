mod config;
mod logger;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use fabload_crypto::{Identity, IdentityError};
use fabload_pipeline::{Benchmark, PipelineError, RunSummary, StopHandle};
use fabload_sim::{LedgerScenario, SimError};
use fabload_transport_tcp::TcpConnector;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{load_env_file, FabloadConfig, SetupError};
use crate::logger::StatsFileLayer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Rate-controlled transaction load generator for permissioned ledgers", long_about = None)]
struct Cli {
    /// Number of transactions to generate (unbounded when omitted)
    #[arg(long, default_value_t = u64::MAX)]
    total: u64,
    /// Transactions generated per second
    #[arg(long, visible_alias = "speed")]
    rate: Option<u64>,
    /// Path to configuration file
    #[arg(long, short, visible_alias = "path")]
    config: Option<PathBuf>,
    /// Run against an in-process simulated ledger
    #[arg(long)]
    simulate: bool,
    /// Statistics log file (overrides `stats_log` from the config)
    #[arg(long)]
    stats_log: Option<PathBuf>,
}

impl Cli {
    /// `(total, rate)` when both are usable.
    fn workload(&self) -> Option<(u64, u64)> {
        match self.rate {
            Some(rate) if rate > 0 && self.total > 0 => Some((self.total, rate)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("failed to load identity: {0}")]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

fn init_logging(stats_log: &Path) {
    let filter = EnvFilter::try_from_env("FABLOAD_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info,fabload::stats=off"));
    let (stats_layer, open_error) = StatsFileLayer::open(stats_log);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(filter))
        .with(stats_layer)
        .init();
    if let Some(err) = open_error {
        warn!(path = %stats_log.display(), "stats log unavailable, writing statistics to stdout: {err}");
    }
}

fn spawn_signal_handlers(stop: StopHandle, shutdown: CancellationToken) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("SIGUSR1 handler unavailable: {err}");
                return;
            }
        };
        while usr1.recv().await.is_some() {
            info!("SIGUSR1 received, stopping generation");
            stop.stop();
        }
    });
    #[cfg(not(unix))]
    drop(stop);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling run");
            shutdown.cancel();
        }
    });
}

async fn run(cli: &Cli, config: &FabloadConfig, total: u64, rate: u64) -> Result<RunSummary, CliError> {
    let run_config = config.run_config(total, rate, cli.simulate)?;
    let benchmark = if cli.simulate {
        info!("running against the in-process ledger simulator");
        let (benchmark, _ledger) = fabload_sim::simulated_benchmark(&LedgerScenario::default(), run_config)?;
        benchmark
    } else {
        let identity = Identity::load(&config.identity_config()?)?;
        info!(msp_id = identity.msp_id(), algorithm = ?identity.algorithm(), "identity loaded");
        let connector = Arc::new(TcpConnector::new(config.connect_timeout, config.request_timeout));
        Benchmark::new(run_config, connector, Arc::new(identity))?
    };
    spawn_signal_handlers(benchmark.stop_handle(), benchmark.shutdown_token());
    Ok(benchmark.run().await?)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Some((total, rate)) = cli.workload() else {
        let _ = Cli::command().print_help();
        return;
    };

    let env_file = load_env_file(cli.config.as_deref());
    let config = match FabloadConfig::new(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(err) => {
            init_logging(cli.stats_log.as_deref().unwrap_or(Path::new("static.log")));
            if let Some(outcome) = &env_file {
                outcome.log();
            }
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };
    let stats_log = cli.stats_log.clone().unwrap_or_else(|| config.stats_log.clone());
    init_logging(&stats_log);
    if let Some(outcome) = &env_file {
        outcome.log();
    }

    match run(&cli, &config, total, rate).await {
        Ok(summary) if summary.completed => {
            info!(committed = summary.committed, emitted = summary.emitted, "run complete");
        }
        Ok(summary) => {
            warn!(committed = summary.committed, emitted = summary.emitted, "run cancelled before reconciling");
        }
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }
}
