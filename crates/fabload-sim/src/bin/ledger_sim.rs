use std::env;
use std::sync::Arc;

use fabload_sim::LedgerScenario;
use fabload_transport::InMemoryLedger;
use fabload_transport_tcp::LedgerServer;
use tracing::{error, info};

fn parse_arg_u64(args: &[String], key: &str, default: u64) -> u64 {
    args.windows(2)
        .find(|w| w[0] == key)
        .and_then(|w| w[1].parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_arg_str<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == key).map(|w| w[1].as_str())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() {
    let filter = env::var("FABLOAD_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "--help") {
        println!(
            "Usage: cargo run -p fabload-sim --bin ledger_sim -- [--listen ADDR] [--scenario NAME] [--channel NAME] [--block-size N] [--block-timeout-ms N]\n\
             Serves endorser, broadcast and deliver on one address. Scenarios: healthy, flaky_endorsers, rejecting."
        );
        return;
    }

    let listen = parse_arg_str(&args, "--listen").unwrap_or("127.0.0.1:7050");
    let scenario_name = parse_arg_str(&args, "--scenario").unwrap_or("healthy");
    let Some(mut scenario) = LedgerScenario::by_name(scenario_name) else {
        error!(scenario = scenario_name, "unknown scenario");
        std::process::exit(2);
    };
    scenario.max_block_txs = parse_arg_u64(&args, "--block-size", scenario.max_block_txs as u64) as usize;
    scenario.block_timeout_ms = parse_arg_u64(&args, "--block-timeout-ms", scenario.block_timeout_ms);

    let mut options = scenario.options();
    if let Some(channel) = parse_arg_str(&args, "--channel") {
        options = options.with_channel(channel);
    }
    let channel = options.channel_id.clone();

    let ledger = match InMemoryLedger::new(options) {
        Ok(ledger) => ledger,
        Err(err) => {
            error!("failed to start ledger: {err}");
            std::process::exit(1);
        }
    };
    let server = match LedgerServer::bind(listen, Arc::new(ledger)).await {
        Ok(server) => server,
        Err(err) => {
            error!(listen, "failed to bind: {err}");
            std::process::exit(1);
        }
    };
    match server.local_addr() {
        Ok(addr) => info!(%addr, scenario = scenario.name, %channel, "ledger simulator listening"),
        Err(err) => error!("local address unavailable: {err}"),
    }

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("ledger simulator shutting down");
    };
    if let Err(err) = server.run(shutdown).await {
        error!("ledger server failed: {err}");
        std::process::exit(1);
    }
}
