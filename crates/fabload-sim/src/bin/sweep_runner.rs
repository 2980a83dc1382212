use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fabload_sim::{run_in_memory, simulated_config, LedgerScenario};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Clone, Serialize)]
struct SweepResult {
    scenario: String,
    rate: u64,
    total: u64,
    emitted: u64,
    endorsed: u64,
    endorse_failed: u64,
    submitted: u64,
    submit_failed: u64,
    committed: u64,
    elapsed_ms: u128,
    committed_tps: f64,
}

#[derive(Debug, Clone, Serialize)]
struct SweepReport {
    generated_at_unix_seconds: u64,
    peers: usize,
    results: Vec<SweepResult>,
}

fn parse_arg_u64(args: &[String], key: &str, default: u64) -> u64 {
    args.windows(2)
        .find(|w| w[0] == key)
        .and_then(|w| w[1].parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_arg_list(args: &[String], key: &str, default: &[u64]) -> Vec<u64> {
    let parsed: Vec<u64> = args
        .windows(2)
        .find(|w| w[0] == key)
        .map(|w| {
            w[1].split(',')
                .filter_map(|s| s.trim().parse::<u64>().ok())
                .filter(|rate| *rate > 0)
                .collect()
        })
        .unwrap_or_default();
    if parsed.is_empty() {
        default.to_vec()
    } else {
        parsed
    }
}

fn parse_arg_path(args: &[String], key: &str, default: &str) -> PathBuf {
    args.windows(2)
        .find(|w| w[0] == key)
        .map(|w| PathBuf::from(&w[1]))
        .unwrap_or_else(|| PathBuf::from(default))
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn write_outputs(output_dir: &Path, report: &SweepReport) -> io::Result<()> {
    fs::create_dir_all(output_dir)?;
    let json = serde_json::to_string_pretty(report).map_err(io::Error::other)?;
    fs::write(output_dir.join("bench_report.json"), json)?;

    let mut csv = String::from(
        "scenario,rate,total,emitted,endorsed,endorse_failed,submitted,submit_failed,committed,elapsed_ms,committed_tps\n",
    );
    for row in &report.results {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{:.3}\n",
            row.scenario,
            row.rate,
            row.total,
            row.emitted,
            row.endorsed,
            row.endorse_failed,
            row.submitted,
            row.submit_failed,
            row.committed,
            row.elapsed_ms,
            row.committed_tps
        ));
    }
    fs::write(output_dir.join("bench_report.csv"), csv)?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let filter = env::var("FABLOAD_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "--help") {
        println!(
            "Usage: cargo run -p fabload-sim --bin sweep_runner -- [--rates 50,100,200] [--seconds N] [--peers N] [--scenario NAME] [--out-dir DIR] [--quick]\n\
             Each rate runs for --seconds worth of transactions against an in-memory ledger."
        );
        return;
    }

    let quick = has_flag(&args, "--quick");
    let default_rates: &[u64] = if quick { &[20, 50] } else { &[50, 100, 200, 400] };
    let rates = parse_arg_list(&args, "--rates", default_rates);
    let seconds = parse_arg_u64(&args, "--seconds", if quick { 1 } else { 3 }).max(1);
    let peers = parse_arg_u64(&args, "--peers", 2).max(1) as usize;
    let out_dir = parse_arg_path(&args, "--out-dir", "target/benchmarks/fabload-sim");
    let scenario = match args.windows(2).find(|w| w[0] == "--scenario") {
        Some(w) => match LedgerScenario::by_name(&w[1]) {
            Some(scenario) => scenario,
            None => {
                error!(scenario = %w[1], "unknown scenario");
                std::process::exit(2);
            }
        },
        None => LedgerScenario::default(),
    };

    let mut results = Vec::with_capacity(rates.len());
    for rate in rates {
        let total = rate.saturating_mul(seconds);
        let summary = match run_in_memory(&scenario, simulated_config(total, rate, peers)).await {
            Ok(summary) => summary,
            Err(err) => {
                error!(rate, "sweep run failed: {err}");
                std::process::exit(1);
            }
        };
        results.push(SweepResult {
            scenario: scenario.name.to_string(),
            rate,
            total,
            emitted: summary.emitted,
            endorsed: summary.endorsement.succeeded,
            endorse_failed: summary.endorsement.failed,
            submitted: summary.submission.succeeded,
            submit_failed: summary.submission.failed,
            committed: summary.committed,
            elapsed_ms: summary.elapsed.as_millis(),
            committed_tps: summary.committed_tps(),
        });
    }

    let report = SweepReport {
        generated_at_unix_seconds: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        peers,
        results,
    };
    if let Err(err) = write_outputs(&out_dir, &report) {
        error!(out_dir = %out_dir.display(), "writing sweep report failed: {err}");
        std::process::exit(1);
    }

    println!("Wrote sweep report:");
    println!("  {}", out_dir.join("bench_report.json").display());
    println!("  {}", out_dir.join("bench_report.csv").display());
    for row in &report.results {
        println!(
            "- rate {}: committed {}/{} at {:.2} tps ({} endorse failures)",
            row.rate, row.committed, row.emitted, row.committed_tps, row.endorse_failed
        );
    }
}
