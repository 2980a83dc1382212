use std::time::Duration;

use fabload_sim::scenarios::{FLAKY_ENDORSERS, HEALTHY, REJECTING};
use fabload_sim::{run_in_memory, simulated_benchmark, simulated_config};

#[tokio::test(start_paused = true)]
async fn healthy_ledger_commits_everything() {
    let summary = run_in_memory(&HEALTHY, simulated_config(120, 60, 2))
        .await
        .expect("healthy run should reconcile");
    assert!(summary.completed);
    assert_eq!(summary.emitted, 120);
    assert_eq!(summary.endorsement.succeeded, 120);
    assert_eq!(summary.submission.succeeded, 120);
    assert_eq!(summary.committed, 120);
    assert_eq!(summary.dropped(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejecting_endorsers_drop_every_unit() {
    let summary = run_in_memory(&REJECTING, simulated_config(100, 100, 2))
        .await
        .expect("a fully rejected run still reconciles");
    assert!(summary.completed);
    assert_eq!(summary.endorsement.failed, 100);
    assert_eq!(summary.submission.attempted, 0);
    assert_eq!(summary.committed, 0);
}

#[tokio::test(start_paused = true)]
async fn flaky_endorsers_are_reconciled_by_failures() {
    let summary = run_in_memory(&FLAKY_ENDORSERS, simulated_config(200, 100, 3))
        .await
        .expect("flaky run should reconcile");
    assert!(summary.completed);
    assert!(summary.endorsement.failed > 0, "injected failures should be counted");
    assert_eq!(summary.committed + summary.dropped(), 200);
}

#[tokio::test(start_paused = true)]
async fn ledger_height_tracks_committed_blocks() {
    let mut config = simulated_config(30, 30, 1);
    config.connections = 2;
    let (benchmark, ledger) = simulated_benchmark(&HEALTHY, config).expect("benchmark should build");
    let summary = benchmark.run().await.expect("run should reconcile");
    assert_eq!(ledger.committed_txs(), summary.committed);
    assert!(ledger.height() >= 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ledger.committed_txs(), 30, "nothing is committed after reconciliation");
}
