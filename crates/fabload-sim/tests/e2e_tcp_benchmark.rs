use std::sync::Arc;
use std::time::Duration;

use fabload_core::Endpoint;
use fabload_crypto::{Identity, SigningAlgorithm};
use fabload_pipeline::{Benchmark, RunConfig};
use fabload_sim::scenarios::HEALTHY;
use fabload_transport::InMemoryLedger;
use fabload_transport_tcp::{LedgerServer, TcpConnector};
use tokio::sync::oneshot;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn benchmark_runs_end_to_end_over_tcp() {
    let ledger = Arc::new(InMemoryLedger::new(HEALTHY.options()).expect("ledger should start"));
    let server = LedgerServer::bind("127.0.0.1:0", ledger.clone())
        .await
        .expect("server should bind");
    let addr = server.local_addr().expect("bound address").to_string();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run(async move {
        let _ = stop_rx.await;
    }));

    let mut config = RunConfig::new(
        40,
        40,
        vec![
            Endpoint::new(addr.clone(), "peer0"),
            Endpoint::new(addr.clone(), "peer1"),
        ],
        Endpoint::new(addr.clone(), "orderer0"),
    );
    config.channel = ledger.options().channel_id.clone();
    config.report_interval = Duration::from_millis(250);

    let signer = Arc::new(Identity::ephemeral("Org1MSP", SigningAlgorithm::Ed25519).expect("identity"));
    let connector = Arc::new(TcpConnector::new(Duration::from_secs(2), Duration::from_secs(2)));
    let benchmark = Benchmark::new(config, connector, signer).expect("config should validate");

    let summary = tokio::time::timeout(Duration::from_secs(20), benchmark.run())
        .await
        .expect("run should finish")
        .expect("run should reconcile");
    assert!(summary.completed);
    assert_eq!(summary.emitted, 40);
    assert_eq!(summary.committed, 40);
    assert_eq!(ledger.committed_txs(), 40);

    let _ = stop_tx.send(());
    server_task
        .await
        .expect("server task should join")
        .expect("server should stop cleanly");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_orderer_fails_at_startup() {
    let ledger = Arc::new(InMemoryLedger::new(HEALTHY.options()).expect("ledger should start"));
    let server = LedgerServer::bind("127.0.0.1:0", ledger)
        .await
        .expect("server should bind");
    let addr = server.local_addr().expect("bound address").to_string();
    let server_task = tokio::spawn(server.run(std::future::pending::<()>()));

    let mut config = RunConfig::new(
        10,
        10,
        vec![Endpoint::new(addr.clone(), "peer0")],
        Endpoint::new("127.0.0.1:1", "orderer0"),
    );
    config.observer = Some(Endpoint::new(addr, "peer0"));
    config.channel = "mychannel".to_string();

    let signer = Arc::new(Identity::ephemeral("Org1MSP", SigningAlgorithm::Ecdsa).expect("identity"));
    let connector = Arc::new(TcpConnector::new(Duration::from_millis(500), Duration::from_millis(500)));
    let err = Benchmark::new(config, connector, signer)
        .expect("config should validate")
        .run()
        .await
        .expect_err("connecting to a closed port must fail");
    assert_eq!(err.stage(), Some(fabload_pipeline::Stage::Submission));

    server_task.abort();
}
