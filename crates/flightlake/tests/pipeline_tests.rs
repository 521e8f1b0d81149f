//! End-to-end pipeline tests against a local TCP source.
//!
//! Covers:
//! - Lines over TCP become one committed micro-batch per interval
//! - Source close ends the run gracefully and promptly
//! - Startup connection failure is fatal
//! - Resume after a crash skips committed batches and continues numbering
//! - A storage failure mid-run is fatal and leaves no checkpoint behind

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use flightlake::{
    Catalog, CheckpointManager, CheckpointState, EngineConfig, EngineError, FileCatalog,
    InMemoryCatalog, IngestError, MicroBatch, Orchestrator, PartitionKey, ShutdownSignal,
    StopReason, TcpLineSource, WriterError,
};

const SCENARIO: [&str; 3] = [
    "2008,0800,1015,AS,100,SEA,ANC",
    "bad-line",
    "2008,0900,1130,AS,101,SEA,JNU",
];

/// Serve `lines` to the first client. The connection stays open until the
/// returned sender is dropped or fired.
async fn serve_lines(lines: &[&str]) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload: String = lines.iter().map(|l| format!("{}\n", l)).collect();
    let (hold_tx, hold_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(payload.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        let _ = hold_rx.await;
    });

    (addr, hold_tx)
}

fn test_config(tmp: &TempDir, addr: SocketAddr, table: &str) -> EngineConfig {
    EngineConfig {
        source_host: addr.ip().to_string(),
        source_port: addr.port(),
        batch_interval: "1s".to_string(),
        checkpoint_dir: tmp.path().join("checkpoint"),
        output_dir: tmp.path().join("out"),
        table_name: table.to_string(),
        catalog_path: tmp.path().join("catalog.json"),
        ..Default::default()
    }
}

fn build(
    cfg: &EngineConfig,
    catalog: Arc<dyn Catalog>,
) -> Orchestrator<TcpLineSource> {
    let checkpoint = CheckpointManager::open(&cfg.checkpoint_dir, cfg.clone()).unwrap();
    let source = TcpLineSource::new(checkpoint.config().source_addr());
    Orchestrator::new(source, catalog, checkpoint, ShutdownSignal::new()).unwrap()
}

fn batch(id: u64, lines: &[&str]) -> MicroBatch {
    MicroBatch::new(id, Utc::now(), lines.iter().map(|s| s.to_string()).collect())
}

fn read_rows(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_scenario_over_tcp() {
    let tmp = TempDir::new().unwrap();
    let (addr, hold) = serve_lines(&SCENARIO).await;
    let cfg = test_config(&tmp, addr, "it-scenario");
    let catalog = Arc::new(InMemoryCatalog::new());

    let mut orch = build(&cfg, catalog.clone()).with_run_duration(Some(Duration::from_millis(1600)));
    let outcome = tokio::time::timeout(Duration::from_secs(10), orch.run())
        .await
        .unwrap()
        .unwrap();
    drop(hold);

    assert_eq!(outcome.reason, StopReason::Timeout);
    assert_eq!(outcome.batches_committed, 1);
    assert_eq!(outcome.last_committed_batch, Some(0));

    // One partition registered, one file with two rows, malformed line dropped
    assert_eq!(catalog.registrations(), 1);
    let partitions = catalog.list_partitions("it-scenario").await.unwrap();
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].key, PartitionKey { year: 2008, month: 1, day: 1 });
    assert_eq!(partitions[0].location, cfg.output_dir.join("2008-01-01"));

    let rows = read_rows(&cfg.output_dir.join("2008-01-01").join("batch-0000000000.txt"));
    assert_eq!(rows, vec!["0800|1015|AS|100|SEA|ANC", "0900|1130|AS|101|SEA|JNU"]);

    let manager = CheckpointManager::open(&cfg.checkpoint_dir, cfg.clone()).unwrap();
    assert_eq!(manager.state(), CheckpointState::Recovering);
    assert_eq!(manager.last_committed_batch(), Some(0));
    assert_eq!(manager.checkpoint().totals.lines_dropped, 1);
    assert_eq!(manager.checkpoint().totals.records_written, 2);
}

#[tokio::test]
async fn test_source_close_stops_within_grace_period() {
    let tmp = TempDir::new().unwrap();
    let (addr, hold) = serve_lines(&SCENARIO[..2]).await;
    let cfg = test_config(&tmp, addr, "it-source-close");

    let mut orch = build(&cfg, Arc::new(InMemoryCatalog::new()));
    let status = orch.status();
    let run = tokio::spawn(async move { orch.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    hold.send(()).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("shutdown should complete promptly")
        .unwrap()
        .unwrap();

    assert_eq!(outcome.reason, StopReason::SourceStopped);
    assert!(outcome.reason.is_graceful());
    // Nothing reached an interval boundary, so nothing was admitted
    assert_eq!(outcome.last_committed_batch, None);
    assert_eq!(outcome.lines_discarded, 2);
    assert!(!status.is_connected());
}

#[tokio::test]
async fn test_connection_failure_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cfg = test_config(&tmp, addr, "it-refused");
    let mut orch = build(&cfg, Arc::new(InMemoryCatalog::new()));

    let result = orch.run().await;
    assert!(matches!(
        result,
        Err(EngineError::Ingest(IngestError::ConnectionFailed { .. }))
    ));
    assert!(!cfg.checkpoint_dir.join("checkpoint.json").exists());
}

#[tokio::test]
async fn test_resume_skips_committed_batches() {
    let tmp = TempDir::new().unwrap();
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let cfg = test_config(&tmp, addr, "it-resume");

    // First process commits batch 0, then "crashes"
    {
        let catalog = Arc::new(FileCatalog::open(&cfg.catalog_path).unwrap());
        let mut orch = build(&cfg, catalog);
        let summary = orch.process_batch(batch(0, &SCENARIO)).await.unwrap().unwrap();
        assert_eq!(summary.records, 2);
    }

    // Restart with a different launch config: the checkpoint's wins
    let launch = EngineConfig {
        checkpoint_dir: cfg.checkpoint_dir.clone(),
        ..Default::default()
    };
    let checkpoint = CheckpointManager::open(&cfg.checkpoint_dir, launch).unwrap();
    assert_eq!(checkpoint.state(), CheckpointState::Recovering);
    assert_eq!(checkpoint.config(), &cfg);
    assert_eq!(checkpoint.next_batch_id(), 1);

    let catalog = Arc::new(FileCatalog::open(&cfg.catalog_path).unwrap());
    assert_eq!(catalog.list_partitions("it-resume").await.unwrap().len(), 1);

    let source = TcpLineSource::new(checkpoint.config().source_addr());
    let mut orch = Orchestrator::new(source, catalog.clone(), checkpoint, ShutdownSignal::new()).unwrap();

    // Replaying batch 0 with different content must not touch its output
    let replay = orch
        .process_batch(batch(0, &["2008-02-02,0100,0200,UA,1,SFO,LAX"]))
        .await
        .unwrap();
    assert!(replay.is_none());
    let rows = read_rows(&cfg.output_dir.join("2008-01-01").join("batch-0000000000.txt"));
    assert_eq!(rows.len(), 2);
    assert!(!cfg.output_dir.join("2008-02-02").exists());

    // Batch 1 is new work
    let batch1 = batch(
        1,
        &[
            "2008-01-01,1200,1400,AS,102,SEA,ANC",
            "2008-01-02,1200,1400,AS,103,SEA,ANC",
        ],
    );
    let summary = orch.process_batch(batch1).await.unwrap().unwrap();
    assert_eq!(summary.partitions, 2);
    // Only the second day is new to the catalog
    assert_eq!(catalog.list_partitions("it-resume").await.unwrap().len(), 2);
    assert!(cfg.output_dir.join("2008-01-01").join("batch-0000000001.txt").exists());
    assert!(cfg.output_dir.join("2008-01-02").join("batch-0000000001.txt").exists());
    assert_eq!(orch.checkpoint().last_committed_batch(), Some(1));
    assert_eq!(orch.checkpoint().checkpoint().totals.batches, 2);
}

#[tokio::test]
async fn test_storage_failure_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let (addr, hold) = serve_lines(&SCENARIO).await;
    let mut cfg = test_config(&tmp, addr, "it-storage-failure");
    cfg.output_dir = tmp.path().join("occupied");
    std::fs::write(&cfg.output_dir, b"not a directory").unwrap();

    let catalog = Arc::new(FileCatalog::open(&cfg.catalog_path).unwrap());
    let mut orch = build(&cfg, catalog);
    let shutdown = orch.shutdown_signal();

    let result = tokio::time::timeout(Duration::from_secs(10), orch.run())
        .await
        .unwrap();
    drop(hold);

    assert!(matches!(result, Err(EngineError::Writer(WriterError::Io(_)))));
    assert!(matches!(shutdown.reason(), Some(StopReason::Fatal(_))));
    assert!(!shutdown.reason().unwrap().is_graceful());

    // Registration preceded the failed write; nothing was committed
    let manager = CheckpointManager::open(&cfg.checkpoint_dir, cfg.clone()).unwrap();
    assert_eq!(manager.state(), CheckpointState::Fresh);
    let reopened = FileCatalog::open(&cfg.catalog_path).unwrap();
    assert_eq!(reopened.list_partitions("it-storage-failure").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_external_shutdown_request() {
    let tmp = TempDir::new().unwrap();
    let (addr, hold) = serve_lines(&[]).await;
    let cfg = test_config(&tmp, addr, "it-signal");

    let mut orch = build(&cfg, Arc::new(InMemoryCatalog::new()));
    let shutdown = orch.shutdown_signal();
    let run = tokio::spawn(async move { orch.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.request(StopReason::Signal);

    let outcome = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    drop(hold);
    // The reader's own stop event arrives after and must not override the reason
    assert_eq!(outcome.reason, StopReason::Signal);
}
