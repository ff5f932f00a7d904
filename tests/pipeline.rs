//! End-to-end ingestion tests: wire listeners, queues, consumers and the
//! billing engine over a temporary database.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::FixedOffset;
use logbill::billing::{BillingConfigCache, BillingEngine, DayZone, UnmatchedRing};
use logbill::ingest::{
    BatchConsumer, BatchProcessor, RawEvent, SharedSecret, TcpListenerTask, Transport,
    UdpListenerTask, encode_frame,
};
use logbill::registry::Registry;
use logbill::retention::RetentionSweeper;
use logbill::storage::{MatchType, NewBillingConfig};
use logbill::{StorageBuilder, StorageHandles};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const TS: i64 = 1_700_000_000;

// =============================================================================
// Test Helpers
// =============================================================================

struct Pipeline {
    handles: StorageHandles,
    engine: Arc<BillingEngine>,
    tcp_addr: String,
    udp_addr: String,
    udp_dropped: Arc<std::sync::atomic::AtomicU64>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    _dir: TempDir,
}

struct PipelineOptions {
    secret: &'static str,
    queue: usize,
    flush_size: usize,
    flush_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            secret: "",
            queue: 1000,
            flush_size: 50,
            flush_interval: Duration::from_millis(20),
        }
    }
}

async fn start_pipeline(options: PipelineOptions) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let handles = StorageBuilder::from_path(dir.path().join("pipeline.db"))
        .build()
        .await
        .expect("Failed to build storage");

    let cache = Arc::new(BillingConfigCache::new(
        handles.billing.clone(),
        Duration::from_secs(60),
    ));
    let engine = Arc::new(
        BillingEngine::new(
            handles.ingest.clone(),
            cache,
            Registry::tags(handles.registry.clone()),
            Registry::rule_names(handles.registry.clone()),
            Arc::new(UnmatchedRing::new(100)),
        )
        .with_zone(DayZone::Fixed(FixedOffset::east_opt(0).unwrap())),
    );

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let processor: Arc<dyn BatchProcessor> = engine.clone();

    let (tcp_tx, tcp_rx) = mpsc::channel(options.queue);
    let tcp = TcpListenerTask::bind(
        "127.0.0.1:0",
        tcp_tx,
        SharedSecret::new(options.secret),
        cancel.clone(),
    )
    .await
    .unwrap();
    let tcp_addr = tcp.local_addr().unwrap().to_string();
    tasks.spawn(tcp.run());
    tasks.spawn(
        BatchConsumer::new(
            Transport::Tcp,
            tcp_rx,
            Arc::clone(&processor),
            options.flush_size,
            options.flush_interval,
            cancel.clone(),
        )
        .run(),
    );

    let (udp_tx, udp_rx) = mpsc::channel(options.queue);
    let udp = UdpListenerTask::bind(
        "127.0.0.1:0",
        udp_tx,
        SharedSecret::new(options.secret),
        cancel.clone(),
    )
    .await
    .unwrap();
    let udp_addr = udp.local_addr().unwrap().to_string();
    let udp_dropped = udp.dropped_counter();
    tasks.spawn(udp.run());
    tasks.spawn(
        BatchConsumer::new(
            Transport::Udp,
            udp_rx,
            processor,
            options.flush_size,
            options.flush_interval,
            cancel.clone(),
        )
        .run(),
    );

    Pipeline {
        handles,
        engine,
        tcp_addr,
        udp_addr,
        udp_dropped,
        cancel,
        tasks,
        _dir: dir,
    }
}

impl Pipeline {
    async fn shutdown(mut self) -> StorageHandles {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            joined.unwrap();
        }
        self.handles
    }

    async fn bill_tag(&self, tag: &str, match_type: MatchType, value: &str, price: f64) {
        self.handles
            .billing
            .assign_tag_project(tag, Some("billing"))
            .await
            .unwrap();
        self.handles
            .billing
            .create_config(&NewBillingConfig {
                bill_key: "bk".to_string(),
                billing_tag: tag.to_string(),
                match_type,
                match_value: value.to_string(),
                unit_price: price,
                description: String::new(),
            })
            .await
            .unwrap();
        self.engine.index().invalidate();
    }
}

async fn send_frames(addr: &str, payloads: &[serde_json::Value]) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    for payload in payloads {
        let frame = encode_frame(payload.to_string().as_bytes()).unwrap();
        stream.write_all(&frame).await.unwrap();
    }
    stream.flush().await.unwrap();
    stream
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn event(tag: &str, rule: &str, line: &str) -> serde_json::Value {
    json!({"timestamp": TS, "tag": tag, "rule_name": rule, "log_line": line})
}

// =============================================================================
// TCP Scenarios
// =============================================================================

#[tokio::test]
async fn test_tcp_billable_event_aggregated() {
    let pipeline = start_pipeline(PipelineOptions::default()).await;
    pipeline
        .bill_tag("billing-x", MatchType::Tag, "billing-x", 0.01)
        .await;

    let _stream = send_frames(
        &pipeline.tcp_addr,
        &[event("billing-x", "r1", "hit"), event("billing-x", "r1", "hit")],
    )
    .await;

    let ingest = pipeline.handles.ingest.clone();
    assert!(
        eventually(|| {
            let ingest = ingest.clone();
            async move {
                matches!(
                    ingest.billing_totals("2023-11-14", "bk", "billing-x").await,
                    Ok(Some(t)) if t.count == 2
                )
            }
        })
        .await
    );

    let handles = pipeline.shutdown().await;
    let totals = handles
        .ingest
        .billing_totals("2023-11-14", "bk", "billing-x")
        .await
        .unwrap()
        .unwrap();
    assert!((totals.amount - 0.02).abs() < 1e-9);
    assert_eq!(handles.ingest.count_live_logs(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_tcp_batch_frame_becomes_log_entries() {
    let pipeline = start_pipeline(PipelineOptions::default()).await;

    let batch = json!({"logs": [event("ops", "r1", "a"), event("ops, dev", "r2", "b")]});
    let _stream = send_frames(&pipeline.tcp_addr, &[batch]).await;

    let ingest = pipeline.handles.ingest.clone();
    assert!(
        eventually(|| {
            let ingest = ingest.clone();
            async move { ingest.count_live_logs(None).await.unwrap_or(0) == 2 }
        })
        .await
    );

    let handles = pipeline.shutdown().await;
    assert_eq!(handles.ingest.tag_log_count("ops").await.unwrap(), 2);
    assert_eq!(handles.ingest.tag_log_count("dev").await.unwrap(), 1);
    assert_eq!(handles.ingest.count_billing_entries().await.unwrap(), 0);
}

#[tokio::test]
async fn test_tcp_unmatched_billable_event() {
    let pipeline = start_pipeline(PipelineOptions::default()).await;
    pipeline
        .bill_tag("billing-x", MatchType::LogLineContains, "never", 1.0)
        .await;

    let _stream = send_frames(&pipeline.tcp_addr, &[event("billing-x", "r9", "hit")]).await;

    let engine = Arc::clone(&pipeline.engine);
    assert!(
        eventually(|| {
            let engine = Arc::clone(&engine);
            async move { engine.unmatched().len() == 1 }
        })
        .await
    );

    let item = &pipeline.engine.unmatched().snapshot(10)[0];
    assert_eq!((item.tag.as_str(), item.rule_name.as_str()), ("billing-x", "r9"));
    let handles = pipeline.shutdown().await;
    assert_eq!(handles.ingest.count_live_logs(None).await.unwrap(), 0);
    assert_eq!(handles.ingest.count_billing_entries().await.unwrap(), 0);
}

#[tokio::test]
async fn test_tcp_secret_rejects_event() {
    let pipeline = start_pipeline(PipelineOptions {
        secret: "s3cret",
        ..Default::default()
    })
    .await;

    let mut good = event("ops", "r", "good");
    good["secret"] = json!("s3cret");
    let mut bad = event("ops", "r", "bad");
    bad["secret"] = json!("wrong");
    let _stream = send_frames(&pipeline.tcp_addr, &[bad, good]).await;

    let ingest = pipeline.handles.ingest.clone();
    assert!(
        eventually(|| {
            let ingest = ingest.clone();
            async move { ingest.count_live_logs(None).await.unwrap_or(0) == 1 }
        })
        .await
    );
    let handles = pipeline.shutdown().await;
    assert_eq!(handles.ingest.count_live_logs(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_shutdown_flushes_buffered_events() {
    let pipeline = start_pipeline(PipelineOptions {
        flush_size: 1000,
        flush_interval: Duration::from_secs(60),
        ..Default::default()
    })
    .await;

    let frames: Vec<_> = (0..3).map(|i| event("ops", "r", &format!("line {i}"))).collect();
    let stream = send_frames(&pipeline.tcp_addr, &frames).await;
    // Let the connection handler enqueue before cancelling.
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(stream);

    let ingest = pipeline.handles.ingest.clone();
    assert_eq!(ingest.count_live_logs(None).await.unwrap(), 0);

    let handles = pipeline.shutdown().await;
    assert_eq!(handles.ingest.count_live_logs(None).await.unwrap(), 3);
}

// =============================================================================
// UDP Scenarios
// =============================================================================

#[tokio::test]
async fn test_udp_datagrams_ingested() {
    let pipeline = start_pipeline(PipelineOptions::default()).await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    socket
        .send_to(event("ops", "r", "one").to_string().as_bytes(), &pipeline.udp_addr)
        .await
        .unwrap();
    socket
        .send_to(
            json!({"logs": [event("ops", "r", "two"), event("ops", "r", "three")]})
                .to_string()
                .as_bytes(),
            &pipeline.udp_addr,
        )
        .await
        .unwrap();
    socket
        .send_to(b"not json", &pipeline.udp_addr)
        .await
        .unwrap();

    let ingest = pipeline.handles.ingest.clone();
    assert!(
        eventually(|| {
            let ingest = ingest.clone();
            async move { ingest.count_live_logs(Some("ops")).await.unwrap_or(0) == 3 }
        })
        .await
    );
    assert_eq!(pipeline.udp_dropped.load(Ordering::Relaxed), 0);
    pipeline.shutdown().await;
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_concurrent_batches_sum_exactly() {
    let pipeline = start_pipeline(PipelineOptions::default()).await;
    pipeline
        .bill_tag("billing-x", MatchType::Tag, "billing-x", 0.5)
        .await;

    let mut workers = JoinSet::new();
    for _ in 0..8 {
        let engine = Arc::clone(&pipeline.engine);
        workers.spawn(async move {
            let events: Vec<RawEvent> = (0..25)
                .map(|_| {
                    serde_json::from_value(event("billing-x", "r1", "hit")).unwrap()
                })
                .collect();
            engine.process_batch(events).await.unwrap()
        });
    }
    while let Some(outcome) = workers.join_next().await {
        assert_eq!(outcome.unwrap().succeeded, 25);
    }

    let totals = pipeline
        .handles
        .ingest
        .billing_totals("2023-11-14", "bk", "billing-x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(totals.count, 200);
    assert!((totals.amount - 100.0).abs() < 1e-9);
    pipeline.shutdown().await;
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test]
async fn test_retention_keeps_aggregates_and_rebalances_tag_counts() {
    let pipeline = start_pipeline(PipelineOptions::default()).await;
    pipeline
        .bill_tag("billing-x", MatchType::Tag, "billing-x", 1.0)
        .await;

    let events: Vec<RawEvent> = [
        event("ops", "r", "old"),
        event("billing-x", "r", "billed"),
        json!({"timestamp": chrono::Utc::now().timestamp(), "tag": "ops", "log_line": "fresh"}),
    ]
    .into_iter()
    .map(|v| serde_json::from_value(v).unwrap())
    .collect();
    pipeline.engine.process_batch(events).await.unwrap();
    assert_eq!(pipeline.handles.ingest.tag_log_count("ops").await.unwrap(), 2);

    let report = RetentionSweeper::new(pipeline.handles.retention.clone(), 30)
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.logs_deleted, 1);

    let handles = pipeline.shutdown().await;
    assert_eq!(handles.ingest.tag_log_count("ops").await.unwrap(), 1);
    assert_eq!(handles.ingest.count_live_logs(None).await.unwrap(), 1);
    assert_eq!(handles.ingest.count_billing_entries().await.unwrap(), 1);
}
