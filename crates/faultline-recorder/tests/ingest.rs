//! End-to-end scenarios: producers ship over TCP, the recorder loop folds
//! into a real SQLite store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;

use faultline_client::{frame, Client, ClientConfig, ExceptionInfo};
use faultline_recorder::{Recorder, RecorderConfig};
use faultline_store_sqlite::SqliteStore;
use faultline_wire::FrameCodec;

fn quick_config() -> RecorderConfig {
    RecorderConfig {
        bind: "127.0.0.1:0".to_string(),
        flush_interval: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
    }
}

async fn start_recorder(
    config: RecorderConfig,
    store: Arc<SqliteStore>,
) -> (
    String,
    mpsc::Sender<&'static str>,
    JoinHandle<anyhow::Result<String>>,
) {
    let recorder = Recorder::bind(config, store).await.unwrap();
    let addr = recorder.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let handle = tokio::spawn(recorder.run_with_shutdown(shutdown_rx));
    (addr, shutdown_tx, handle)
}

#[tokio::test]
async fn test_single_exception_end_to_end() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let (addr, shutdown, handle) = start_recorder(quick_config(), store.clone()).await;

    let client = Client::new(ClientConfig::remote(addr));
    client
        .capture_exception(
            ExceptionInfo::new("KeyError", "'no_name'")
                .with_frames(vec![frame!("caller_function", { key = "no_name" })]),
        )
        .await
        .unwrap();

    // One poll interval to ingest, one flush interval to commit.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(store.event_count().await.unwrap(), 1);
    let groups = store.recently_seen(20).await.unwrap();
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group.count, 1);
    assert_eq!(group.message, "KeyError: 'no_name'");

    let tags = store.group_tags(group.id).await.unwrap();
    assert!(tags.iter().any(|tag| tag.name == "Hostname"));

    let events = store.latest_events(group.id, 1).await.unwrap();
    let data = store
        .event_data(&events[0].event_id)
        .await
        .unwrap()
        .unwrap();
    let frames = data["frames"].as_array().unwrap();
    assert_eq!(frames.last().unwrap()["function"], "caller_function");

    shutdown.send("SIGTERM").await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), "SIGTERM");
}

#[tokio::test]
async fn test_repeated_exceptions_fold_into_one_group() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let (addr, shutdown, handle) = start_recorder(quick_config(), store.clone()).await;

    let client = Client::new(ClientConfig::remote(addr));
    for wording in ["'a'", "'b'", "'c'"] {
        client
            .capture_exception(ExceptionInfo::new("ValueError", wording))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    let groups = store.recently_seen(20).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].count, 3);
    assert_eq!(store.linked_event_count(groups[0].id).await.unwrap(), 3);

    shutdown.send("SIGINT").await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), "SIGINT");
}

#[tokio::test]
async fn test_shutdown_drains_queued_envelopes() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    // Periodic flushes held off: only the shutdown drain may commit.
    let mut config = quick_config();
    config.flush_interval = Duration::from_secs(3600);
    let (addr, shutdown, handle) = start_recorder(config, store.clone()).await;

    let client = Client::new(ClientConfig::remote(addr));
    for n in 0..100 {
        client
            .capture_exception(ExceptionInfo::new("ValueError", format!("v{n}")))
            .await
            .unwrap();
    }

    // Let the listener move everything into the receive queue.
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.send("SIGTERM").await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), "SIGTERM");

    assert_eq!(store.event_count().await.unwrap(), 100);
    // Identical stacks: one group carrying every event.
    let groups = store.recently_seen(20).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].count, 100);
}

#[tokio::test]
async fn test_undecodable_frame_is_skipped() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let (addr, shutdown, handle) = start_recorder(quick_config(), store.clone()).await;

    let stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let mut framed = FramedWrite::new(stream, FrameCodec);
    framed
        .send(Bytes::from_static(b"definitely not a zlib stream"))
        .await
        .unwrap();

    let envelope = faultline_types::Envelope {
        event_type: "Exception".to_string(),
        event_id: faultline_types::new_event_id(),
        date: chrono::Utc::now().naive_utc(),
        time_spent: None,
        hash: "ab".repeat(16),
        tags: vec![],
        data: serde_json::json!({"type": "IoError", "value": "broken pipe"}),
        extra: serde_json::Map::new(),
    };
    framed
        .send(Bytes::from(faultline_wire::encode(&envelope).unwrap()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.send("SIGUSR1").await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), "SIGUSR1");

    // The garbage frame was logged and dropped; the valid one landed.
    assert_eq!(store.event_count().await.unwrap(), 1);
}
