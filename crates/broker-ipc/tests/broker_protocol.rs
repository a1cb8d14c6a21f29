//! End-to-end protocol tests over a real Unix socket.

use broker_backends::{BlobRef, BlobStore, MemoryBlobStore};
use broker_ipc::{Broker, BrokerClient, BrokerOptions, BrokerServer, IpcError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stream_store::{StorePolicy, StreamStore};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use wire_protocol_types::{EnvelopeDraft, ErrorCode, ServerFrame};

struct Harness {
    _dir: TempDir,
    socket: PathBuf,
    server: Arc<BrokerServer>,
    task: tokio::task::JoinHandle<broker_ipc::IpcResult<()>>,
}

impl Harness {
    async fn start(broker: Broker) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("broker.sock");
        let server = Arc::new(
            BrokerServer::new(&socket, Arc::new(broker))
                .with_sweep_interval(Duration::from_millis(20)),
        );
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        for _ in 0..200 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Self {
            _dir: dir,
            socket,
            server,
            task,
        }
    }

    async fn client(&self) -> BrokerClient {
        let mut client = BrokerClient::connect_unix(&self.socket).await.unwrap();
        client.hello().await.unwrap();
        client
    }

    async fn stop(self) {
        self.server.shutdown();
        self.task.await.unwrap().unwrap();
    }
}

fn default_broker() -> Broker {
    Broker::new(StreamStore::default(), BrokerOptions::default())
}

/// Wait until `stream` reaches the given depth and inflight counts.
async fn wait_for(client: &mut BrokerClient, stream: &str, depth: usize, inflight: usize) {
    for _ in 0..200 {
        let stats = client.stats(stream).await.unwrap();
        if stats.depth == depth && stats.inflight == inflight {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("stream {} never reached depth={} inflight={}", stream, depth, inflight);
}

#[tokio::test]
async fn raw_socket_handshake_gate_and_partial_frames() {
    let harness = Harness::start(default_broker()).await;
    let stream = UnixStream::connect(&harness.socket).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"{\"type\":\"enqueue\",\"reqId\":\"1\",\"to\":\"s\",\"env\":{}}\n")
        .await
        .unwrap();
    let frame = ServerFrame::from_json(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(matches!(frame, ServerFrame::Error { code: ErrorCode::NotReady, .. }));

    // Unknown types are reported even before the handshake
    write_half
        .write_all(b"{\"type\":\"teleport\",\"reqId\":\"2\"}\n")
        .await
        .unwrap();
    match ServerFrame::from_json(&lines.next_line().await.unwrap().unwrap()).unwrap() {
        ServerFrame::Error {
            req_id,
            code,
            detail,
        } => {
            assert_eq!(req_id.as_deref(), Some("2"));
            assert_eq!(code, ErrorCode::Unsupported);
            assert_eq!(detail, "teleport");
        }
        other => panic!("unexpected: {:?}", other),
    }

    // Two records, split mid-record across writes
    write_half.write_all(b"{\"type\":\"hello\",\"re").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    write_half
        .write_all(b"qId\":\"3\"}\n{\"type\":\"metrics\",\"reqId\":\"4\"}\n")
        .await
        .unwrap();

    let hello = ServerFrame::from_json(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(matches!(&hello, ServerFrame::Ok { req_id: Some(id), .. } if id == "3"));
    let metrics = ServerFrame::from_json(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(matches!(&metrics, ServerFrame::Ok { req_id: Some(id), .. } if id == "4"));

    drop(write_half);
    harness.stop().await;
}

#[tokio::test]
async fn produce_consume_ack() {
    let harness = Harness::start(default_broker()).await;
    let mut producer = harness.client().await;
    let mut consumer = harness.client().await;

    for n in 0..3 {
        producer
            .enqueue("orders", serde_json::json!({ "n": n }))
            .await
            .unwrap();
    }

    let subscribed = consumer.subscribe("orders").await.unwrap();
    assert_eq!(subscribed["stream"], "orders");
    consumer.grant(3).await.unwrap();

    for n in 0..3 {
        let env = consumer.next_delivery().await.unwrap();
        assert_eq!(env.payload["n"], n);
        consumer.ack(&env.id).await.unwrap();
    }

    wait_for(&mut producer, "orders", 0, 0).await;
    let stats = producer.stats("orders").await.unwrap();
    assert_eq!(stats.rate_in, 3);
    assert_eq!(stats.rate_out, 3);
    assert!(stats.lat_p50.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn redelivery_after_consumer_disconnect() {
    let harness = Harness::start(default_broker()).await;
    let mut producer = harness.client().await;
    producer
        .enqueue_draft("jobs", EnvelopeDraft::new(serde_json::json!("work")).with_id("job-1"), None)
        .await
        .unwrap();

    let mut first = harness.client().await;
    first.subscribe("jobs").await.unwrap();
    first.grant(1).await.unwrap();
    assert_eq!(first.next_delivery().await.unwrap().id, "job-1");
    wait_for(&mut producer, "jobs", 0, 1).await;

    // Disconnect without acking
    drop(first);
    wait_for(&mut producer, "jobs", 1, 0).await;

    let mut second = harness.client().await;
    second.subscribe("jobs").await.unwrap();
    second.grant(1).await.unwrap();
    let env = second.next_delivery().await.unwrap();
    assert_eq!(env.id, "job-1");
    assert_eq!(env.payload, "work");
    second.ack("job-1").await.unwrap();
    wait_for(&mut producer, "jobs", 0, 0).await;

    harness.stop().await;
}

#[tokio::test]
async fn nack_redelivers_before_later_envelopes() {
    let harness = Harness::start(default_broker()).await;
    let mut client = harness.client().await;
    for id in ["a", "b"] {
        client
            .enqueue_draft("s", EnvelopeDraft::new(serde_json::json!(id)).with_id(id), None)
            .await
            .unwrap();
    }
    client.subscribe("s").await.unwrap();
    client.grant(1).await.unwrap();
    assert_eq!(client.next_delivery().await.unwrap().id, "a");

    client.nack("a").await.unwrap();
    client.grant(1).await.unwrap();
    assert_eq!(client.next_delivery().await.unwrap().id, "a");

    harness.stop().await;
}

#[tokio::test]
async fn ack_timeout_requeues_via_sweeper() {
    let policy = StorePolicy {
        ack_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let harness = Harness::start(Broker::new(StreamStore::new(policy), BrokerOptions::default())).await;
    let mut client = harness.client().await;
    client.enqueue("slow", serde_json::json!(1)).await.unwrap();
    client.subscribe("slow").await.unwrap();
    client.grant(2).await.unwrap();

    let first = client.next_delivery().await.unwrap();
    let again = tokio::time::timeout(Duration::from_secs(5), client.next_delivery())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, again.id);

    harness.stop().await;
}

#[tokio::test]
async fn idempotent_enqueue_is_replayed() {
    let harness = Harness::start(default_broker()).await;
    let mut client = harness.client().await;

    let draft = EnvelopeDraft::new(serde_json::json!({ "charge": 10 }));
    let first = client
        .enqueue_idempotent("payments", draft.clone(), "charge-42")
        .await
        .unwrap();
    let second = client
        .enqueue_idempotent("payments", draft, "charge-42")
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(client.stats("payments").await.unwrap().depth, 1);

    harness.stop().await;
}

#[tokio::test]
async fn large_payload_is_offloaded_to_blob_store() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let broker = Broker::new(
        StreamStore::default(),
        BrokerOptions {
            blob_offload_bytes: Some(128),
            ..Default::default()
        },
    )
    .with_blob_store(blobs.clone());
    let harness = Harness::start(broker).await;
    let mut client = harness.client().await;

    let body = "x".repeat(1024);
    client
        .enqueue("media", serde_json::json!({ "body": body }))
        .await
        .unwrap();
    client.subscribe("media").await.unwrap();
    client.grant(1).await.unwrap();

    let env = client.next_delivery().await.unwrap();
    let blob = BlobRef::from_marker(&env.payload).expect("payload replaced by blob marker");
    let bytes = blobs.fetch(&blob.blob_id).await.unwrap();
    let original: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(original["body"], body);

    harness.stop().await;
}

#[tokio::test]
async fn offload_failure_reports_backend_unavailable() {
    let blobs = Arc::new(MemoryBlobStore::new());
    blobs.set_available(false);
    let broker = Broker::new(
        StreamStore::default(),
        BrokerOptions {
            blob_offload_bytes: Some(8),
            ..Default::default()
        },
    )
    .with_blob_store(blobs);
    let harness = Harness::start(broker).await;
    let mut client = harness.client().await;

    let err = client
        .enqueue("media", serde_json::json!("a payload larger than eight bytes"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::BackendUnavailable));
    assert!(matches!(client.stats("media").await, Err(IpcError::Broker { code: ErrorCode::NotFound, .. })));

    harness.stop().await;
}

#[tokio::test]
async fn snapshot_and_metrics_cover_all_streams() {
    let harness = Harness::start(default_broker()).await;
    let mut client = harness.client().await;
    client.enqueue("zeta", serde_json::json!(1)).await.unwrap();
    client.enqueue("alpha", serde_json::json!(2)).await.unwrap();
    client.enqueue("alpha", serde_json::json!(3)).await.unwrap();

    let rows = client.snapshot().await.unwrap();
    let names: Vec<_> = rows.iter().map(|r| r.stream.as_str()).collect();
    assert_eq!(names, ["alpha", "zeta"]);
    assert_eq!(rows[0].pending.len(), 2);

    let metrics = client.metrics().await.unwrap();
    assert_eq!(metrics.totals.streams, 2);
    assert_eq!(metrics.totals.depth, 3);

    harness.stop().await;
}
