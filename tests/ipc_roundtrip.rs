use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use veilhub::config::RelayTuning;
use veilhub::domain::{Envelope, Topic};
use veilhub::relay::{Coordinator, RelayHost};
use veilhub::transport::IpcServer;

#[tokio::test]
async fn envelopes_round_trip_over_the_client_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("veilhub.sock");

    let coordinator = Coordinator::from_tuning(&RelayTuning::default()).expect("tuning");
    let (relay, _host) = RelayHost::spawn(coordinator);
    let shutdown = CancellationToken::new();

    let server = IpcServer::bind(&socket_path, relay.clone(), shutdown.clone()).expect("bind");
    tokio::spawn(server.run());

    let stream = UnixStream::connect(&socket_path).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    let mut replies = BufReader::new(read_half).lines();

    // No worker yet: the batch buffers until one attaches.
    let batch = json!({
        "topic": "TEXT_BATCH",
        "correlationId": "req-ipc",
        "data": { "reqId": "req-ipc", "items": [{ "elementId": "el-1", "text": "hi" }] },
    });
    write_half
        .write_all(format!("{batch}\n").as_bytes())
        .await
        .expect("write");

    let mut worker = relay.attach_worker().await.expect("worker attach");
    let forwarded = timeout(Duration::from_secs(2), worker.recv())
        .await
        .expect("flushed envelope")
        .expect("open");
    assert_eq!(forwarded.topic, Topic::TextBatch);
    assert_eq!(forwarded.correlation_id.as_deref(), Some("req-ipc"));
    let origin = forwarded.origin_id.expect("origin attached");

    // The worker relays a decision tagged with the correlation id; it must
    // come back over the same connection.
    worker.forward(
        Envelope::new(Topic::Decisions)
            .with_correlation("req-ipc")
            .with_data(json!({ "results": [], "reqId": "req-ipc" })),
    );

    let line = timeout(Duration::from_secs(2), replies.next_line())
        .await
        .expect("reply line")
        .expect("read")
        .expect("line present");
    let reply: Envelope = serde_json::from_str(&line).expect("envelope shape");
    assert_eq!(reply.topic, Topic::Decisions);
    assert_eq!(reply.correlation_id.as_deref(), Some("req-ipc"));

    // Closing the connection is the disconnect notification; a second batch
    // from a fresh connection gets a different context id.
    drop(write_half);
    drop(replies);

    let stream = UnixStream::connect(&socket_path).await.expect("reconnect");
    let (_read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(format!("{batch}\n").as_bytes())
        .await
        .expect("write");
    let forwarded = timeout(Duration::from_secs(2), worker.recv())
        .await
        .expect("second envelope")
        .expect("open");
    assert_ne!(forwarded.origin_id.expect("origin"), origin);

    shutdown.cancel();
}

#[tokio::test]
async fn invalid_lines_are_logged_and_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("veilhub.sock");

    let coordinator = Coordinator::from_tuning(&RelayTuning::default()).expect("tuning");
    let (relay, _host) = RelayHost::spawn(coordinator);
    let shutdown = CancellationToken::new();
    let server = IpcServer::bind(&socket_path, relay.clone(), shutdown.clone()).expect("bind");
    tokio::spawn(server.run());

    let stream = UnixStream::connect(&socket_path).await.expect("connect");
    let (_read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"not json\n").await.expect("write");

    // The connection survives; a valid envelope after garbage still routes.
    let batch = json!({
        "topic": "TEXT_BATCH",
        "correlationId": "req-after-garbage",
        "data": { "reqId": "req-after-garbage", "items": [] },
    });
    write_half
        .write_all(format!("{batch}\n").as_bytes())
        .await
        .expect("write");

    let mut worker = relay.attach_worker().await.expect("worker attach");
    let forwarded = timeout(Duration::from_secs(2), worker.recv())
        .await
        .expect("envelope")
        .expect("open");
    assert_eq!(forwarded.correlation_id.as_deref(), Some("req-after-garbage"));

    shutdown.cancel();
}
