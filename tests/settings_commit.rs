mod common;

use common::Harness;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use veilhub::config::RelayTuning;
use veilhub::domain::Topic;
use veilhub::settings::{CommitOutcome, CommitRequest, CommitResult, SettingsDocument};

fn commit_request(req_id: &str, timeout_ms: Option<u64>) -> CommitRequest {
    CommitRequest {
        req_id: req_id.to_string(),
        event: "settings-update".to_string(),
        timeout_ms,
        data: serde_json::to_value(SettingsDocument::default().into_outgoing())
            .expect("document serialises"),
    }
}

#[tokio::test]
async fn commit_resolves_on_success_push() {
    let harness = Harness::spawn(RelayTuning::default());
    harness.start_worker().await;

    let relay = harness.relay.clone();
    let upstream = harness.upstream.clone();
    let commit = tokio::spawn(async move {
        relay
            .commit_settings(commit_request("commit-1", Some(5_000)))
            .await
    });

    // Wait for the worker to emit, then push the save confirmation.
    let mut tries = 0;
    while upstream.emits_named("settings-update").is_empty() {
        tries += 1;
        assert!(tries < 100, "settings-update emit never happened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    upstream.push("settings-updated", json!({ "saved": true }));

    let result = commit.await.expect("join").expect("commit result");
    assert!(result.ok);
    assert_eq!(result.outcome, CommitOutcome::Acked);
    assert_eq!(result.data, Some(json!({ "saved": true })));
}

#[tokio::test]
async fn commit_resolves_on_error_push() {
    let harness = Harness::spawn(RelayTuning::default());
    harness.start_worker().await;

    let relay = harness.relay.clone();
    let upstream = harness.upstream.clone();
    let commit = tokio::spawn(async move {
        relay
            .commit_settings(commit_request("commit-2", Some(5_000)))
            .await
    });

    let mut tries = 0;
    while upstream.emits_named("settings-update").is_empty() {
        tries += 1;
        assert!(tries < 100, "settings-update emit never happened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    upstream.push(
        "error",
        json!({ "isError": true, "errorCode": "SV500", "message": "save failed" }),
    );

    let result = commit.await.expect("join").expect("commit result");
    assert!(!result.ok);
    assert_eq!(result.outcome, CommitOutcome::Errored);
    assert_eq!(result.error.as_deref(), Some("save failed"));
}

#[tokio::test]
async fn commit_times_out_and_late_success_is_ignored() {
    let harness = Harness::spawn(RelayTuning::default());
    harness.start_worker().await;

    let started = std::time::Instant::now();
    let result = harness
        .relay
        .commit_settings(commit_request("commit-3", Some(100)))
        .await
        .expect("commit result");
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(!result.ok);
    // The coordinator timer and the worker's own window race at ~100ms;
    // either way the caller sees a timeout-shaped failure.
    assert!(result.error.as_deref().unwrap_or("").starts_with("Timeout"));

    // The success push arrives after the window: silently ignored, and no
    // correlation entry remains to double-resolve.
    harness.upstream.push("settings-updated", json!({ "saved": true }));
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn commit_with_no_worker_fails_fast() {
    let harness = Harness::spawn(RelayTuning::default());

    let started = std::time::Instant::now();
    let result = harness
        .relay
        .commit_settings(commit_request("commit-4", Some(5_000)))
        .await
        .expect("commit result");
    assert!(!result.ok);
    assert_eq!(result.error.as_deref(), Some("Worker not ready"));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "must not wait for the commit window"
    );
}

#[tokio::test]
async fn commit_envelope_from_client_round_trips_as_ack_envelope() {
    let harness = Harness::spawn(RelayTuning::default());
    harness.start_worker().await;

    let mut client = harness.relay.attach_client().await.expect("attach");
    let request = commit_request("commit-5", Some(5_000));
    client.send(
        veilhub::domain::Envelope::new(Topic::SettingsCommit)
            .with_correlation("commit-5")
            .with_data(serde_json::to_value(&request).expect("serialises")),
    );

    let upstream = harness.upstream.clone();
    let mut tries = 0;
    while upstream.emits_named("settings-update").is_empty() {
        tries += 1;
        assert!(tries < 100, "settings-update emit never happened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    upstream.push("setting-updated", json!({ "saved": true }));

    let envelope = timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("reply")
        .expect("open");
    assert_eq!(envelope.topic, Topic::SettingsAck);
    assert_eq!(envelope.correlation_id.as_deref(), Some("commit-5"));
    let result: CommitResult =
        serde_json::from_value(envelope.data.expect("data")).expect("result shape");
    assert!(result.ok);
}

#[tokio::test]
async fn commit_envelope_with_no_worker_gets_error_envelope() {
    let harness = Harness::spawn(RelayTuning::default());

    let mut client = harness.relay.attach_client().await.expect("attach");
    let request = commit_request("commit-6", Some(5_000));
    client.send(
        veilhub::domain::Envelope::new(Topic::SettingsCommit)
            .with_correlation("commit-6")
            .with_data(serde_json::to_value(&request).expect("serialises")),
    );

    let envelope = timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("reply")
        .expect("open");
    assert_eq!(envelope.topic, Topic::SettingsError);
    let result: CommitResult =
        serde_json::from_value(envelope.data.expect("data")).expect("result shape");
    assert_eq!(result.error.as_deref(), Some("Worker not ready"));
}
