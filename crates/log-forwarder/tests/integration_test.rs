// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use mockito::{Matcher, Server};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use log_forwarder::config::{DestinationConfig, ForwarderConfig};
use log_forwarder::destination::create_destination;
use log_forwarder::entry::{HostTags, LogEntry, LogLevel};
use log_forwarder::forwarder::Forwarder;

fn tags() -> HostTags {
    HostTags {
        host: "test-host".to_string(),
        application: "app".to_string(),
        environment: "test".to_string(),
    }
}

fn entry(level: LogLevel, message: &str) -> LogEntry {
    LogEntry::new(level, message, "Test", &tags())
}

fn forwarder_config(dir: &tempfile::TempDir) -> ForwarderConfig {
    ForwarderConfig {
        config_path: dir.path().join("destinations.json"),
        poll_interval: Duration::from_millis(50),
        ..ForwarderConfig::default()
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            sleep(Duration::from_millis(50)).await;
        }
    };
    if timeout(Duration::from_secs(5), poll).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

#[tokio::test]
async fn full_batch_is_sent_once_in_enqueue_order() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/events/raw")
        .match_header("Content-Type", "application/vnd.serilog.clef")
        .match_header("X-Seq-ApiKey", "seq-key")
        .match_body(Matcher::Regex(
            "service started[\\s\\S]*m1[\\s\\S]*m2[\\s\\S]*m3".to_string(),
        ))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let forwarder = Forwarder::new(forwarder_config(&dir)).unwrap();
    let mut config = DestinationConfig::seq("seq1", server.url());
    config.api_key = Some("seq-key".to_string());
    // The startup entry plus the three below make exactly one full batch.
    config.batch_size = 4;
    config.batch_timeout = 3600;
    forwarder.add_destination(config).unwrap();

    forwarder.start().await.unwrap();
    let queue = forwarder.queue();
    queue.enqueue(entry(LogLevel::Information, "m1"));
    queue.enqueue(entry(LogLevel::Information, "m2"));
    queue.enqueue(entry(LogLevel::Information, "m3"));

    wait_until("seq batch", || mock.matched()).await;
    mock.assert_async().await;

    wait_until("delivery accounting", || {
        forwarder.destinations_status()[0].sent_count == 4
    })
    .await;
    assert!(forwarder.destinations_status()[0].healthy);

    forwarder.stop().await;
}

#[tokio::test]
async fn partial_batch_flushes_exactly_once_on_timeout() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let forwarder = Forwarder::new(forwarder_config(&dir)).unwrap();
    let mut config = DestinationConfig::webhook("hook1", server.url());
    config.batch_size = 100;
    config.batch_timeout = 1;
    forwarder.add_destination(config).unwrap();

    forwarder.start().await.unwrap();
    forwarder.queue().enqueue(entry(LogLevel::Information, "only one"));

    // Well past the timeout: the partial batch must go out once and only once.
    sleep(Duration::from_millis(2500)).await;
    mock.assert_async().await;

    forwarder.stop().await;
}

#[tokio::test]
async fn unhealthy_destination_does_not_block_healthy_one() {
    let mut broken_server = Server::new_async().await;
    let broken = broken_server
        .mock("POST", "/")
        .with_status(500)
        .with_body("Internal Server Error")
        .expect_at_least(1)
        .create_async()
        .await;
    let mut healthy_server = Server::new_async().await;
    let healthy = healthy_server
        .mock("POST", "/")
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let forwarder = Forwarder::new(forwarder_config(&dir)).unwrap();
    for (name, url) in [("broken", broken_server.url()), ("healthy", healthy_server.url())] {
        let mut config = DestinationConfig::webhook(name, url);
        config.batch_size = 1;
        forwarder.add_destination(config).unwrap();
    }

    forwarder.start().await.unwrap();
    forwarder.queue().enqueue(entry(LogLevel::Error, "boom"));

    wait_until("both destinations", || broken.matched() && healthy.matched()).await;
    wait_until("diverging stats", || {
        forwarder
            .destinations_status()
            .iter()
            .all(|s| s.sent_count >= 1 || s.failed_count >= 1)
    })
    .await;

    let statuses = forwarder.destinations_status();
    let broken_status = statuses.iter().find(|s| s.name == "broken").unwrap();
    let healthy_status = statuses.iter().find(|s| s.name == "healthy").unwrap();

    assert!(!broken_status.healthy);
    assert!(broken_status.failed_count >= 1);
    assert!(broken_status.last_error.as_deref().unwrap().contains("500"));

    assert!(healthy_status.healthy);
    assert!(healthy_status.sent_count >= 1);
    assert!(healthy_status.last_error.is_none());

    forwarder.stop().await;
}

#[tokio::test]
async fn failed_batch_is_delivered_once_and_discarded() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(500)
        .with_body("Internal Server Error")
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let forwarder = Forwarder::new(forwarder_config(&dir)).unwrap();
    // retry_count/retry_delay are declared configuration only: even with an
    // immediate-retry setting the failed batch must go out exactly once.
    let mut config = DestinationConfig::webhook("hook1", server.url());
    config.batch_size = 2;
    config.batch_timeout = 3600;
    config.retry_count = 3;
    config.retry_delay = 0;
    forwarder.add_destination(config).unwrap();

    forwarder.start().await.unwrap();
    forwarder.queue().enqueue(entry(LogLevel::Error, "boom"));

    // Startup entry plus the one above fill the batch; the 500 marks it
    // failed in full.
    wait_until("failure accounting", || {
        forwarder.destinations_status()[0].failed_count == 2
    })
    .await;

    // Give a would-be retry loop time to fire, then pin exactly one POST and
    // no requeue: the counter stays at the batch size.
    sleep(Duration::from_millis(600)).await;
    mock.assert_async().await;
    let statuses = forwarder.destinations_status();
    assert_eq!(statuses[0].failed_count, 2);
    assert_eq!(statuses[0].sent_count, 0);
    assert!(!statuses[0].healthy);

    forwarder.stop().await;
}

#[tokio::test]
async fn full_queue_drops_new_entries_without_blocking() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.log");
    let mut config = forwarder_config(&dir);
    config.queue_capacity = 2;
    let forwarder = Forwarder::new(config).unwrap();

    let mut file_config = DestinationConfig::file("f1", &out);
    file_config.batch_size = 100;
    file_config.batch_timeout = 3600;
    forwarder.add_destination(file_config).unwrap();

    // Three producers race a capacity-2 queue before the dispatcher starts:
    // the third entry is shed, the producer returns immediately, and nothing
    // records the drop.
    let queue = forwarder.queue();
    queue.enqueue(entry(LogLevel::Information, "m1"));
    queue.enqueue(entry(LogLevel::Information, "m2"));
    queue.enqueue(entry(LogLevel::Information, "m3"));

    // The startup entry is shed too: the queue is still full when start runs.
    forwarder.start().await.unwrap();
    sleep(Duration::from_millis(500)).await;
    forwarder.stop().await;

    let raw = std::fs::read_to_string(&out).unwrap();
    let messages: Vec<String> = raw
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).unwrap()["message"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(
        messages,
        vec!["m1", "m2", "Log forwarding service stopping"]
    );
}

#[tokio::test]
async fn min_level_is_declared_but_not_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.log");
    let forwarder = Forwarder::new(forwarder_config(&dir)).unwrap();

    // min_level = Error, but the dispatch path does not filter: the
    // Information entry still reaches the sink. This asserts the current
    // behavior gap on purpose.
    let mut config = DestinationConfig::file("f1", &out);
    config.min_level = Some(LogLevel::Error);
    config.batch_size = 1;
    forwarder.add_destination(config).unwrap();

    forwarder.start().await.unwrap();
    forwarder
        .queue()
        .enqueue(entry(LogLevel::Information, "info-entry"));
    sleep(Duration::from_millis(500)).await;
    forwarder.stop().await;

    let raw = std::fs::read_to_string(&out).unwrap();
    assert!(raw.contains("info-entry"));
}

#[tokio::test]
async fn disabling_mid_run_stops_appends_but_keeps_pending() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.log");
    let forwarder = Forwarder::new(forwarder_config(&dir)).unwrap();

    let mut config = DestinationConfig::file("f1", &out);
    config.batch_size = 100;
    config.batch_timeout = 3600;
    forwarder.add_destination(config.clone()).unwrap();

    forwarder.start().await.unwrap();
    forwarder.queue().enqueue(entry(LogLevel::Information, "before-disable"));
    sleep(Duration::from_millis(300)).await;

    config.enabled = false;
    forwarder.update_destination(config).unwrap();
    forwarder.queue().enqueue(entry(LogLevel::Information, "while-disabled"));
    sleep(Duration::from_millis(300)).await;

    // No auto-flush and no discard on disable: nothing written yet.
    assert!(!out.exists());

    forwarder.stop().await;

    // The final pass delivers what was pending before the disable; the entry
    // enqueued while disabled was never appended.
    let raw = std::fs::read_to_string(&out).unwrap();
    assert!(raw.contains("before-disable"));
    assert!(!raw.contains("while-disabled"));
}

#[tokio::test]
async fn syslog_sends_one_datagram_per_entry() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = socket.local_addr().unwrap().to_string();

    let destination =
        create_destination(DestinationConfig::syslog("sys1", target)).unwrap();
    let batch = vec![
        entry(LogLevel::Error, "disk failure"),
        entry(LogLevel::Information, "recovered"),
    ];
    assert!(destination.send(&batch).await);

    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let first = String::from_utf8_lossy(&buf[..len]).into_owned();
    assert!(first.starts_with("<11>"), "got: {first}");
    assert!(first.contains("Test: disk failure"));

    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let second = String::from_utf8_lossy(&buf[..len]).into_owned();
    assert!(second.starts_with("<14>"), "got: {second}");

    assert_eq!(destination.stats().sent_count(), 2);
}

#[tokio::test]
async fn file_destination_appends_parseable_lines() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("events.log");
    let destination = create_destination(DestinationConfig::file("f1", &out)).unwrap();

    let batch = vec![
        entry(LogLevel::Information, "one"),
        entry(LogLevel::Warning, "two"),
        entry(LogLevel::Error, "three"),
    ];
    assert!(destination.send(&batch).await);

    let raw = std::fs::read_to_string(&out).unwrap();
    assert!(raw.ends_with('\n'));
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 3);
    for (line, expected) in lines.iter().zip(["one", "two", "three"]) {
        let doc: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(doc["message"], expected);
        assert_eq!(doc["source"], "Test");
        assert_eq!(doc["fields"]["Host"], "test-host");
    }
}

#[tokio::test]
async fn loki_pushes_each_entry_individually() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .match_header("Content-Type", "application/json")
        .with_status(204)
        .expect(2)
        .create_async()
        .await;

    let destination = create_destination(DestinationConfig::loki("l1", server.url())).unwrap();
    let batch = vec![
        entry(LogLevel::Information, "a"),
        entry(LogLevel::Information, "b"),
    ];
    assert!(destination.send(&batch).await);
    mock.assert_async().await;
}

#[tokio::test]
async fn elasticsearch_sends_bulk_ndjson_with_basic_auth() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/_bulk")
        .match_header("Content-Type", "application/x-ndjson")
        .match_header("Authorization", Matcher::Regex("Basic .+".to_string()))
        .match_body(Matcher::Regex("\"_index\":\"logs-".to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let mut config = DestinationConfig::elasticsearch("es1", server.url());
    config.username = Some("elastic".to_string());
    config.password = Some("secret".to_string());
    let destination = create_destination(config).unwrap();

    assert!(destination.send(&[entry(LogLevel::Information, "doc")]).await);
    mock.assert_async().await;
}

#[tokio::test]
async fn webhook_sends_bearer_token() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("Authorization", "Bearer hook-key")
        .match_body(Matcher::PartialJson(serde_json::json!({"source": "AutoBot"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let mut config = DestinationConfig::webhook("w1", server.url());
    config.api_key = Some("hook-key".to_string());
    let destination = create_destination(config).unwrap();

    assert!(destination.send(&[entry(LogLevel::Information, "ping")]).await);
    mock.assert_async().await;
}

#[tokio::test]
async fn health_probes_hit_destination_specific_endpoints() {
    let mut server = Server::new_async().await;
    let seq_probe = server
        .mock("GET", "/api")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let es_probe = server
        .mock("GET", "/_cluster/health")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let loki_probe = server
        .mock("GET", "/ready")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let forwarder = Forwarder::new(forwarder_config(&dir)).unwrap();
    forwarder
        .add_destination(DestinationConfig::seq("seq1", server.url()))
        .unwrap();
    forwarder
        .add_destination(DestinationConfig::elasticsearch("es1", server.url()))
        .unwrap();
    forwarder
        .add_destination(DestinationConfig::loki("loki1", server.url()))
        .unwrap();

    let results = forwarder.test_destinations().await;
    assert_eq!(
        results,
        vec![
            ("es1".to_string(), true),
            ("loki1".to_string(), false),
            ("seq1".to_string(), true),
        ]
    );

    seq_probe.assert_async().await;
    es_probe.assert_async().await;
    loki_probe.assert_async().await;

    // The failed probe left its mark on the destination state.
    let statuses = forwarder.destinations_status();
    let loki_status = statuses.iter().find(|s| s.name == "loki1").unwrap();
    assert!(!loki_status.healthy);
    assert!(loki_status.last_error.is_some());
}
