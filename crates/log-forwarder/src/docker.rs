// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Container log streaming against the Docker Engine HTTP API.
//!
//! One supervised task per matched container follows the container's combined
//! stdout/stderr, demuxes Docker's 8-byte stream framing, strips the leading
//! RFC 3339 timestamp Docker prepends, classifies the level by keyword scan
//! and enqueues the line. A task exits when its stream ends or the forwarder
//! is cancelled.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entry::{HostTags, LogEntry, LogLevel};
use crate::forwarder::QueueHandle;

/// Containers whose name carries one of these are streamed even without the
/// product name prefix.
const INFRA_KEYWORDS: &[&str] = &[
    "postgres",
    "redis",
    "nginx",
    "rabbitmq",
    "elasticsearch",
    "minio",
    "traefik",
];

fn timestamp_prefix() -> &'static Regex {
    static TIMESTAMP_PREFIX: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    TIMESTAMP_PREFIX.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\S+\s+").expect("static regex must compile")
    })
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
}

#[derive(Debug, Clone)]
struct MatchedContainer {
    id: String,
    name: String,
    image: String,
}

/// Discovers matching containers once and supervises one streaming task per
/// match.
pub struct ContainerCollector {
    endpoint: String,
    name_prefix: String,
    client: reqwest::Client,
    queue: QueueHandle,
    tags: Arc<HostTags>,
    cancel: CancellationToken,
}

impl ContainerCollector {
    pub fn new(
        endpoint: String,
        name_prefix: String,
        queue: QueueHandle,
        tags: Arc<HostTags>,
        cancel: CancellationToken,
    ) -> Self {
        let endpoint = endpoint
            .replace("tcp://", "http://")
            .trim_end_matches('/')
            .to_string();
        ContainerCollector {
            endpoint,
            name_prefix,
            // No request timeout: the log stream follows indefinitely.
            client: reqwest::Client::new(),
            queue,
            tags,
            cancel,
        }
    }

    pub async fn run(self) {
        let containers = tokio::select! {
            result = self.list_containers() => match result {
                Ok(containers) => containers,
                Err(error) => {
                    warn!("container discovery failed: {error}");
                    return;
                }
            },
            () = self.cancel.cancelled() => return,
        };

        let matched: Vec<MatchedContainer> = containers
            .into_iter()
            .filter_map(|summary| self.matched(summary))
            .collect();
        debug!("streaming logs from {} containers", matched.len());

        let mut tasks = Vec::with_capacity(matched.len());
        for container in matched {
            tasks.push(tokio::spawn(stream_container(
                self.client.clone(),
                self.endpoint.clone(),
                container,
                self.queue.clone(),
                Arc::clone(&self.tags),
                self.cancel.clone(),
            )));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, reqwest::Error> {
        self.client
            .get(format!("{}/containers/json", self.endpoint))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    fn matched(&self, summary: ContainerSummary) -> Option<MatchedContainer> {
        let name = summary
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())?;
        if !matches_name(&name, &self.name_prefix) {
            return None;
        }
        Some(MatchedContainer {
            id: summary.id,
            name,
            image: summary.image,
        })
    }
}

fn matches_name(name: &str, prefix: &str) -> bool {
    let lower = name.to_lowercase();
    lower.starts_with(&prefix.to_lowercase())
        || INFRA_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

async fn stream_container(
    client: reqwest::Client,
    endpoint: String,
    container: MatchedContainer,
    queue: QueueHandle,
    tags: Arc<HostTags>,
    cancel: CancellationToken,
) {
    let url = format!(
        "{}/containers/{}/logs?follow=true&stdout=true&stderr=true&timestamps=true",
        endpoint, container.id
    );
    let mut response = match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(
                container = %container.name,
                "log stream request rejected with status {}",
                response.status()
            );
            return;
        }
        Err(error) => {
            warn!(container = %container.name, "log stream request failed: {error}");
            return;
        }
    };

    debug!(container = %container.name, "log stream opened");
    let mut demuxer = LogDemuxer::default();
    loop {
        let chunk = tokio::select! {
            chunk = response.chunk() => chunk,
            () = cancel.cancelled() => break,
        };
        match chunk {
            Ok(Some(bytes)) => {
                for (log_type, line) in demuxer.feed(&bytes) {
                    if let Some(entry) = entry_for_line(&container, log_type, &line, &tags) {
                        queue.enqueue(entry);
                    }
                }
            }
            Ok(None) => {
                debug!(container = %container.name, "log stream ended");
                break;
            }
            Err(error) => {
                warn!(container = %container.name, "log stream read failed: {error}");
                break;
            }
        }
    }
}

fn entry_for_line(
    container: &MatchedContainer,
    log_type: &'static str,
    line: &str,
    tags: &HostTags,
) -> Option<LogEntry> {
    let text = timestamp_prefix().replace(line, "");
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let short_id: String = container.id.chars().take(12).collect();
    Some(
        LogEntry::new(
            LogLevel::classify(text),
            text,
            format!("Docker-{}", container.name),
            tags,
        )
        .with_property("ContainerID", short_id.into())
        .with_property("ContainerName", container.name.clone().into())
        .with_property("Image", container.image.clone().into())
        .with_property("LogType", log_type.into()),
    )
}

/// Incremental demuxer for Docker's multiplexed log stream: each frame is an
/// 8-byte header (stream type, three zero bytes, big-endian payload length)
/// followed by the payload. Lines may span frames and chunks, so partial
/// lines are buffered per stream.
#[derive(Default)]
struct LogDemuxer {
    buf: Vec<u8>,
    stdout_line: Vec<u8>,
    stderr_line: Vec<u8>,
}

impl LogDemuxer {
    fn feed(&mut self, chunk: &[u8]) -> Vec<(&'static str, String)> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        loop {
            if self.buf.len() < 8 {
                break;
            }
            let size = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < 8 + size {
                break;
            }
            let stream_type = self.buf[0];
            let payload: Vec<u8> = self.buf[8..8 + size].to_vec();
            self.buf.drain(..8 + size);

            let (label, line_buf) = if stream_type == 2 {
                ("stderr", &mut self.stderr_line)
            } else {
                ("stdout", &mut self.stdout_line)
            };
            for byte in payload {
                if byte == b'\n' {
                    lines.push((label, String::from_utf8_lossy(line_buf).into_owned()));
                    line_buf.clear();
                } else {
                    line_buf.push(byte);
                }
            }
        }
        lines
    }
}
