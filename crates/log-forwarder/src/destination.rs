// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The polymorphic sink abstraction: one implementation per destination kind,
//! selected through [`create_destination`] keyed by the config `type` field.
//!
//! `send()` never lets a transport failure cross the boundary. Any failure
//! flips the destination's health flag, stores a truncated error string,
//! bumps the failed counter by the batch size and returns `false`; the failed
//! batch is discarded, not requeued.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::{DestinationConfig, DestinationKind};
use crate::encode;
use crate::entry::LogEntry;
use crate::errors::{ConfigError, DeliveryError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_LEN: usize = 240;
const DEFAULT_SYSLOG_PORT: u16 = 514;

fn truncate_error(error: &DeliveryError) -> String {
    let msg = error.to_string();
    if msg.len() <= MAX_ERROR_LEN {
        msg
    } else {
        let cut = msg
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_ERROR_LEN)
            .last()
            .unwrap_or(0);
        format!("{}...", &msg[..cut])
    }
}

/// Mutable health and delivery counters of one destination instance.
///
/// Counters only ever increase; they reset only when the destination is
/// replaced wholesale by a config update.
#[derive(Debug)]
pub struct DestinationStats {
    healthy: AtomicBool,
    sent: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl DestinationStats {
    pub fn new() -> Self {
        DestinationStats {
            healthy: AtomicBool::new(true),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        #[allow(clippy::expect_used)]
        self.last_error.lock().expect("lock poisoned").clone()
    }

    fn record_success(&self, batch_len: u64) {
        self.sent.fetch_add(batch_len, Ordering::Relaxed);
        self.mark_healthy();
    }

    fn record_failure(&self, batch_len: u64, error: &DeliveryError) {
        self.failed.fetch_add(batch_len, Ordering::Relaxed);
        self.mark_unhealthy(error);
    }

    fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Relaxed);
    }

    fn mark_unhealthy(&self, error: &DeliveryError) {
        self.healthy.store(false, Ordering::Relaxed);
        #[allow(clippy::expect_used)]
        let mut last_error = self.last_error.lock().expect("lock poisoned");
        *last_error = Some(truncate_error(error));
    }
}

impl Default for DestinationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DestinationKind,
    pub enabled: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub sent_count: u64,
    pub failed_count: u64,
}

/// One externally configured log sink.
#[async_trait]
pub trait Destination: Send + Sync {
    fn config(&self) -> &DestinationConfig;

    fn stats(&self) -> &DestinationStats;

    /// Transport-specific delivery of one batch.
    async fn deliver(&self, batch: &[LogEntry]) -> Result<(), DeliveryError>;

    /// Lightweight destination-specific probe.
    async fn probe(&self) -> Result<(), DeliveryError>;

    /// Attempt delivery, folding any failure into the health/stats state.
    /// Callers never see an error cross this boundary.
    async fn send(&self, batch: &[LogEntry]) -> bool {
        match self.deliver(batch).await {
            Ok(()) => {
                self.stats().record_success(batch.len() as u64);
                true
            }
            Err(error) => {
                debug!(
                    destination = %self.config().name,
                    "delivery failed: {error}"
                );
                self.stats().record_failure(batch.len() as u64, &error);
                false
            }
        }
    }

    /// Run the probe and update the health flag as a side effect.
    async fn health_check(&self) -> bool {
        match self.probe().await {
            Ok(()) => {
                self.stats().mark_healthy();
                true
            }
            Err(error) => {
                self.stats().mark_unhealthy(&error);
                false
            }
        }
    }

    fn status(&self) -> DestinationStatus {
        let config = self.config();
        let stats = self.stats();
        DestinationStatus {
            name: config.name.clone(),
            kind: config.kind,
            enabled: config.enabled,
            healthy: stats.is_healthy(),
            last_error: stats.last_error(),
            sent_count: stats.sent_count(),
            failed_count: stats.failed_count(),
        }
    }
}

/// Build the concrete destination for a config. Unknown or incomplete
/// configuration fails here, before the destination ever enters the registry.
pub fn create_destination(config: DestinationConfig) -> Result<Arc<dyn Destination>, ConfigError> {
    match config.kind {
        DestinationKind::Seq => Ok(Arc::new(SeqDestination::new(config)?)),
        DestinationKind::Elasticsearch => Ok(Arc::new(ElasticsearchDestination::new(config)?)),
        DestinationKind::Loki => Ok(Arc::new(LokiDestination::new(config)?)),
        DestinationKind::Syslog => Ok(Arc::new(SyslogDestination::new(config)?)),
        DestinationKind::Webhook => Ok(Arc::new(WebhookDestination::new(config)?)),
        DestinationKind::File => Ok(Arc::new(FileDestination::new(config)?)),
    }
}

fn http_client(config: &DestinationConfig) -> Result<reqwest::Client, ConfigError> {
    Ok(reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .danger_accept_invalid_certs(!config.ssl_verify)
        .build()?)
}

fn require_url(config: &DestinationConfig) -> Result<String, ConfigError> {
    config
        .url
        .as_deref()
        .map(|url| url.trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ConfigError::MissingUrl(config.name.clone()))
}

async fn check_status(response: reqwest::Response) -> Result<(), DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(DeliveryError::Status { status, body })
}

/// Seq over CLEF (`application/vnd.serilog.clef`), batched into one POST.
pub struct SeqDestination {
    config: DestinationConfig,
    url: String,
    client: reqwest::Client,
    stats: DestinationStats,
}

impl SeqDestination {
    pub fn new(config: DestinationConfig) -> Result<Self, ConfigError> {
        let url = require_url(&config)?;
        let client = http_client(&config)?;
        Ok(SeqDestination {
            config,
            url,
            client,
            stats: DestinationStats::new(),
        })
    }
}

#[async_trait]
impl Destination for SeqDestination {
    fn config(&self) -> &DestinationConfig {
        &self.config
    }

    fn stats(&self) -> &DestinationStats {
        &self.stats
    }

    async fn deliver(&self, batch: &[LogEntry]) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(format!("{}/api/events/raw", self.url))
            .header("Content-Type", "application/vnd.serilog.clef")
            .body(encode::clef_batch(batch));
        if let Some(api_key) = &self.config.api_key {
            request = request.header("X-Seq-ApiKey", api_key);
        }
        check_status(request.send().await?).await
    }

    async fn probe(&self) -> Result<(), DeliveryError> {
        check_status(self.client.get(format!("{}/api", self.url)).send().await?).await
    }
}

/// Elasticsearch `_bulk` NDJSON.
pub struct ElasticsearchDestination {
    config: DestinationConfig,
    url: String,
    index_prefix: String,
    client: reqwest::Client,
    stats: DestinationStats,
}

impl ElasticsearchDestination {
    pub fn new(config: DestinationConfig) -> Result<Self, ConfigError> {
        let url = require_url(&config)?;
        let client = http_client(&config)?;
        let index_prefix = config.index.clone().unwrap_or_else(|| "logs".to_string());
        Ok(ElasticsearchDestination {
            config,
            url,
            index_prefix,
            client,
            stats: DestinationStats::new(),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_deref()),
            None => request,
        }
    }
}

#[async_trait]
impl Destination for ElasticsearchDestination {
    fn config(&self) -> &DestinationConfig {
        &self.config
    }

    fn stats(&self) -> &DestinationStats {
        &self.stats
    }

    async fn deliver(&self, batch: &[LogEntry]) -> Result<(), DeliveryError> {
        let request = self
            .client
            .post(format!("{}/_bulk", self.url))
            .header("Content-Type", "application/x-ndjson")
            .body(encode::bulk_body(&self.index_prefix, batch));
        check_status(self.authorized(request).send().await?).await
    }

    async fn probe(&self) -> Result<(), DeliveryError> {
        let request = self.client.get(format!("{}/_cluster/health", self.url));
        check_status(self.authorized(request).send().await?).await
    }
}

/// Loki push API. Entries go out one push per entry, not as a multi-value
/// stream; the first failed push fails the whole batch.
pub struct LokiDestination {
    config: DestinationConfig,
    url: String,
    client: reqwest::Client,
    stats: DestinationStats,
}

impl LokiDestination {
    pub fn new(config: DestinationConfig) -> Result<Self, ConfigError> {
        let url = require_url(&config)?;
        let client = http_client(&config)?;
        Ok(LokiDestination {
            config,
            url,
            client,
            stats: DestinationStats::new(),
        })
    }
}

#[async_trait]
impl Destination for LokiDestination {
    fn config(&self) -> &DestinationConfig {
        &self.config
    }

    fn stats(&self) -> &DestinationStats {
        &self.stats
    }

    async fn deliver(&self, batch: &[LogEntry]) -> Result<(), DeliveryError> {
        for entry in batch {
            let response = self
                .client
                .post(format!("{}/loki/api/v1/push", self.url))
                .json(&encode::loki_push(entry))
                .send()
                .await?;
            check_status(response).await?;
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), DeliveryError> {
        check_status(self.client.get(format!("{}/ready", self.url)).send().await?).await
    }
}

/// Syslog over UDP, one datagram per entry, no delivery confirmation.
///
/// `syslog_protocol` values of tcp/tcp_tls are accepted in configuration but
/// the sender only speaks UDP.
pub struct SyslogDestination {
    config: DestinationConfig,
    target: String,
    stats: DestinationStats,
}

impl SyslogDestination {
    pub fn new(config: DestinationConfig) -> Result<Self, ConfigError> {
        let raw = require_url(&config)?;
        let trimmed = raw
            .trim_start_matches("udp://")
            .trim_start_matches("tcp://")
            .trim_start_matches("syslog://");
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidSyslogTarget(
                config.name.clone(),
                raw.clone(),
            ));
        }
        let target = if trimmed.contains(':') {
            trimmed.to_string()
        } else {
            format!("{trimmed}:{DEFAULT_SYSLOG_PORT}")
        };
        Ok(SyslogDestination {
            config,
            target,
            stats: DestinationStats::new(),
        })
    }
}

#[async_trait]
impl Destination for SyslogDestination {
    fn config(&self) -> &DestinationConfig {
        &self.config
    }

    fn stats(&self) -> &DestinationStats {
        &self.stats
    }

    async fn deliver(&self, batch: &[LogEntry]) -> Result<(), DeliveryError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        for entry in batch {
            socket
                .send_to(encode::syslog_line(entry).as_bytes(), &self.target)
                .await?;
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), DeliveryError> {
        // No lightweight probe exists for a fire-and-forget UDP receiver.
        Ok(())
    }

    async fn health_check(&self) -> bool {
        // Reports the cached flag from the last send, no real probe.
        self.stats.is_healthy()
    }
}

/// Generic webhook: one JSON POST per batch, bearer-token auth when an API
/// key is configured.
pub struct WebhookDestination {
    config: DestinationConfig,
    url: String,
    client: reqwest::Client,
    stats: DestinationStats,
}

impl WebhookDestination {
    pub fn new(config: DestinationConfig) -> Result<Self, ConfigError> {
        let url = require_url(&config)?;
        let client = http_client(&config)?;
        Ok(WebhookDestination {
            config,
            url,
            client,
            stats: DestinationStats::new(),
        })
    }
}

#[async_trait]
impl Destination for WebhookDestination {
    fn config(&self) -> &DestinationConfig {
        &self.config
    }

    fn stats(&self) -> &DestinationStats {
        &self.stats
    }

    async fn deliver(&self, batch: &[LogEntry]) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.url).json(&encode::webhook_body(batch));
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }
        check_status(request.send().await?).await
    }

    async fn probe(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        // Reports the cached flag from the last send, no real probe.
        self.stats.is_healthy()
    }
}

/// Local file append, newline-delimited JSON documents.
pub struct FileDestination {
    config: DestinationConfig,
    path: PathBuf,
    /// Serializes flushes so concurrent batches never interleave lines.
    write_lock: tokio::sync::Mutex<()>,
    stats: DestinationStats,
}

impl FileDestination {
    pub fn new(config: DestinationConfig) -> Result<Self, ConfigError> {
        let path = config
            .file_path
            .clone()
            .ok_or_else(|| ConfigError::MissingFilePath(config.name.clone()))?;
        Ok(FileDestination {
            config,
            path,
            write_lock: tokio::sync::Mutex::new(()),
            stats: DestinationStats::new(),
        })
    }
}

#[async_trait]
impl Destination for FileDestination {
    fn config(&self) -> &DestinationConfig {
        &self.config
    }

    fn stats(&self) -> &DestinationStats {
        &self.stats
    }

    async fn deliver(&self, batch: &[LogEntry]) -> Result<(), DeliveryError> {
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        for entry in batch {
            file.write_all(encode::file_line(entry).as_bytes()).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), DeliveryError> {
        match self.path.parent() {
            None => Ok(()),
            Some(parent) if parent.as_os_str().is_empty() => Ok(()),
            Some(parent) if parent.is_dir() => Ok(()),
            Some(parent) => {
                tokio::fs::create_dir_all(parent).await?;
                Ok(())
            }
        }
    }
}
