// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destination configuration schema and its JSON persistence.
//!
//! The full destination set is persisted as one JSON array. Every
//! add/update/remove rewrites the file atomically (temp file + rename) so a
//! crash mid-write never leaves a torn config behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entry::LogLevel;
use crate::errors::ConfigError;

/// The six supported destination kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Seq,
    Elasticsearch,
    Loki,
    Syslog,
    Webhook,
    File,
}

/// Declared syslog transport.
///
/// Only `udp` is actually spoken by the sender; `tcp` and `tcp_tls` are
/// accepted so existing configs round-trip, but delivery still goes out as
/// UDP datagrams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyslogProtocol {
    #[default]
    Udp,
    Tcp,
    TcpTls,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_timeout() -> u64 {
    5
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

/// One configured sink, as persisted.
///
/// `min_level`, `retry_count` and `retry_delay` are declared configuration
/// only: the dispatch and send paths do not consult them. They are kept so
/// persisted configs survive round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Unique key across the destination set.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DestinationKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Elasticsearch index prefix; the send date is appended per batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_level: Option<LogLevel>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds a non-empty partial batch may age before it is flushed.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default)]
    pub syslog_protocol: SyslogProtocol,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_ca_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_client_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_client_key: Option<PathBuf>,
}

impl DestinationConfig {
    fn with_url(name: impl Into<String>, kind: DestinationKind, url: impl Into<String>) -> Self {
        DestinationConfig {
            name: name.into(),
            kind,
            enabled: true,
            url: Some(url.into()),
            api_key: None,
            username: None,
            password: None,
            index: None,
            file_path: None,
            min_level: None,
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
            retry_count: default_retry_count(),
            retry_delay: default_retry_delay(),
            syslog_protocol: SyslogProtocol::default(),
            ssl_verify: true,
            ssl_ca_cert: None,
            ssl_client_cert: None,
            ssl_client_key: None,
        }
    }

    pub fn seq(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_url(name, DestinationKind::Seq, url)
    }

    pub fn elasticsearch(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::with_url(name, DestinationKind::Elasticsearch, url);
        config.index = Some("logs".to_string());
        config
    }

    pub fn loki(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_url(name, DestinationKind::Loki, url)
    }

    pub fn syslog(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_url(name, DestinationKind::Syslog, target)
    }

    pub fn webhook(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_url(name, DestinationKind::Webhook, url)
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let mut config = Self::with_url(name, DestinationKind::File, "");
        config.url = None;
        config.file_path = Some(path.into());
        config
    }

    pub fn batch_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.batch_timeout)
    }
}

/// Load the persisted destination set. A missing file is an empty set.
pub fn load_destinations(path: &Path) -> Result<Vec<DestinationConfig>, ConfigError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Persist the full destination set atomically.
pub fn save_destinations(
    path: &Path,
    destinations: &[DestinationConfig],
) -> Result<(), ConfigError> {
    let raw = serde_json::to_string_pretty(destinations)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Host-process level settings for the forwarder itself.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Where the destination set is persisted.
    pub config_path: PathBuf,
    pub application: String,
    pub environment: String,
    /// Shared inbound queue capacity. Enqueueing onto a full queue drops the
    /// entry without blocking the producer.
    pub queue_capacity: usize,
    /// Queue poll timeout of the dispatcher loop.
    pub poll_interval: Duration,
    /// Log files to tail. Supplied by the host process.
    pub watch_files: Vec<PathBuf>,
    /// Docker Engine API endpoint; container streaming is off when unset.
    pub docker_host: Option<String>,
    /// Containers whose name starts with this prefix are always streamed.
    pub container_name_prefix: String,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            config_path: PathBuf::from("destinations.json"),
            application: "AutoBot".to_string(),
            environment: "production".to_string(),
            queue_capacity: 10_000,
            poll_interval: Duration::from_secs(1),
            watch_files: Vec::new(),
            docker_host: None,
            container_name_prefix: "autobot".to_string(),
        }
    }
}
