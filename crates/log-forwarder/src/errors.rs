// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Configuration errors. Raised at construction or persistence time and
/// surfaced to the caller immediately.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("destination {0} already exists")]
    DuplicateDestination(String),
    #[error("no destination named {0}")]
    UnknownDestination(String),
    #[error("destination {0} has no url configured")]
    MissingUrl(String),
    #[error("destination {0} has no file_path configured")]
    MissingFilePath(String),
    #[error("destination {0} has an invalid syslog target: {1}")]
    InvalidSyslogTarget(String, String),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("config file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Transport-level delivery failures. These never cross the destination
/// boundary: `send()` and `health_check()` convert them into a health-flag
/// transition plus a stored error string.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Probe(String),
}

/// Lifecycle errors of the forwarder service object.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("forwarder is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
}
