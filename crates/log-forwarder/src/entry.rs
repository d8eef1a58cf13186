// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The log event record shared by collectors, the dispatcher, and the
//! encoders.

use chrono::{SecondsFormat, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
pub enum LogLevel {
    Debug,
    #[default]
    Information,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// Classify a free-text line by keyword scan. Used for container output
    /// and tailed lines that are not structured JSON.
    pub fn classify(text: &str) -> LogLevel {
        let lower = text.to_lowercase();
        if ["error", "exception", "failed", "fatal"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            LogLevel::Error
        } else if lower.contains("warning") || lower.contains("warn") {
            LogLevel::Warning
        } else if lower.contains("debug") {
            LogLevel::Debug
        } else {
            LogLevel::Information
        }
    }

    /// Lenient parse of level strings found in external structured logs
    /// (`level` / `levelname` fields). Unknown strings map to Information.
    pub fn parse_lenient(s: &str) -> LogLevel {
        match s.trim().to_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "info" | "information" => LogLevel::Information,
            "warn" | "warning" => LogLevel::Warning,
            "err" | "error" => LogLevel::Error,
            "fatal" | "critical" | "crit" => LogLevel::Fatal,
            _ => LogLevel::Information,
        }
    }

    /// Syslog severity value (RFC 3164 numerical code).
    pub fn syslog_severity(self) -> u8 {
        match self {
            LogLevel::Debug => 7,
            LogLevel::Information => 6,
            LogLevel::Warning => 4,
            LogLevel::Error => 3,
            LogLevel::Fatal => 2,
        }
    }
}

/// Identity stamped onto every entry's properties.
///
/// The host process supplies the application and environment names; the
/// hostname is resolved once at construction.
#[derive(Debug, Clone)]
pub struct HostTags {
    pub host: String,
    pub application: String,
    pub environment: String,
}

impl HostTags {
    pub fn detect(application: impl Into<String>, environment: impl Into<String>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        HostTags {
            host,
            application: application.into(),
            environment: environment.into(),
        }
    }

    fn base_properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("Host".to_string(), Value::String(self.host.clone()));
        props.insert(
            "Application".to_string(),
            Value::String(self.application.clone()),
        );
        props.insert(
            "Environment".to_string(),
            Value::String(self.environment.clone()),
        );
        props
    }
}

/// One structured log event.
///
/// Immutable once built: the dispatcher clones it into every enabled
/// destination's pending buffer and never mutates it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp with sub-second precision and a trailing `Z`.
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    /// Producer identity, e.g. `Docker-<container>` or `System-File`.
    pub source: String,
    /// Open string-keyed map of scalar values. Always carries `Host`,
    /// `Application` and `Environment` plus source-specific keys.
    pub properties: Map<String, Value>,
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        message: impl Into<String>,
        source: impl Into<String>,
        tags: &HostTags,
    ) -> Self {
        LogEntry {
            timestamp: now_timestamp(),
            level,
            message: message.into(),
            source: source.into(),
            properties: tags.base_properties(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_properties<I>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.properties.extend(properties);
        self
    }
}

/// Current time in the entry timestamp format.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
