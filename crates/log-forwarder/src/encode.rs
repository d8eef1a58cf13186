// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pure transforms from [`LogEntry`] to each destination's wire payload.
//!
//! Nothing in here performs I/O or holds state; the destination
//! implementations own transport and batching policy.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::entry::{now_timestamp, LogEntry};

/// Syslog facility for all emitted lines (1 = user-level messages).
const SYSLOG_FACILITY: u8 = 1;

/// Identity reported in webhook payloads.
const WEBHOOK_SOURCE: &str = "AutoBot";

/// One CLEF object: `@t`/`@l`/`@mt` plus `Source` and the entry's properties
/// flattened at top level.
pub fn clef_object(entry: &LogEntry) -> Value {
    let mut object = Map::new();
    object.insert("@t".to_string(), Value::String(entry.timestamp.clone()));
    object.insert("@l".to_string(), Value::String(entry.level.to_string()));
    object.insert("@mt".to_string(), Value::String(entry.message.clone()));
    object.insert("Source".to_string(), Value::String(entry.source.clone()));
    for (key, value) in &entry.properties {
        object.insert(key.clone(), value.clone());
    }
    Value::Object(object)
}

/// A Seq batch: newline-joined CLEF objects, one POST body.
pub fn clef_batch(entries: &[LogEntry]) -> String {
    entries
        .iter()
        .map(|entry| clef_object(entry).to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The Elasticsearch-style document shape, shared by the bulk, webhook and
/// file encodings.
pub fn document(entry: &LogEntry) -> Value {
    json!({
        "@timestamp": entry.timestamp,
        "level": entry.level.to_string(),
        "message": entry.message,
        "source": entry.source,
        "fields": entry.properties,
    })
}

/// Elasticsearch `_bulk` NDJSON body: an action line plus a document line per
/// entry. The index name carries the send date, not the entry's timestamp.
pub fn bulk_body(index_prefix: &str, entries: &[LogEntry]) -> String {
    let index = format!("{}-{}", index_prefix, Utc::now().format("%Y.%m.%d"));
    let mut body = String::new();
    for entry in entries {
        body.push_str(&json!({"index": {"_index": index}}).to_string());
        body.push('\n');
        body.push_str(&document(entry).to_string());
        body.push('\n');
    }
    body
}

/// Loki push body for a single entry: one stream whose labels are the source,
/// the level and the stringified scalar properties, and one value pair of
/// `[unix_nanoseconds_as_string, message]`.
pub fn loki_push(entry: &LogEntry) -> Value {
    let mut stream = Map::new();
    stream.insert("source".to_string(), Value::String(entry.source.clone()));
    stream.insert("level".to_string(), Value::String(entry.level.to_string()));
    for (key, value) in &entry.properties {
        let label = match value {
            Value::String(s) => s.clone(),
            Value::Bool(_) | Value::Number(_) => value.to_string(),
            // Nested values are not valid label material.
            _ => continue,
        };
        stream.insert(key.clone(), Value::String(label));
    }
    json!({
        "streams": [{
            "stream": stream,
            "values": [[unix_nanos(&entry.timestamp), entry.message]],
        }]
    })
}

fn unix_nanos(timestamp: &str) -> String {
    let nanos = DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .and_then(|dt| dt.timestamp_nanos_opt())
        .or_else(|| Utc::now().timestamp_nanos_opt())
        .unwrap_or(0);
    nanos.to_string()
}

/// One syslog line: `<priority>timestamp source: message` with
/// `priority = facility * 8 + severity`.
pub fn syslog_line(entry: &LogEntry) -> String {
    let priority = SYSLOG_FACILITY * 8 + entry.level.syslog_severity();
    format!(
        "<{}>{} {}: {}",
        priority, entry.timestamp, entry.source, entry.message
    )
}

/// Webhook POST body for a batch.
pub fn webhook_body(entries: &[LogEntry]) -> Value {
    json!({
        "logs": entries.iter().map(document).collect::<Vec<_>>(),
        "source": WEBHOOK_SOURCE,
        "timestamp": now_timestamp(),
    })
}

/// One newline-terminated JSON line for the file destination.
pub fn file_line(entry: &LogEntry) -> String {
    let mut line = document(entry).to_string();
    line.push('\n');
    line
}
