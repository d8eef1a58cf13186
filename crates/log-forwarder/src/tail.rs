// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only file tailing.
//!
//! The tailer opens its target, seeks to end-of-file (existing content is
//! never replayed) and polls for new lines with a short idle sleep. Each line
//! is first tried as structured JSON; lines that do not parse fall back to
//! the same keyword level classification the container streamer uses.
//!
//! Truncation is detected by size: when the file shrinks the tailer reopens
//! it from the start, so an in-place rotation does not silently stall the
//! stream.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entry::{HostTags, LogEntry, LogLevel};
use crate::forwarder::QueueHandle;

const IDLE_SLEEP: Duration = Duration::from_millis(250);
const FILE_SOURCE: &str = "System-File";

pub struct FileTailer {
    path: PathBuf,
    queue: QueueHandle,
    tags: Arc<HostTags>,
    cancel: CancellationToken,
}

impl FileTailer {
    pub fn new(
        path: PathBuf,
        queue: QueueHandle,
        tags: Arc<HostTags>,
        cancel: CancellationToken,
    ) -> Self {
        FileTailer {
            path,
            queue,
            tags,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(error) => {
                warn!(path = %self.path.display(), "cannot tail file: {error}");
                return;
            }
        };
        let mut pos = match file.seek(SeekFrom::End(0)).await {
            Ok(pos) => pos,
            Err(error) => {
                warn!(path = %self.path.display(), "cannot seek file: {error}");
                return;
            }
        };
        debug!(path = %self.path.display(), "tailing from offset {pos}");

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    if let Some(reopened) = self.reopen_if_truncated(pos).await {
                        reader = reopened;
                        pos = 0;
                        continue;
                    }
                    tokio::select! {
                        () = tokio::time::sleep(IDLE_SLEEP) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
                Ok(read) => {
                    pos += read as u64;
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        self.queue.enqueue(parse_line(trimmed, &self.path, &self.tags));
                    }
                    line.clear();
                }
                Err(error) => {
                    warn!(path = %self.path.display(), "tail read failed: {error}");
                    break;
                }
            }
        }
        debug!(path = %self.path.display(), "tailer stopped");
    }

    /// When the file shrank below our offset it was truncated or rotated in
    /// place; start over from the beginning.
    async fn reopen_if_truncated(&self, pos: u64) -> Option<BufReader<File>> {
        let metadata = tokio::fs::metadata(&self.path).await.ok()?;
        if metadata.len() >= pos {
            return None;
        }
        debug!(path = %self.path.display(), "file truncated, reopening");
        File::open(&self.path).await.ok().map(BufReader::new)
    }
}

/// Build an entry from one tailed line. Structured JSON lines contribute
/// their `message` and `level`/`levelname` fields and carry every remaining
/// key as a property; anything else is classified as free text.
fn parse_line(line: &str, path: &std::path::Path, tags: &HostTags) -> LogEntry {
    let entry = match serde_json::from_str::<Map<String, Value>>(line) {
        Ok(mut doc) => {
            let message = match doc.remove("message") {
                Some(Value::String(message)) => message,
                Some(other) => other.to_string(),
                None => line.to_string(),
            };
            let level = doc
                .remove("level")
                .or_else(|| doc.remove("levelname"))
                .and_then(|value| value.as_str().map(LogLevel::parse_lenient))
                .unwrap_or_default();
            LogEntry::new(level, message, FILE_SOURCE, tags).with_properties(doc)
        }
        Err(_) => LogEntry::new(LogLevel::classify(line), line, FILE_SOURCE, tags),
    };
    entry.with_property("FilePath", path.display().to_string().into())
}
