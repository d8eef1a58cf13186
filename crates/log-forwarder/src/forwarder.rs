// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The forwarding orchestrator: shared inbound queue, destination registry,
//! per-destination batching, and service lifecycle.
//!
//! One dispatcher task owns all batching state. Producers only ever touch the
//! bounded queue through a [`QueueHandle`]; management calls only ever touch
//! the registry behind its read-write lock. The dispatcher takes a registry
//! snapshot per iteration, so a config update never races a flush.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{load_destinations, save_destinations, DestinationConfig, ForwarderConfig};
use crate::destination::{create_destination, Destination, DestinationStatus};
use crate::docker::ContainerCollector;
use crate::entry::{HostTags, LogEntry, LogLevel};
use crate::errors::{ConfigError, ForwarderError};
use crate::tail::FileTailer;

/// Source name of the synthetic startup/shutdown entries.
const SERVICE_SOURCE: &str = "LogForwarder";

type Registry = Arc<RwLock<HashMap<String, Arc<dyn Destination>>>>;

/// Cheap-to-clone producer handle onto the shared inbound queue.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<LogEntry>,
}

impl QueueHandle {
    pub(crate) fn new(tx: mpsc::Sender<LogEntry>) -> Self {
        QueueHandle { tx }
    }

    /// Non-blocking by contract: when the queue is full the entry is dropped
    /// on the floor. No counter or log records the drop.
    pub fn enqueue(&self, entry: LogEntry) {
        let _ = self.tx.try_send(entry);
    }
}

struct Inner {
    rx: Option<mpsc::Receiver<LogEntry>>,
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
    collectors: Vec<JoinHandle<()>>,
    running: bool,
}

/// The forwarding service object. Constructed once by the host process and
/// passed by handle to every caller; there is no global instance.
pub struct Forwarder {
    config: ForwarderConfig,
    tags: Arc<HostTags>,
    registry: Registry,
    queue_tx: StdMutex<mpsc::Sender<LogEntry>>,
    inner: tokio::sync::Mutex<Inner>,
}

impl Forwarder {
    /// Build the forwarder, loading the persisted destination set from
    /// `config.config_path`. A destination that no longer constructs (for
    /// example a removed file path) fails the whole load so the operator sees
    /// the problem immediately.
    pub fn new(config: ForwarderConfig) -> Result<Self, ConfigError> {
        let mut registry = HashMap::new();
        for destination_config in load_destinations(&config.config_path)? {
            let destination = create_destination(destination_config)?;
            registry.insert(destination.config().name.clone(), destination);
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let tags = Arc::new(HostTags::detect(
            config.application.clone(),
            config.environment.clone(),
        ));

        Ok(Forwarder {
            config,
            tags,
            registry: Arc::new(RwLock::new(registry)),
            queue_tx: StdMutex::new(tx),
            inner: tokio::sync::Mutex::new(Inner {
                rx: Some(rx),
                cancel: CancellationToken::new(),
                dispatcher: None,
                collectors: Vec::new(),
                running: false,
            }),
        })
    }

    pub fn host_tags(&self) -> Arc<HostTags> {
        Arc::clone(&self.tags)
    }

    pub fn queue(&self) -> QueueHandle {
        #[allow(clippy::expect_used)]
        QueueHandle::new(self.queue_tx.lock().expect("lock poisoned").clone())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }

    /// Start the dispatcher and the collectors.
    pub async fn start(&self) -> Result<(), ForwarderError> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return Err(ForwarderError::AlreadyRunning);
        }

        let rx = match inner.rx.take() {
            Some(rx) => rx,
            None => {
                // Restarting after a stop: the previous queue was consumed by
                // the old dispatcher, so producers get a fresh one.
                let (tx, rx) = mpsc::channel(self.config.queue_capacity);
                #[allow(clippy::expect_used)]
                {
                    *self.queue_tx.lock().expect("lock poisoned") = tx;
                }
                rx
            }
        };
        let cancel = CancellationToken::new();
        inner.cancel = cancel.clone();

        self.queue().enqueue(LogEntry::new(
            LogLevel::Information,
            "Log forwarding service started",
            SERVICE_SOURCE,
            &self.tags,
        ));

        let dispatcher = Dispatcher {
            rx,
            registry: Arc::clone(&self.registry),
            cancel: cancel.clone(),
            poll_interval: self.config.poll_interval,
        };
        inner.dispatcher = Some(tokio::spawn(dispatcher.run()));

        for path in &self.config.watch_files {
            let tailer = FileTailer::new(
                path.clone(),
                self.queue(),
                Arc::clone(&self.tags),
                cancel.clone(),
            );
            inner.collectors.push(tokio::spawn(tailer.run()));
        }
        if let Some(docker_host) = &self.config.docker_host {
            let collector = ContainerCollector::new(
                docker_host.clone(),
                self.config.container_name_prefix.clone(),
                self.queue(),
                Arc::clone(&self.tags),
                cancel.clone(),
            );
            inner.collectors.push(tokio::spawn(collector.run()));
        }

        inner.running = true;
        info!("log forwarding service started");
        Ok(())
    }

    /// Stop the service: cancel every worker, drain the queue, flush every
    /// non-empty pending buffer, then join the tasks. Idempotent.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return;
        }

        self.queue().enqueue(LogEntry::new(
            LogLevel::Information,
            "Log forwarding service stopping",
            SERVICE_SOURCE,
            &self.tags,
        ));
        inner.cancel.cancel();

        if let Some(handle) = inner.dispatcher.take() {
            let _ = handle.await;
        }
        for handle in inner.collectors.drain(..) {
            let _ = handle.await;
        }

        inner.running = false;
        info!("log forwarding service stopped");
    }

    /// Add a new destination and persist the set. Fails on duplicate names
    /// and on configs that do not construct.
    pub fn add_destination(&self, config: DestinationConfig) -> Result<(), ConfigError> {
        let destination = create_destination(config)?;
        let name = destination.config().name.clone();
        {
            #[allow(clippy::expect_used)]
            let mut registry = self.registry.write().expect("lock poisoned");
            if registry.contains_key(&name) {
                return Err(ConfigError::DuplicateDestination(name));
            }
            registry.insert(name, destination);
        }
        self.persist()
    }

    /// Replace an existing destination wholesale. The old instance and its
    /// statistics are discarded.
    pub fn update_destination(&self, config: DestinationConfig) -> Result<(), ConfigError> {
        let destination = create_destination(config)?;
        let name = destination.config().name.clone();
        {
            #[allow(clippy::expect_used)]
            let mut registry = self.registry.write().expect("lock poisoned");
            if !registry.contains_key(&name) {
                return Err(ConfigError::UnknownDestination(name));
            }
            registry.insert(name, destination);
        }
        self.persist()
    }

    pub fn remove_destination(&self, name: &str) -> Result<(), ConfigError> {
        {
            #[allow(clippy::expect_used)]
            let mut registry = self.registry.write().expect("lock poisoned");
            if registry.remove(name).is_none() {
                return Err(ConfigError::UnknownDestination(name.to_string()));
            }
        }
        self.persist()
    }

    /// Probe every destination. Returns `(name, healthy)` pairs sorted by
    /// name.
    pub async fn test_destinations(&self) -> Vec<(String, bool)> {
        let destinations = self.snapshot();
        let mut results = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let healthy = destination.health_check().await;
            results.push((destination.config().name.clone(), healthy));
        }
        results.sort();
        results
    }

    /// Status snapshots for the management surface, sorted by name.
    pub fn destinations_status(&self) -> Vec<DestinationStatus> {
        let mut statuses: Vec<DestinationStatus> = self
            .snapshot()
            .iter()
            .map(|destination| destination.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    fn snapshot(&self) -> Vec<Arc<dyn Destination>> {
        #[allow(clippy::expect_used)]
        let registry = self.registry.read().expect("lock poisoned");
        registry.values().cloned().collect()
    }

    fn persist(&self) -> Result<(), ConfigError> {
        let mut configs: Vec<DestinationConfig> = self
            .snapshot()
            .iter()
            .map(|destination| destination.config().clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        save_destinations(&self.config.config_path, &configs)
    }
}

struct PendingBatch {
    entries: Vec<LogEntry>,
    last_flush: Instant,
}

/// The single background loop that batches the queue per destination and
/// decides when to flush.
struct Dispatcher {
    rx: mpsc::Receiver<LogEntry>,
    registry: Registry,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl Dispatcher {
    async fn run(mut self) {
        debug!("dispatcher started");
        let mut pending: HashMap<String, PendingBatch> = HashMap::new();

        loop {
            if self.cancel.is_cancelled() {
                self.drain(&mut pending).await;
                break;
            }

            let popped = tokio::select! {
                maybe = self.rx.recv() => maybe,
                () = tokio::time::sleep(self.poll_interval) => None,
                () = self.cancel.cancelled() => None,
            };

            let destinations = self.destinations();
            if let Some(entry) = popped {
                fan_out(&destinations, &mut pending, entry);
            }
            prune_removed(&destinations, &mut pending);
            flush_due(&destinations, &mut pending, false).await;
        }

        debug!("dispatcher stopped");
    }

    /// Shutdown path: consume whatever is still queued, then one final flush
    /// pass over every destination with non-empty pending entries.
    async fn drain(&mut self, pending: &mut HashMap<String, PendingBatch>) {
        while let Ok(entry) = self.rx.try_recv() {
            let destinations = self.destinations();
            fan_out(&destinations, pending, entry);
            flush_due(&destinations, pending, false).await;
        }
        let destinations = self.destinations();
        prune_removed(&destinations, pending);
        flush_due(&destinations, pending, true).await;
    }

    fn destinations(&self) -> Vec<Arc<dyn Destination>> {
        #[allow(clippy::expect_used)]
        let registry = self.registry.read().expect("lock poisoned");
        registry.values().cloned().collect()
    }
}

/// Copy the entry into the pending buffer of every enabled destination.
///
/// `min_level` is deliberately not consulted here: it is declared-but-
/// unenforced configuration, preserved for round-trip compatibility.
fn fan_out(
    destinations: &[Arc<dyn Destination>],
    pending: &mut HashMap<String, PendingBatch>,
    entry: LogEntry,
) {
    for destination in destinations {
        let config = destination.config();
        if !config.enabled {
            continue;
        }
        let batch = pending
            .entry(config.name.clone())
            .or_insert_with(|| PendingBatch {
                entries: Vec::new(),
                last_flush: Instant::now(),
            });
        batch.entries.push(entry.clone());
    }
}

/// Drop buffers owned by destinations that were removed from the registry.
/// Disabled destinations keep theirs.
fn prune_removed(
    destinations: &[Arc<dyn Destination>],
    pending: &mut HashMap<String, PendingBatch>,
) {
    pending.retain(|name, _| {
        destinations
            .iter()
            .any(|destination| destination.config().name == *name)
    });
}

/// Flush every destination whose pending buffer is full or stale. Each
/// destination tracks its own last-flush time, so a busy sink never starves
/// a slow one's timeout flush.
async fn flush_due(
    destinations: &[Arc<dyn Destination>],
    pending: &mut HashMap<String, PendingBatch>,
    final_pass: bool,
) {
    for destination in destinations {
        let config = destination.config();
        // A disabled destination is never auto-flushed; its buffer survives
        // untouched until re-enable, removal, or the final pass on stop.
        if !final_pass && !config.enabled {
            continue;
        }
        let Some(batch) = pending.get_mut(&config.name) else {
            continue;
        };
        if batch.entries.is_empty() {
            continue;
        }
        let due = final_pass
            || batch.entries.len() >= config.batch_size
            || batch.last_flush.elapsed() >= config.batch_timeout_duration();
        if !due {
            continue;
        }

        let entries = std::mem::take(&mut batch.entries);
        let count = entries.len();
        if !destination.send(&entries).await {
            warn!(
                destination = %config.name,
                "failed to deliver batch of {count} entries"
            );
        }
        batch.last_flush = Instant::now();
    }
}
