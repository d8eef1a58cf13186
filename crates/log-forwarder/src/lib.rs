// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log forwarding engine.
//!
//! Collectors turn external log streams (container stdout/stderr, tailed
//! files) into [`entry::LogEntry`] records and push them onto a shared bounded
//! queue. A single dispatcher task batches the queue per destination and
//! flushes each batch, in the destination's own wire format, to whichever
//! external sinks the operator configured: a Seq server, an Elasticsearch
//! cluster, a Loki push API, a syslog receiver, a generic webhook, or a local
//! file.
//!
//! Destinations fail independently. A sink that is down flips its own health
//! flag and drops its own batches; it never blocks or slows delivery to the
//! other sinks, and it never stops the dispatcher.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod destination;
pub mod docker;
pub mod encode;
pub mod entry;
pub mod errors;
pub mod forwarder;
pub mod tail;
