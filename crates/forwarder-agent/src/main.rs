// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use log_forwarder::config::{DestinationConfig, ForwarderConfig};
use log_forwarder::forwarder::Forwarder;

#[derive(Parser)]
#[command(
    name = "forwarder-agent",
    about = "Fans structured log events out to configured log destinations"
)]
struct Opts {
    /// Path of the persisted destination set
    #[arg(long, value_name = "PATH", default_value = "destinations.json")]
    config: PathBuf,

    /// Run the forwarding service until interrupted
    #[arg(long)]
    start: bool,

    /// Probe every configured destination and print the results
    #[arg(long)]
    test_destinations: bool,

    /// Add a Seq destination at the given URL
    #[arg(long, value_name = "URL")]
    add_seq: Option<String>,

    /// Add an Elasticsearch destination at the given URL
    #[arg(long, value_name = "URL")]
    add_elasticsearch: Option<String>,

    /// Add a Loki destination at the given URL
    #[arg(long, value_name = "URL")]
    add_loki: Option<String>,

    /// List configured destinations
    #[arg(long)]
    list: bool,

    /// Log file to tail while the service runs (repeatable)
    #[arg(long, value_name = "PATH")]
    watch: Vec<PathBuf>,

    /// Docker Engine API endpoint for container log streaming
    #[arg(long, value_name = "URL")]
    docker_host: Option<String>,
}

fn init_logging() -> anyhow::Result<()> {
    let log_level = env::var("LOG_FORWARDER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("hyper=off,rustls=off,{}", log_level);

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse configured log level")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    debug!("Logging subsystem enabled");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let opts = Opts::parse();

    let config = ForwarderConfig {
        config_path: opts.config.clone(),
        watch_files: opts.watch.clone(),
        docker_host: opts
            .docker_host
            .clone()
            .or_else(|| env::var("DOCKER_HOST").ok()),
        ..ForwarderConfig::default()
    };
    let forwarder = Forwarder::new(config).context("failed to load destination config")?;

    let mut acted = false;
    if let Some(url) = &opts.add_seq {
        forwarder.add_destination(DestinationConfig::seq("seq", url))?;
        info!("added seq destination at {url}");
        acted = true;
    }
    if let Some(url) = &opts.add_elasticsearch {
        forwarder.add_destination(DestinationConfig::elasticsearch("elasticsearch", url))?;
        info!("added elasticsearch destination at {url}");
        acted = true;
    }
    if let Some(url) = &opts.add_loki {
        forwarder.add_destination(DestinationConfig::loki("loki", url))?;
        info!("added loki destination at {url}");
        acted = true;
    }

    if opts.list {
        for status in forwarder.destinations_status() {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        acted = true;
    }

    if opts.test_destinations {
        for (name, healthy) in forwarder.test_destinations().await {
            println!("{name}: {}", if healthy { "healthy" } else { "unhealthy" });
        }
        acted = true;
    }

    if opts.start {
        forwarder
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        info!("forwarder running, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown signal received");
        forwarder.stop().await;
        acted = true;
    }

    if !acted {
        println!("nothing to do; try --start, --list or --help");
    }
    Ok(())
}
