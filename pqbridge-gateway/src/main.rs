// SPDX-License-Identifier: MIT
//
// PQ Sensor Bridge: Serial-to-MQTT Bridge over Post-Quantum TLS
// Copyright (c) 2025 PQ Sensor Bridge Contributors

//! PQ Bridge Gateway
//!
//! Reads fixed-length frames from a serial sensor board and publishes each
//! one to an MQTT broker over TLS, using the key-exchange group named on the
//! command line.
//!
//! All five allow-listed group names are accepted, but the linked rustls
//! provider only implements P-256 and X25519. The post-quantum names fail at
//! startup with a TLS error before any connection is attempted.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    serial     ┌──────────────┐     MQTT/TLS     ┌──────────────┐
//! │ Sensor board │ ─────────────>│   Gateway    │ ────────────────>│    Broker    │
//! │              │  13-byte frm  │  (mailbox)   │  (KX group arg)  │              │
//! └──────────────┘               └──────────────┘                  └──────────────┘
//! ```
//!
//! # Shutdown
//!
//! SIGINT/SIGTERM set a flag. The publish loop observes it, the acquisition
//! thread is stopped and joined, then the broker session is disconnected.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, CliOutcome};
use pqbridge_core::{
    config::BridgeConfig,
    lifecycle::Bridge,
    metrics::Metrics,
    mqtt::MqttSession,
    publisher::{ClientConnection, PublishTask},
    shutdown::{ShutdownFlag, TerminationState},
    KeyExchangeGroup,
};
use std::process::ExitCode;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();

    let termination = TerminationState::new();
    install_signal_handler(termination.terminate_flag())
        .context("Failed to install signal handler")?;

    let group = match args.outcome() {
        CliOutcome::Run(group) => group,
        CliOutcome::Usage(usage) => {
            println!("{}", usage);
            return Ok(ExitCode::SUCCESS);
        }
    };

    run(group, &termination).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run(group: KeyExchangeGroup, termination: &TerminationState) -> Result<()> {
    info!("PQ Bridge Gateway v{}", pqbridge_core::VERSION);

    info!("Loading configuration from environment variables");
    let config =
        BridgeConfig::from_env().context("Failed to load configuration from environment")?;

    info!(
        "Connecting to broker {} using {} (post-quantum: {})",
        config.broker_url,
        group,
        group.is_post_quantum()
    );
    let options = config.session_options(group)?;
    let session = MqttSession::connect(&options)
        .await
        .with_context(|| format!("Unable to connect to {}", config.broker_url))?;
    info!("Connected");

    let metrics = Metrics::new();
    let bridge = Bridge::start(
        config.serial_settings(),
        config.acquisition(),
        termination,
        metrics.clone(),
    )
    .context("Failed to start acquisition thread")?;

    let mut publisher = PublishTask::new(
        session,
        ClientConnection::from_config(&config),
        config.poll_interval(),
        metrics.clone(),
    );
    bridge.run(&mut publisher, termination.terminate_flag()).await;

    info!("Shutdown signal received, stopping bridge...");
    let report = tokio::task::spawn_blocking(move || bridge.stop())
        .await
        .context("Acquisition stop task failed")?
        .context("Failed to stop acquisition")?;
    info!("Acquisition finished in state {:?}", report.final_state);

    if let Err(e) = publisher.disconnect(config.disconnect_timeout()).await {
        warn!("Disconnect failed: {}", e);
    }

    info!("{}", metrics.summary());
    info!("Gateway shut down gracefully");
    Ok(())
}

/// Route SIGINT/SIGTERM to `flag`; the handler does nothing else
fn install_signal_handler(flag: &ShutdownFlag) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};

        signal_hook::flag::register(SIGINT, flag.as_atomic())?;
        signal_hook::flag::register(SIGTERM, flag.as_atomic())?;
    }

    #[cfg(windows)]
    {
        let flag = flag.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C signal");
                flag.request();
            }
        });
    }

    Ok(())
}
