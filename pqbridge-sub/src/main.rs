// SPDX-License-Identifier: MIT
//
// PQ Sensor Bridge: Serial-to-MQTT Bridge over Post-Quantum TLS
// Copyright (c) 2025 PQ Sensor Bridge Contributors

//! PQ Bridge Subscriber
//!
//! Counterpart of the gateway for checking a deployment end to end: connects
//! with the same configuration and key-exchange group, subscribes to the
//! sensor topic and prints every reading until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use pqbridge_core::{
    config::BridgeConfig,
    mqtt::{IncomingMessage, MqttSession},
    session::BrokerSession,
    shutdown::ShutdownFlag,
    KeyExchangeGroup,
};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

/// How often the receive loop checks the shutdown flag
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "pqbridge-sub")]
#[command(about = "PQ Bridge Subscriber - Prints sensor readings received over MQTT/TLS", long_about = None)]
struct Args {
    /// Key exchange group offered in the TLS handshake
    group: Option<String>,

    /// Topic to subscribe to (defaults to the configured topic)
    #[arg(short, long)]
    topic: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

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

    let shutdown = ShutdownFlag::new();
    install_signal_handler(&shutdown).context("Failed to install signal handler")?;

    let group = match args.group.as_deref().map(str::parse::<KeyExchangeGroup>) {
        Some(Ok(group)) => group,
        Some(Err(e)) => {
            println!("{}\n{}", e, usage());
            return Ok(ExitCode::SUCCESS);
        }
        None => {
            println!("{}", usage());
            return Ok(ExitCode::SUCCESS);
        }
    };

    run(group, args.topic, &shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

fn usage() -> String {
    format!(
        "Usage: pqbridge-sub <group> [--topic TOPIC] [--log-level LEVEL]\n  <group> is one of: {}\n  \
         Only {} can complete a handshake with this TLS backend",
        KeyExchangeGroup::allowed_names(),
        KeyExchangeGroup::available_names()
    )
}

async fn run(
    group: KeyExchangeGroup,
    topic: Option<String>,
    shutdown: &ShutdownFlag,
) -> Result<()> {
    info!("PQ Bridge Subscriber v{}", pqbridge_core::VERSION);

    let mut config =
        BridgeConfig::from_env().context("Failed to load configuration from environment")?;
    if let Some(topic) = topic {
        config.topic = topic;
    }

    let options = config.session_options(group)?;
    let mut session = MqttSession::connect(&options)
        .await
        .with_context(|| format!("Unable to connect to {}", config.broker_url))?;

    session
        .subscribe(&config.topic, config.qos)
        .await
        .with_context(|| format!("Unable to subscribe to {}", config.topic))?;
    info!("Subscribed to {} with QoS {}", config.topic, u8::from(config.qos));

    let mut received = 0u64;
    while !shutdown.is_requested() {
        match tokio::time::timeout(SHUTDOWN_POLL, session.next_message()).await {
            Ok(Some(message)) => {
                received += 1;
                println!("{}", format_message(&message));
            }
            Ok(None) => {
                warn!("Session ended unexpectedly");
                break;
            }
            Err(_) => {}
        }
    }

    info!("Shutting down after {} message(s)", received);
    if let Err(e) = session.disconnect(config.disconnect_timeout()).await {
        warn!("Disconnect failed: {}", e);
    }
    Ok(())
}

fn format_message(message: &IncomingMessage) -> String {
    format!(
        "{}: {}",
        message.topic,
        String::from_utf8_lossy(&message.payload)
    )
}

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
                flag.request();
            }
        });
    }

    Ok(())
}
