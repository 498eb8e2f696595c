// SPDX-License-Identifier: MIT
//
// PQ Sensor Bridge: Serial-to-MQTT Bridge over Post-Quantum TLS
// Copyright (c) 2025 PQ Sensor Bridge Contributors

//! PQ Bridge Core Library
//!
//! This crate provides the building blocks of the sensor bridge: a background
//! acquisition thread reading fixed-length frames from a serial peripheral, a
//! single-slot mailbox handing the newest frame to the publisher, and a
//! publisher loop delivering each frame to an MQTT broker over a TLS transport
//! whose key-exchange group is chosen from a fixed allow-list.
//!
//! # Architecture
//!
//! - `frame`: the fixed-size sensor frame
//! - `mailbox`: single-slot, last-writer-wins frame hand-off
//! - `shutdown`: termination and acquisition-stop flags
//! - `serial`: frame source abstraction over `serialport`
//! - `acquisition`: the polling producer thread
//! - `kx`: key-exchange group allow-list
//! - `tls`: rustls client configuration
//! - `session`: broker session contract
//! - `mqtt`: `rumqttc` implementation of the session
//! - `publisher`: the consuming publish loop
//! - `lifecycle`: start / run / stop orchestration
//! - `config`: environment configuration with validation
//! - `metrics`: in-process counters
//! - `error`: unified error types
//!
//! # Shutdown
//!
//! Shutdown is a two-phase protocol: an interrupt sets the terminate flag, the
//! publish loop exits, the bridge sets the acquisition stop flag, joins the
//! acquisition thread and only then releases the shared state.

pub mod acquisition;
pub mod backoff;
pub mod config;
pub mod error;
pub mod frame;
pub mod kx;
pub mod lifecycle;
pub mod mailbox;
pub mod metrics;
pub mod mqtt;
pub mod publisher;
pub mod serial;
pub mod session;
pub mod shutdown;
pub mod tls;

pub use error::{Error, Result};
pub use frame::SensorFrame;
pub use kx::KeyExchangeGroup;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of payload bytes in one frame
pub const FRAME_PAYLOAD_LEN: usize = 13;

/// Frame length including the NUL terminator
pub const FRAME_LEN: usize = FRAME_PAYLOAD_LEN + 1;
