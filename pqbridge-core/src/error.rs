// SPDX-License-Identifier: MIT
//
// PQ Sensor Bridge: Serial-to-MQTT Bridge over Post-Quantum TLS
// Copyright (c) 2025 PQ Sensor Bridge Contributors

//! Error types for the bridge
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key-exchange group is not on the allow-list
    #[error("Invalid key exchange method: {0}")]
    InvalidGroup(String),

    /// Serial device could not be opened or read
    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    /// TLS transport could not be built
    #[error("TLS error: {0}")]
    Tls(String),

    /// Broker connection could not be established
    #[error("Failed to connect: {0}")]
    Connect(String),

    /// Publish request was rejected by the client
    #[error("Publish error: {0}")]
    Publish(String),

    /// Delivery was not acknowledged in time
    #[error("Delivery of token {token} not confirmed within {timeout:?}")]
    DeliveryTimeout { token: u64, timeout: Duration },

    /// Broker session was lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error only affects the current publish and the loop may continue
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Publish(_)
                | Error::DeliveryTimeout { .. }
                | Error::ConnectionLost(_)
                | Error::Timeout
        )
    }

    /// Check if error must abort startup
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::InvalidGroup(_) | Error::Tls(_) | Error::Connect(_)
        )
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(e: rumqttc::ClientError) -> Self {
        Error::Publish(e.to_string())
    }
}

impl From<envy::Error> for Error {
    fn from(e: envy::Error) -> Self {
        Error::Config(format!("Failed to parse environment variables: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let timeout = Error::DeliveryTimeout {
            token: 3,
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_startup_fatal());

        assert!(Error::Connect("refused".into()).is_startup_fatal());
        assert!(Error::InvalidGroup("rsa".into()).is_startup_fatal());
        assert!(!Error::Internal("x".into()).is_transient());
    }
}
