//! Configuration management for the bridge

use crate::acquisition::AcquisitionConfig;
use crate::backoff::IdleBackoff;
use crate::kx::KeyExchangeGroup;
use crate::mqtt::{BrokerEndpoint, SessionOptions};
use crate::serial::SerialSettings;
use crate::session::QualityOfService;
use crate::tls::TlsOptions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bridge configuration, shared by the gateway and the subscriber
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Serial device of the sensor board
    #[serde(default = "default_serial_path")]
    pub serial_path: String,

    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Broker URL (`ssl://host:port` for TLS, `tcp://host:port` for plain)
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Topic readings are published to
    #[serde(default = "default_topic")]
    pub topic: String,

    /// MQTT QoS level (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: QualityOfService,

    /// Maximum wait for delivery confirmation in milliseconds
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Start a clean MQTT session
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// Trust anchors (PEM) for the broker certificate
    #[serde(default)]
    pub ca_path: Option<PathBuf>,

    /// Verify the broker certificate
    #[serde(default = "default_true")]
    pub verify_server_cert: bool,

    /// Maximum wait for CONNACK in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Maximum wait for disconnect in milliseconds
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    /// Delay between reconnect attempts after connection loss
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Publisher mailbox poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Acquisition idle backoff bounds in milliseconds
    #[serde(default = "default_acquisition_backoff_min_ms")]
    pub acquisition_backoff_min_ms: u64,

    #[serde(default = "default_acquisition_backoff_max_ms")]
    pub acquisition_backoff_max_ms: u64,

    /// Consecutive read errors before the device is closed (0 = never)
    #[serde(default = "default_max_read_errors")]
    pub max_read_errors: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial_path: default_serial_path(),
            baud_rate: default_baud_rate(),
            broker_url: default_broker_url(),
            client_id: default_client_id(),
            topic: default_topic(),
            qos: default_qos(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            clean_session: true,
            ca_path: None,
            verify_server_cert: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            acquisition_backoff_min_ms: default_acquisition_backoff_min_ms(),
            acquisition_backoff_max_ms: default_acquisition_backoff_max_ms(),
            max_read_errors: default_max_read_errors(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `PQBRIDGE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("PQBRIDGE_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.serial_path.trim().is_empty() {
            return Err(Error::Config("serial_path cannot be empty".to_string()));
        }

        if self.baud_rate == 0 {
            return Err(Error::Config("baud_rate must be > 0".to_string()));
        }

        let endpoint = self.endpoint()?;

        if self.client_id.is_empty() {
            return Err(Error::Config("client_id cannot be empty".to_string()));
        }

        if self.topic.is_empty() || self.topic.contains(['#', '+']) {
            return Err(Error::Config(format!(
                "topic '{}' must be non-empty and free of wildcards",
                self.topic
            )));
        }

        if self.delivery_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be > 0".to_string()));
        }

        if self.keep_alive_secs == 0 {
            return Err(Error::Config("keep_alive_secs must be > 0".to_string()));
        }

        if self.acquisition_backoff_min_ms > self.acquisition_backoff_max_ms {
            return Err(Error::Config(
                "acquisition_backoff_min_ms must be <= acquisition_backoff_max_ms".to_string(),
            ));
        }

        if endpoint.secure && self.verify_server_cert && self.ca_path.is_none() {
            return Err(Error::Config(
                "ca_path is required when verify_server_cert is enabled".to_string(),
            ));
        }

        Ok(())
    }

    pub fn endpoint(&self) -> Result<BrokerEndpoint> {
        BrokerEndpoint::parse(&self.broker_url)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(self.serial_path.clone(), self.baud_rate)
    }

    pub fn acquisition(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            backoff: IdleBackoff::new(
                Duration::from_millis(self.acquisition_backoff_min_ms),
                Duration::from_millis(self.acquisition_backoff_max_ms),
            ),
            max_read_errors: self.max_read_errors,
            ..AcquisitionConfig::default()
        }
    }

    /// Session options for the given key-exchange group
    pub fn session_options(&self, group: KeyExchangeGroup) -> Result<SessionOptions> {
        let endpoint = self.endpoint()?;
        let tls = endpoint.secure.then(|| TlsOptions {
            verify_server_cert: self.verify_server_cert,
            ca_path: self.ca_path.clone(),
            group,
        });

        Ok(SessionOptions {
            endpoint,
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            clean_session: self.clean_session,
            tls,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        })
    }
}

// Default value functions
fn default_serial_path() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_broker_url() -> String {
    "ssl://localhost:8883".to_string()
}

fn default_client_id() -> String {
    format!("pqbridge-{}", uuid::Uuid::new_v4().simple())
}

fn default_topic() -> String {
    "test/topic".to_string()
}

fn default_qos() -> QualityOfService {
    QualityOfService::AtLeastOnce
}

fn default_delivery_timeout_ms() -> u64 {
    10_000
}

fn default_keep_alive_secs() -> u64 {
    20
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_disconnect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_acquisition_backoff_min_ms() -> u64 {
    1
}

fn default_acquisition_backoff_max_ms() -> u64 {
    20
}

fn default_max_read_errors() -> u32 {
    10
}

fn default_true() -> bool {
    true
}
