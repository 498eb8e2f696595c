//! Broker session contract
//!
//! The publisher only needs three things from the broker client: queue a
//! publish and get a token back, wait a bounded time for that token to be
//! acknowledged, and disconnect. Connection loss and reconnects stay inside
//! the implementation.

use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QualityOfService {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(Error::Config(format!("QoS must be 0, 1 or 2, got {}", other))),
        }
    }
}

impl From<QualityOfService> for u8 {
    fn from(qos: QualityOfService) -> u8 {
        qos as u8
    }
}

impl From<QualityOfService> for rumqttc::QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Handle correlating a publish with its later acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryToken {
    pub id: u64,
    pub qos: QualityOfService,
}

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Client session to the broker
#[allow(async_fn_in_trait)]
pub trait BrokerSession {
    /// Queue a publish; does not wait for the broker
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QualityOfService,
    ) -> Result<DeliveryToken>;

    /// Wait at most `timeout` for the broker to acknowledge `token`
    async fn wait_for_delivery(&mut self, token: DeliveryToken, timeout: Duration) -> Result<()>;

    /// Disconnect, waiting at most `timeout` for the client to wind down
    async fn disconnect(&mut self, timeout: Duration) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording session for publisher tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Published {
        pub topic: String,
        pub payload: Bytes,
        pub qos: QualityOfService,
    }

    /// Outcome scripted for the next delivery wait
    #[derive(Debug, Clone, Copy)]
    pub enum Delivery {
        Ack,
        Timeout,
        Lost,
    }

    #[derive(Clone, Default)]
    pub struct RecordingSession {
        pub published: Arc<Mutex<Vec<Published>>>,
        pub outcomes: Arc<Mutex<VecDeque<Delivery>>>,
        pub reject_publish: bool,
        /// Never complete a publish, like a client whose queue is stuck
        pub stall_publish: bool,
        pub disconnected: Arc<Mutex<bool>>,
        next_id: u64,
    }

    impl BrokerSession for RecordingSession {
        async fn publish(
            &mut self,
            topic: &str,
            payload: Bytes,
            qos: QualityOfService,
        ) -> Result<DeliveryToken> {
            if self.stall_publish {
                std::future::pending::<()>().await;
            }
            if self.reject_publish {
                return Err(Error::Publish("client queue closed".into()));
            }
            self.published.lock().push(Published {
                topic: topic.to_string(),
                payload,
                qos,
            });
            self.next_id += 1;
            Ok(DeliveryToken { id: self.next_id, qos })
        }

        async fn wait_for_delivery(
            &mut self,
            token: DeliveryToken,
            timeout: Duration,
        ) -> Result<()> {
            let outcome = self.outcomes.lock().pop_front().unwrap_or(Delivery::Ack);
            match outcome {
                Delivery::Ack => Ok(()),
                Delivery::Timeout => Err(Error::DeliveryTimeout {
                    token: token.id,
                    timeout,
                }),
                Delivery::Lost => Err(Error::ConnectionLost("broker closed socket".into())),
            }
        }

        async fn disconnect(&mut self, _timeout: Duration) -> Result<()> {
            *self.disconnected.lock() = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_conversion() {
        assert_eq!(
            QualityOfService::try_from(1).unwrap(),
            QualityOfService::AtLeastOnce
        );
        assert!(QualityOfService::try_from(3).is_err());
        assert_eq!(u8::from(QualityOfService::ExactlyOnce), 2);
        assert_eq!(
            rumqttc::QoS::from(QualityOfService::AtMostOnce),
            rumqttc::QoS::AtMostOnce
        );
    }
}
