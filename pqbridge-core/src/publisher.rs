//! Publish loop: mailbox → broker
//!
//! Runs on the main control flow. Each iteration takes the pending frame, if
//! any, publishes it and waits a bounded time for the broker to confirm it.
//! A failed delivery is logged and counted; the frame is not retried since a
//! newer reading will replace it anyway. Publishing and confirmation together
//! never take longer than the delivery timeout.

use crate::backoff::IdleBackoff;
use crate::config::BridgeConfig;
use crate::frame::SensorFrame;
use crate::mailbox::FrameBuffer;
use crate::metrics::Metrics;
use crate::session::{BrokerSession, QualityOfService};
use crate::shutdown::ShutdownFlag;
use crate::{Error, Result};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Publisher-side view of the broker connection
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub address: String,
    pub client_id: String,
    pub topic: String,
    pub qos: QualityOfService,
    pub timeout: Duration,
    payload: Option<Bytes>,
}

impl ClientConnection {
    pub fn new(
        address: impl Into<String>,
        client_id: impl Into<String>,
        topic: impl Into<String>,
        qos: QualityOfService,
        timeout: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            client_id: client_id.into(),
            topic: topic.into(),
            qos,
            timeout,
            payload: None,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.broker_url.clone(),
            config.client_id.clone(),
            config.topic.clone(),
            config.qos,
            config.delivery_timeout(),
        )
    }

    /// Last payload handed to the broker
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    fn replace_payload(&mut self, payload: Bytes) -> Bytes {
        self.payload.insert(payload).clone()
    }
}

/// Outcome counters of one publish loop run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: u64,
    pub failed: u64,
}

/// The consumer side of the bridge
pub struct PublishTask<S: BrokerSession> {
    session: S,
    connection: ClientConnection,
    poll: IdleBackoff,
    metrics: Metrics,
}

impl<S: BrokerSession> PublishTask<S> {
    pub fn new(
        session: S,
        connection: ClientConnection,
        poll_interval: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            session,
            connection,
            poll: IdleBackoff::constant(poll_interval),
            metrics,
        }
    }

    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    /// Drain the mailbox until `terminate` is set
    pub async fn run(
        &mut self,
        mailbox: &FrameBuffer,
        terminate: &ShutdownFlag,
    ) -> PublishSummary {
        info!(
            "Publishing to topic {}, with client {}",
            self.connection.topic, self.connection.client_id
        );

        let mut summary = PublishSummary::default();
        while !terminate.is_requested() {
            let Some(frame) = mailbox.try_take() else {
                self.poll.sleep_async().await;
                continue;
            };

            match self.deliver(frame).await {
                Ok(()) => summary.published += 1,
                Err(e) => {
                    summary.failed += 1;
                    self.metrics.record_publish_failure();
                    if e.is_transient() {
                        warn!("Publish failed: {}", e);
                    } else {
                        error!("Publish failed: {}", e);
                    }
                }
            }
        }

        info!(
            "Publish loop finished ({} delivered, {} failed)",
            summary.published, summary.failed
        );
        summary
    }

    /// Publish one frame and wait for its delivery confirmation
    pub async fn deliver(&mut self, frame: SensorFrame) -> Result<()> {
        debug!(
            "Frame #{} is {} ms old at publish",
            frame.sequence(),
            frame.age_millis()
        );
        let payload = self.connection.replace_payload(frame.to_payload());
        let limit = self.connection.timeout;
        let started = Instant::now();

        let publish = self
            .session
            .publish(&self.connection.topic, payload.clone(), self.connection.qos);
        let token = tokio::time::timeout(limit, publish)
            .await
            .map_err(|_| Error::Timeout)??;
        self.session
            .wait_for_delivery(token, limit.saturating_sub(started.elapsed()))
            .await?;

        let latency = started.elapsed().as_millis() as u64;
        self.metrics.record_publish(payload.len(), latency);
        info!(
            "Message {} with delivery token {} delivered in {} ms",
            String::from_utf8_lossy(&payload),
            token,
            latency
        );
        Ok(())
    }

    /// Disconnect the underlying session
    pub async fn disconnect(&mut self, timeout: Duration) -> Result<()> {
        self.session.disconnect(timeout).await
    }
}
