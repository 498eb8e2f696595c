//! MQTT broker session on top of `rumqttc`
//!
//! The `rumqttc` event loop is driven by a background tokio task. It forwards
//! what the session cares about (connection acknowledgements, outgoing
//! publish packet ids, PUBACK/PUBCOMP, incoming messages, connection loss)
//! over a channel. Once connected, errors are reported as connection loss and
//! the loop keeps polling, which makes `rumqttc` reconnect.
//!
//! Requests are queued without waiting: while the broker is unreachable the
//! event loop stops draining its request queue, and a full queue is reported
//! as a publish error instead of blocking the caller.

use crate::session::{BrokerSession, DeliveryToken, QualityOfService};
use crate::tls::TlsOptions;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Capacity of the client's request queue
const REQUEST_CAPACITY: usize = 16;

/// Broker host, port and transport security parsed from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl BrokerEndpoint {
    /// Parse `ssl://host:port`, `mqtts://`, `tls://`, `tcp://` or `mqtt://`
    pub fn parse(address: &str) -> Result<Self> {
        let url = Url::parse(address)
            .map_err(|e| Error::Config(format!("Invalid broker URL '{}': {}", address, e)))?;

        let (secure, default_port) = match url.scheme() {
            "ssl" | "mqtts" | "tls" => (true, 8883),
            "tcp" | "mqtt" => (false, 1883),
            other => {
                return Err(Error::Config(format!(
                    "Unsupported broker URL scheme '{}'",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config(format!("Broker URL '{}' has no host", address)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            secure,
        })
    }
}

/// Everything needed to open a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoint: BrokerEndpoint,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Required when the endpoint is secure
    pub tls: Option<TlsOptions>,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

/// Message received on a subscribed topic
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug)]
enum SessionEvent {
    Connected,
    ConnectFailed(String),
    /// An outgoing PUBLISH was written (packet id, 0 for QoS 0)
    Sent(u16),
    /// PUBACK (QoS 1) or PUBCOMP (QoS 2)
    Acked(u16),
    Subscribed { pkid: u16, granted: bool },
    Message(IncomingMessage),
    Lost(String),
}

type Subscriptions = Arc<Mutex<Vec<(String, QualityOfService)>>>;

/// Correlates delivery tokens with MQTT packet ids
///
/// `rumqttc` writes queued requests in order and reports each write as
/// `Outgoing::Publish(pkid)`, so the n-th first write belongs to the n-th
/// queued token. A packet id that is already in flight is a retransmission
/// after a reconnect and claims no new token. Tokens whose wait expired stay
/// tracked so their late acknowledgement is not credited to anyone else.
#[derive(Debug, Default)]
struct DeliveryTracker {
    unsent: VecDeque<DeliveryToken>,
    in_flight: HashMap<u16, u64>,
    confirmed: HashSet<u64>,
    abandoned: HashSet<u64>,
}

impl DeliveryTracker {
    fn queued(&mut self, token: DeliveryToken) {
        self.unsent.push_back(token);
    }

    fn sent(&mut self, pkid: u16) {
        if pkid != 0 && self.in_flight.contains_key(&pkid) {
            debug!("Packet {} retransmitted", pkid);
            return;
        }
        let Some(token) = self.unsent.pop_front() else {
            debug!("Outgoing publish {} matches no queued token", pkid);
            return;
        };
        if token.qos == QualityOfService::AtMostOnce {
            self.confirm(token.id);
        } else {
            self.in_flight.insert(pkid, token.id);
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        match self.in_flight.remove(&pkid) {
            Some(id) => self.confirm(id),
            None => debug!("Acknowledgement for unknown packet {}", pkid),
        }
    }

    fn confirm(&mut self, id: u64) {
        if self.abandoned.remove(&id) {
            debug!("Token {} confirmed after its wait expired", id);
        } else {
            self.confirmed.insert(id);
        }
    }

    fn take_confirmed(&mut self, id: u64) -> bool {
        self.confirmed.remove(&id)
    }

    fn abandon(&mut self, id: u64) {
        if !self.confirmed.remove(&id) {
            self.abandoned.insert(id);
        }
    }
}

/// `rumqttc`-backed broker session
pub struct MqttSession {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    driver: Option<JoinHandle<()>>,
    subscriptions: Subscriptions,
    deliveries: DeliveryTracker,
    inbox: VecDeque<IncomingMessage>,
    connect_timeout: Duration,
    next_id: u64,
}

impl MqttSession {
    /// Connect and wait for the broker's CONNACK
    #[instrument(
        skip(options),
        fields(host = %options.endpoint.host, port = options.endpoint.port)
    )]
    pub async fn connect(options: &SessionOptions) -> Result<Self> {
        let mut mqtt = MqttOptions::new(
            options.client_id.clone(),
            options.endpoint.host.clone(),
            options.endpoint.port,
        );
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(options.clean_session);

        if options.endpoint.secure {
            let tls = options
                .tls
                .as_ref()
                .ok_or_else(|| Error::Tls("secure broker URL without TLS options".to_string()))?;
            let config = tls.client_config()?;
            mqtt.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(
                config,
            ))));
        }

        info!("Creating client {}", options.client_id);
        let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
        let (tx, mut events) = mpsc::unbounded_channel();
        let subscriptions: Subscriptions = Arc::default();
        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            Arc::clone(&subscriptions),
            tx,
            options.reconnect_delay,
        ));

        match tokio::time::timeout(options.connect_timeout, events.recv()).await {
            Ok(Some(SessionEvent::Connected)) => {
                info!("Connected to {}:{}", options.endpoint.host, options.endpoint.port);
                Ok(Self {
                    client,
                    events,
                    driver: Some(driver),
                    subscriptions,
                    deliveries: DeliveryTracker::default(),
                    inbox: VecDeque::new(),
                    connect_timeout: options.connect_timeout,
                    next_id: 0,
                })
            }
            Ok(Some(SessionEvent::ConnectFailed(cause))) => Err(Error::Connect(cause)),
            Ok(Some(other)) => {
                driver.abort();
                Err(Error::Connect(format!("unexpected event before CONNACK: {:?}", other)))
            }
            Ok(None) => Err(Error::Connect("event loop stopped".to_string())),
            Err(_) => {
                driver.abort();
                Err(Error::Connect(format!(
                    "no CONNACK within {:?}",
                    options.connect_timeout
                )))
            }
        }
    }

    /// Subscribe and wait for the SUBACK; the subscription is renewed after reconnects
    pub async fn subscribe(&mut self, topic: &str, qos: QualityOfService) -> Result<()> {
        let timeout = self.connect_timeout;
        self.client
            .try_subscribe(topic, qos.into())
            .map_err(|e| Error::ConnectionLost(e.to_string()))?;
        self.subscriptions.lock().push((topic.to_string(), qos));

        tokio::time::timeout(timeout, self.subscription_ack(topic))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn subscription_ack(&mut self, topic: &str) -> Result<()> {
        loop {
            match self.next_event().await? {
                SessionEvent::Subscribed { granted: true, pkid } => {
                    debug!("Subscription {} acknowledged", pkid);
                    return Ok(());
                }
                SessionEvent::Subscribed { granted: false, .. } => {
                    return Err(Error::Connect(format!("subscription to {} refused", topic)))
                }
                _ => {}
            }
        }
    }

    /// Next message on a subscribed topic; `None` once the session has ended
    pub async fn next_message(&mut self) -> Option<IncomingMessage> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Some(message);
            }
            let event = self.events.recv().await?;
            self.route(event);
        }
    }

    /// Next event not consumed by delivery tracking or the inbox
    async fn next_event(&mut self) -> Result<SessionEvent> {
        loop {
            let event = self
                .events
                .recv()
                .await
                .ok_or_else(|| Error::ConnectionLost("event loop stopped".to_string()))?;
            if let Some(event) = self.route(event) {
                return Ok(event);
            }
        }
    }

    async fn confirmation(&mut self, id: u64) -> Result<()> {
        while !self.deliveries.take_confirmed(id) {
            let event = self
                .events
                .recv()
                .await
                .ok_or_else(|| Error::ConnectionLost("event loop stopped".to_string()))?;
            self.route(event);
        }
        Ok(())
    }

    /// Apply delivery and message events; anything else is handed back
    fn route(&mut self, event: SessionEvent) -> Option<SessionEvent> {
        match event {
            SessionEvent::Sent(pkid) => self.deliveries.sent(pkid),
            SessionEvent::Acked(pkid) => self.deliveries.acknowledged(pkid),
            SessionEvent::Message(message) => self.inbox.push_back(message),
            SessionEvent::Lost(cause) => warn!("Connection lost. Cause: {}", cause),
            other => return Some(other),
        }
        None
    }

    /// Apply events that have already arrived
    fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let Some(other) = self.route(event) {
                debug!("Discarding session event {:?}", other);
            }
        }
    }
}

impl BrokerSession for MqttSession {
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QualityOfService,
    ) -> Result<DeliveryToken> {
        self.pump();
        self.client
            .try_publish(topic, qos.into(), false, payload.to_vec())
            .map_err(|e| Error::Publish(format!("request queue rejected publish: {}", e)))?;

        self.next_id += 1;
        let token = DeliveryToken {
            id: self.next_id,
            qos,
        };
        self.deliveries.queued(token);
        Ok(token)
    }

    async fn wait_for_delivery(&mut self, token: DeliveryToken, timeout: Duration) -> Result<()> {
        let outcome = match tokio::time::timeout(timeout, self.confirmation(token.id)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeliveryTimeout {
                token: token.id,
                timeout,
            }),
        };
        if outcome.is_err() {
            self.deliveries.abandon(token.id);
        }
        outcome
    }

    async fn disconnect(&mut self, timeout: Duration) -> Result<()> {
        let Some(mut driver) = self.driver.take() else {
            return Ok(());
        };
        if let Err(e) = self.client.try_disconnect() {
            driver.abort();
            return Err(Error::ConnectionLost(e.to_string()));
        }

        match tokio::time::timeout(timeout, &mut driver).await {
            Ok(_) => {
                info!("Disconnected");
                Ok(())
            }
            Err(_) => {
                driver.abort();
                Err(Error::Timeout)
            }
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Event loop driver
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
    events: mpsc::UnboundedSender<SessionEvent>,
    reconnect_delay: Duration,
) {
    let mut connected_once = false;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if connected_once {
                    info!("Reconnected to broker");
                    if !ack.session_present {
                        resubscribe(&client, &subscriptions);
                    }
                }
                connected_once = true;
                SessionEvent::Connected
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => SessionEvent::Acked(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => SessionEvent::Acked(comp.pkid),
            Ok(Event::Incoming(Packet::SubAck(ack))) => SessionEvent::Subscribed {
                pkid: ack.pkid,
                granted: !ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure)),
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                SessionEvent::Message(IncomingMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                })
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => SessionEvent::Sent(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => continue,
            Err(ConnectionError::RequestsDone) => break,
            Err(e) if !connected_once => {
                let _ = events.send(SessionEvent::ConnectFailed(e.to_string()));
                break;
            }
            Err(e) => {
                warn!("Connection lost. Cause: {}", e);
                if events.send(SessionEvent::Lost(e.to_string())).is_err() {
                    break;
                }
                tokio::time::sleep(reconnect_delay).await;
                continue;
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }
}

fn resubscribe(client: &AsyncClient, subscriptions: &Subscriptions) {
    for (topic, qos) in subscriptions.lock().iter() {
        if let Err(e) = client.try_subscribe(topic.as_str(), (*qos).into()) {
            warn!("Failed to renew subscription to {}: {}", topic, e);
        }
    }
}

#[cfg(test)]
mod broker {
    //! Loopback MQTT 3.1.1 broker speaking just enough of the protocol

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::UnboundedSender;

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const PUBACK: u8 = 0x40;
    const PUBREC: u8 = 0x50;
    const PUBCOMP: u8 = 0x70;

    /// Payload the broker sends to every new subscriber
    pub const GREETING: &[u8] = b"12.50,45.20";

    pub struct Publish {
        pub topic: String,
        pub qos: u8,
        pub payload: Vec<u8>,
    }

    pub enum Received {
        Publish(Publish),
        Subscribe(String),
    }

    pub async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accept one client and answer its CONNECT
    pub async fn accept(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header >> 4, 1, "expected CONNECT");
        stream.write_all(&CONNACK).await.unwrap();
        stream
    }

    fn ack(kind: u8, pkid: u16) -> [u8; 4] {
        let [hi, lo] = pkid.to_be_bytes();
        [kind, 0x02, hi, lo]
    }

    fn message(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x30, (2 + topic.len() + payload.len()) as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Grant a SUBSCRIBE; returns the topic filter
    pub async fn answer_subscribe(stream: &mut TcpStream, body: &[u8]) -> String {
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let topic = String::from_utf8_lossy(&body[4..4 + len]).into_owned();
        let granted = body[4 + len];
        let _ = stream
            .write_all(&[0x90, 0x03, body[0], body[1], granted])
            .await;
        topic
    }

    /// Serve a connection until the client disconnects
    ///
    /// Only the first `ack_limit` QoS 1/2 publishes are acknowledged.
    pub async fn serve(mut stream: TcpStream, ack_limit: usize, seen: UnboundedSender<Received>) {
        let mut acked = 0;
        while let Ok((header, body)) = read_packet(&mut stream).await {
            match header >> 4 {
                3 => {
                    let qos = (header >> 1) & 0x03;
                    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
                    let mut rest = &body[2 + topic_len..];
                    if qos > 0 {
                        let pkid = u16::from_be_bytes([rest[0], rest[1]]);
                        rest = &rest[2..];
                        if acked < ack_limit {
                            acked += 1;
                            let kind = if qos == 1 { PUBACK } else { PUBREC };
                            let _ = stream.write_all(&ack(kind, pkid)).await;
                        }
                    }
                    let _ = seen.send(Received::Publish(Publish {
                        topic,
                        qos,
                        payload: rest.to_vec(),
                    }));
                }
                6 => {
                    let pkid = u16::from_be_bytes([body[0], body[1]]);
                    let _ = stream.write_all(&ack(PUBCOMP, pkid)).await;
                }
                8 => {
                    let topic = answer_subscribe(&mut stream, &body).await;
                    let _ = stream.write_all(&message(&topic, GREETING)).await;
                    let _ = seen.send(Received::Subscribe(topic));
                }
                12 => {
                    let _ = stream.write_all(&[0xD0, 0x00]).await;
                }
                14 => break,
                _ => {}
            }
        }
    }
}
