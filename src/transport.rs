//! MQTT transport: confirmed publishes and the reconnect loop.
//!
//! [`MqttTransport`] publishes one message at a time and reports success only
//! once the broker acknowledged that packet. [`MqttSession`] owns the rumqttc
//! event loop: it keeps reconnecting forever with capped exponential backoff,
//! flips the shared [`ConnectionState`] on connect and disconnect, and routes
//! inbound capture requests to the producers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, StateError,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::artifact::{Artifact, ArtifactKind, Topics};
use crate::config::Config;
use crate::connection::{Backoff, ConnectionState};

/// Capacity of the rumqttc request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the internal publish/ack event broadcast.
const ACK_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur while publishing.
#[derive(Debug)]
pub enum PublishError {
    /// Not connected to the broker
    NotConnected,

    /// The MQTT client rejected the request
    Client(rumqttc::ClientError),

    /// No acknowledgement within the publish timeout
    Timeout(Duration),

    /// Connection dropped before the publish was acknowledged
    Disconnected,

    /// The session event loop is gone
    Closed,

    /// Message body could not be encoded
    Encode(serde_json::Error),

    /// The packet exceeds the configured MQTT packet size limit
    TooLarge { size: usize, max: usize },
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::NotConnected => write!(f, "Not connected to broker"),
            PublishError::Client(e) => write!(f, "MQTT client error: {}", e),
            PublishError::Timeout(d) => {
                write!(f, "Publish not acknowledged within {}ms", d.as_millis())
            }
            PublishError::Disconnected => write!(f, "Connection lost before acknowledgement"),
            PublishError::Closed => write!(f, "MQTT session closed"),
            PublishError::Encode(e) => write!(f, "Failed to encode message: {}", e),
            PublishError::TooLarge { size, max } => {
                write!(f, "Packet of {} bytes exceeds limit of {} bytes", size, max)
            }
        }
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PublishError::Client(e) => Some(e),
            PublishError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rumqttc::ClientError> for PublishError {
    fn from(err: rumqttc::ClientError) -> Self {
        PublishError::Client(err)
    }
}

/// Something that can deliver a message to the broker.
///
/// `Ok` means the broker confirmed receipt; anything else is a failure the
/// caller must handle by buffering.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;
}

/// Encode an artifact and publish it on its topic with QoS 1.
pub async fn publish_artifact(
    transport: &dyn Transport,
    topics: &Topics,
    artifact: &Artifact,
) -> Result<(), PublishError> {
    let payload = artifact.encode_message().map_err(PublishError::Encode)?;
    let topic = topics.publish_topic(artifact.kind());
    transport.publish(&topic, payload, QoS::AtLeastOnce).await
}

/// Publish lifecycle events forwarded from the event loop to publishers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckEvent {
    /// A publish packet went out. `seq` is the position of the request in
    /// submission order, or `None` for packets resent after a reconnect,
    /// which belong to an earlier (already failed) publish call.
    Sent { pkid: u16, seq: Option<u64> },

    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) received.
    Acked(u16),

    /// The connection dropped.
    Reset,
}

/// Numbers fresh outgoing publishes in the order they were submitted and
/// tracks which packet ids are still unacknowledged, so packets
/// retransmitted after a reconnect are not mistaken for fresh publishes.
#[derive(Debug, Default)]
struct AckTracker {
    inflight: HashSet<u16>,
    stale: HashSet<u16>,
    next_seq: u64,
}

impl AckTracker {
    fn sent(&mut self, pkid: u16) -> AckEvent {
        if pkid != 0 {
            // rumqttc never reuses an id before its ack, so a known id is a resend
            if self.stale.contains(&pkid) || !self.inflight.insert(pkid) {
                return AckEvent::Sent { pkid, seq: None };
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        AckEvent::Sent {
            pkid,
            seq: Some(seq),
        }
    }

    /// A submitted publish was consumed by the event loop without going out.
    fn dropped(&mut self) {
        self.next_seq += 1;
    }

    fn acked(&mut self, pkid: u16) -> AckEvent {
        self.inflight.remove(&pkid);
        self.stale.remove(&pkid);
        AckEvent::Acked(pkid)
    }

    fn reset(&mut self) -> AckEvent {
        self.stale.extend(self.inflight.drain());
        AckEvent::Reset
    }
}

/// Wait until the publish submitted as request number `seq` is confirmed.
///
/// QoS 0 has no acknowledgement, so being sent is enough.
async fn await_confirmation(
    rx: &mut broadcast::Receiver<AckEvent>,
    qos: QoS,
    seq: u64,
) -> Result<(), PublishError> {
    let mut ours: Option<u16> = None;
    loop {
        match rx.recv().await {
            Ok(AckEvent::Sent { pkid, seq: Some(sent) }) if sent == seq => {
                if qos == QoS::AtMostOnce {
                    return Ok(());
                }
                ours = Some(pkid);
            }
            Ok(AckEvent::Acked(pkid)) if ours == Some(pkid) => return Ok(()),
            Ok(AckEvent::Reset) => return Err(PublishError::Disconnected),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Publish confirmation lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(PublishError::Closed),
        }
    }
}

/// Upper bound of the encoded size of a publish packet.
fn publish_packet_size(topic: &str, payload_len: usize) -> usize {
    // fixed header byte, up to 4 length bytes, topic length, packet id
    1 + 4 + 2 + topic.len() + 2 + payload_len
}

/// Publishing half of the MQTT connection.
pub struct MqttTransport {
    client: AsyncClient,
    acks: broadcast::Sender<AckEvent>,
    state: Arc<ConnectionState>,
    /// Serialises publishes; holds the number of requests submitted so far.
    submitted: Mutex<u64>,
    timeout: Duration,
    max_packet_size: usize,
}

impl MqttTransport {
    /// Build the MQTT client from configuration.
    ///
    /// Returns the transport and the session that must be spawned to drive
    /// the connection.
    pub fn new(config: &Config, state: Arc<ConnectionState>) -> (Self, MqttSession) {
        let device = config.device_name();
        let mut options = MqttOptions::new(&device, &config.broker_host, config.broker_port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(false);
        options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (acks, _) = broadcast::channel(ACK_CHANNEL_CAPACITY);

        let session = MqttSession {
            client: client.clone(),
            eventloop,
            acks: acks.clone(),
            tracker: AckTracker::default(),
            state: state.clone(),
            topics: Topics::new(device),
            backoff: Backoff::new(
                config.reconnect_base,
                config.reconnect_max,
                config.reconnect_stable,
            ),
            request_handlers: HashMap::new(),
        };

        let transport = Self {
            client,
            acks,
            state,
            submitted: Mutex::new(0),
            timeout: config.publish_timeout,
            max_packet_size: config.max_packet_size,
        };

        (transport, session)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        if !self.state.is_online() {
            return Err(PublishError::NotConnected);
        }

        let bytes = payload.len();
        let size = publish_packet_size(topic, bytes);
        if size > self.max_packet_size {
            return Err(PublishError::TooLarge {
                size,
                max: self.max_packet_size,
            });
        }

        let mut submitted = self.submitted.lock().await;
        let mut rx = self.acks.subscribe();

        self.client.publish(topic, qos, false, payload).await?;
        let seq = *submitted;
        *submitted += 1;

        match tokio::time::timeout(self.timeout, await_confirmation(&mut rx, qos, seq)).await {
            Ok(Ok(())) => {
                debug!(topic = %topic, bytes = bytes, "Publish confirmed");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PublishError::Timeout(self.timeout)),
        }
    }
}

/// Connection-owning half: drives the rumqttc event loop forever.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    acks: broadcast::Sender<AckEvent>,
    tracker: AckTracker,
    state: Arc<ConnectionState>,
    topics: Topics,
    backoff: Backoff,
    request_handlers: HashMap<ArtifactKind, mpsc::Sender<()>>,
}

impl MqttSession {
    /// Route server requests for `kind` to the given producer trigger.
    pub fn on_request(&mut self, kind: ArtifactKind, trigger: mpsc::Sender<()>) {
        self.request_handlers.insert(kind, trigger);
    }

    /// Run the event loop. Connection errors are retried indefinitely.
    pub async fn run(mut self) {
        info!(
            device = %self.topics.device(),
            "Starting MQTT session"
        );

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!(
                            session_present = ack.session_present,
                            "Connected to MQTT broker"
                        );
                        self.backoff.on_connected();
                        self.subscribe_requests();
                        self.state.set_online(true);
                    } else {
                        warn!(code = ?ack.code, "Broker refused connection");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_request(&publish.topic);
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    let event = self.tracker.acked(ack.pkid);
                    let _ = self.acks.send(event);
                }
                Ok(Event::Incoming(Packet::PubComp(comp))) => {
                    let event = self.tracker.acked(comp.pkid);
                    let _ = self.acks.send(event);
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("Subscription acknowledged");
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    let event = self.tracker.sent(pkid);
                    let _ = self.acks.send(event);
                }
                Ok(_) => {}
                Err(e) => {
                    if matches!(
                        e,
                        ConnectionError::MqttState(StateError::OutgoingPacketTooLarge { .. })
                    ) {
                        // The oversized request was discarded, not sent.
                        self.tracker.dropped();
                    }
                    self.state.set_online(false);
                    let event = self.tracker.reset();
                    let _ = self.acks.send(event);

                    self.backoff.on_disconnected();
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = self.backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "MQTT connection error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn subscribe_requests(&self) {
        for kind in ArtifactKind::all() {
            let topic = self.topics.request_topic(*kind);
            match self.client.try_subscribe(&topic, QoS::AtLeastOnce) {
                Ok(()) => debug!(topic = %topic, "Subscribing to request topic"),
                Err(e) => error!(topic = %topic, error = %e, "Failed to subscribe"),
            }
        }
    }

    fn handle_request(&self, topic: &str) {
        let Some(kind) = self.topics.parse_request(topic) else {
            debug!(topic = %topic, "Ignoring message on unexpected topic");
            return;
        };

        info!(kind = %kind, "Capture requested by server");
        match self.request_handlers.get(&kind) {
            Some(trigger) => {
                if trigger.try_send(()).is_err() {
                    debug!(kind = %kind, "Capture request already pending");
                }
            }
            None => warn!(kind = %kind, "No producer registered for request"),
        }
    }
}
