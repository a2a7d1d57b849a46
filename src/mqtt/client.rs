//! MQTT 3.1.1 session state machine.
//!
//! [`Client`] owns one broker connection at a time and drives it through the
//! CONNECT/CONNACK handshake, publish/subscribe/unsubscribe exchanges,
//! keep-alive pings and DISCONNECT. It is single-threaded and blocking: every
//! wait is a transport read bounded by a timeout from [`Options`], so a
//! keep-alive loop built on top of it never stalls indefinitely.
//!
//! # Lifecycle
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──CONNACK 0──▶ Connected
//!       ▲                          │                        │
//!       └──── refusal / failure ───┘                        │
//!       └──── disconnect(), transport failure, malformed ───┘
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use minimqtt::mqtt::{Client, Options, QoS};
//! # use core::time::Duration;
//! # use minimqtt::mqtt::Platform;
//! # use minimqtt::network::{Close, Connect, Connection, Read, Timeout, TransportMode, Write};
//! # struct Net;
//! # struct Conn;
//! # impl Read for Conn { type Error = (); fn read(&mut self, _: &mut [u8]) -> Result<usize, ()> { Ok(0) } }
//! # impl Write for Conn {
//! #     type Error = ();
//! #     fn write(&mut self, b: &[u8]) -> Result<usize, ()> { Ok(b.len()) }
//! #     fn flush(&mut self) -> Result<(), ()> { Ok(()) }
//! # }
//! # impl Close for Conn { type Error = (); fn close(self) -> Result<(), ()> { Ok(()) } }
//! # impl Timeout for Conn { type Error = (); fn set_timeout(&mut self, _: Duration) -> Result<(), ()> { Ok(()) } }
//! # impl Connection for Conn {}
//! # impl Connect for Net {
//! #     type Connection = Conn;
//! #     type Error = ();
//! #     fn connect(&mut self, _: &str, _: u16, _: TransportMode) -> Result<Conn, ()> { Ok(Conn) }
//! # }
//! # struct Board;
//! # impl Platform for Board {
//! #     fn unique_id(&self) -> &[u8] { b"\x01\x02" }
//! #     fn random(&mut self) -> u32 { 4 }
//! #     fn now_ms(&self) -> u64 { 0 }
//! #     fn delay(&mut self, _: Duration) {}
//! #     fn hard_reset(&mut self) {}
//! # }
//! let on_led = |_topic: &str, payload: &[u8]| {
//!     let _on = payload == b"ON";
//! };
//!
//! let options = Options::new("io.adafruit.com")
//!     .with_credentials("user", "aio-key")
//!     .with_keep_alive(60);
//! let mut client: Client<'_, _, _> = Client::new(Net, Board, options)?;
//!
//! client.connect(true)?;
//! client.subscribe("user/feeds/led", Some(&on_led), QoS::AtMostOnce)?;
//! client.publish("user/feeds/temperature", b"23.5", QoS::AtLeastOnce, false)?;
//! loop {
//!     client.loop_once(Duration::from_secs(1))?;
//! }
//! # Ok::<(), minimqtt::mqtt::Error>(())
//! ```

use crate::fmt::{debug, info, trace, warning};
use crate::mqtt::error::{EncodingError, Error, MalformedFrame, ProtocolViolation};
use crate::mqtt::packet::{
    self, ConnAck, Connect, LastWill, MAX_CLIENT_ID_LEN, MAX_SUBSCRIBE_TOPICS, MQTT_MSG_MAX_SZ,
    MQTT_MSG_SZ_LIM, PacketType, Publish, QoS, SubAck,
};
use crate::mqtt::platform::{Platform, generate_client_id};
use crate::mqtt::registry::{Handler, MAX_TOPIC_LEN, Registry};
use crate::network::error::Error as TransportError;
use crate::network::{self, Close, Connect as NetworkConnect, Connection, Read, Timeout, TransportMode, Write};
use core::time::Duration;
use heapless::{String, Vec};

/// Maximum number of timed-out SUBSCRIBE/UNSUBSCRIBE requests kept on record.
pub const MAX_PENDING_REQUESTS: usize = 4;

/// Room for a fixed header, a packet identifier, a QoS byte and a topic of
/// [`MAX_TOPIC_LEN`] bytes.
const HEADER_BUF_LEN: usize = MAX_TOPIC_LEN + 16;

/// Connection lifecycle state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// No transport is open. Initial and terminal state.
    Disconnected,
    /// CONNECT written, CONNACK not yet received.
    Connecting,
    /// CONNACK accepted; all operations are available.
    Connected,
}

/// Session event callbacks.
///
/// Every method has an empty default, so implementors override only what
/// they need. Register one with [`Client::set_observer`].
pub trait Observer {
    /// The broker accepted the connection.
    fn on_connect(&self, session_present: bool, return_code: u8) {
        let _ = (session_present, return_code);
    }

    /// The session left the `Connected` state.
    fn on_disconnect(&self) {}

    /// A QoS 0 publish was written (`None`) or a QoS 1 publish was
    /// acknowledged (`Some(packet_id)`).
    fn on_publish(&self, packet_id: Option<u16>) {
        let _ = packet_id;
    }

    /// SUBACK granted `granted_qos` for `topic`.
    fn on_subscribe(&self, topic: &str, granted_qos: QoS) {
        let _ = (topic, granted_qos);
    }

    /// UNSUBACK confirmed `topic` was removed.
    fn on_unsubscribe(&self, topic: &str) {
        let _ = topic;
    }
}

/// Configuration options for the MQTT client.
///
/// This is the single configuration structure for a session. Fields are
/// public; the `with_*` methods are shorthand for building one in an
/// expression.
///
/// ```rust
/// use minimqtt::mqtt::Options;
/// use minimqtt::network::TransportMode;
///
/// let options = Options::new("broker.local")
///     .with_mode(TransportMode::Tcp)
///     .with_client_id("greenhouse-01")
///     .with_keep_alive(30);
/// assert_eq!(options.port(), 1883);
/// ```
#[derive(Debug, Clone)]
pub struct Options<'a> {
    /// Broker host name or address.
    pub broker: &'a str,
    /// Broker port; `None` picks the default for [`Options::mode`].
    pub port: Option<u16>,
    /// Plain TCP or TLS.
    pub mode: TransportMode,
    /// Client identifier. When `None`, one is generated from the platform's
    /// unique id with [`Options::client_id_prefix`].
    pub client_id: Option<&'a str>,
    /// Prefix for generated client identifiers.
    pub client_id_prefix: &'a str,
    /// Accept caller-supplied identifiers longer than 23 bytes. Not every
    /// broker supports them.
    pub extended_client_id: bool,
    /// Username for broker authentication.
    pub username: Option<&'a str>,
    /// Password for broker authentication; requires a username.
    pub password: Option<&'a str>,
    /// Last will and testament.
    pub last_will: Option<LastWill<'a>>,
    /// Keep-alive interval in seconds; 0 disables pings.
    pub keep_alive_seconds: u16,
    /// Bound on the CONNACK wait.
    pub connect_timeout: Duration,
    /// Bound on every PUBACK/SUBACK/UNSUBACK/PINGRESP wait.
    pub ack_timeout: Duration,
    /// Largest outbound payload accepted by [`Client::publish`].
    pub max_payload_size: usize,
}

impl<'a> Options<'a> {
    /// Defaults: TLS, generated `cpy…` client id, 60 s keep-alive, 10 s
    /// timeouts and a 10 MB payload limit.
    pub fn new(broker: &'a str) -> Self {
        Self {
            broker,
            port: None,
            mode: TransportMode::Tls,
            client_id: None,
            client_id_prefix: "cpy",
            extended_client_id: false,
            username: None,
            password: None,
            last_will: None,
            keep_alive_seconds: 60,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            max_payload_size: MQTT_MSG_SZ_LIM,
        }
    }

    /// Port to connect to.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(self.mode.default_port())
    }

    /// Connect to `port` instead of the default for the mode.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Choose plain TCP or TLS.
    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Use a fixed client identifier.
    pub fn with_client_id(mut self, client_id: &'a str) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Prefix for the generated identifier.
    pub fn with_client_id_prefix(mut self, prefix: &'a str) -> Self {
        self.client_id_prefix = prefix;
        self
    }

    /// Allow identifiers longer than 23 bytes.
    pub fn with_extended_client_id(mut self, extended: bool) -> Self {
        self.extended_client_id = extended;
        self
    }

    /// Authenticate with `username` and `password`.
    pub fn with_credentials(mut self, username: &'a str, password: &'a str) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    /// Register a last will.
    pub fn with_last_will(mut self, will: LastWill<'a>) -> Self {
        self.last_will = Some(will);
        self
    }

    /// Keep-alive interval in seconds; 0 disables pings.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive_seconds = seconds;
        self
    }

    /// Bound on the CONNACK wait.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound on acknowledgement waits.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Largest payload `publish` accepts.
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }
}

/// An outbound message for [`Client::publish_multiple`].
#[derive(Debug, Clone, Copy)]
pub struct Message<'m> {
    /// Destination topic.
    pub topic: &'m str,
    /// Message body.
    pub payload: &'m [u8],
    /// Delivery guarantee.
    pub qos: QoS,
    /// Ask the broker to retain the message.
    pub retain: bool,
}

impl<'m> Message<'m> {
    /// A QoS 0, non-retained message.
    pub fn new(topic: &'m str, payload: &'m [u8]) -> Self {
        Self {
            topic,
            payload,
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

/// An in-flight QoS 1 PUBLISH awaiting its PUBACK.
///
/// It stays recorded after an [`Error::AckTimeout`] so the caller can
/// [`retry`](Client::retry_pending) or [`abandon`](Client::abandon_pending) it.
#[derive(Debug, Clone)]
pub struct PendingAck<const BUF: usize> {
    packet_id: u16,
    topic: String<MAX_TOPIC_LEN>,
    payload: Vec<u8, BUF>,
    retain: bool,
    submitted_at_ms: u64,
}

impl<const BUF: usize> PendingAck<BUF> {
    /// Identifier the PUBACK must carry.
    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    /// Topic the message was published to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Copy of the payload, kept for redelivery.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// RETAIN flag of the original publish.
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Platform clock reading when the PUBLISH was (last) written.
    pub fn submitted_at_ms(&self) -> u64 {
        self.submitted_at_ms
    }
}

/// Kind of acknowledged request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    /// Waits for SUBACK.
    Subscribe,
    /// Waits for UNSUBACK.
    Unsubscribe,
}

/// A SUBSCRIBE or UNSUBSCRIBE still waiting for its acknowledgement.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingRequest {
    /// Identifier the acknowledgement must carry.
    pub packet_id: u16,
    /// SUBSCRIBE or UNSUBSCRIBE.
    pub kind: RequestKind,
    /// Platform clock reading when the request was written.
    pub submitted_at_ms: u64,
}

/// What [`Client::poll_once`] found on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Incoming {
    /// CONNACK outside of [`Client::connect`].
    ConnAck(ConnAck),
    /// A PUBLISH was decoded, acknowledged if QoS 1, and handed to the
    /// registry. `dispatched` is false when no handler matched its topic.
    Publish {
        /// Identifier of a QoS 1 message, already acknowledged.
        packet_id: Option<u16>,
        /// QoS the message was delivered with.
        qos: QoS,
        /// A registered handler received the message.
        dispatched: bool,
    },
    /// PUBACK for the given packet identifier.
    PubAck(u16),
    /// SUBACK, with one return code per requested topic.
    SubAck(SubAck),
    /// UNSUBACK for the given packet identifier.
    UnsubAck(u16),
}

/// Reply a blocking call is waiting for.
#[derive(Debug, Clone, Copy)]
enum Expect {
    PubAck(u16),
    SubAck(u16),
    UnsubAck(u16),
    PingResp,
}

/// Result of reading at most one frame.
#[derive(Debug, Clone, Copy)]
enum Polled {
    /// Nothing arrived before the timeout.
    Idle,
    PingResp,
    Packet(Incoming),
}

/// An MQTT 3.1.1 client session.
///
/// # Type Parameters
///
/// * `N` - the connector that opens transport connections
/// * `P` - board services: client-id material, clock, hard reset
/// * `MAX_SUBS` - capacity of the subscription registry
/// * `BUF` - largest inbound frame body and largest QoS 1 payload kept for
///   redelivery; also bounds the encoded CONNECT packet
pub struct Client<'a, N, P, const MAX_SUBS: usize = 8, const BUF: usize = 1024>
where
    N: NetworkConnect,
    P: Platform,
{
    network: N,
    platform: P,
    options: Options<'a>,
    generated_id: Option<String<MAX_CLIENT_ID_LEN>>,
    connection: Option<N::Connection>,
    state: State,
    clean_session: bool,
    packet_id: u16,
    registry: Registry<'a, MAX_SUBS>,
    observer: Option<&'a dyn Observer>,
    pending_publish: Option<PendingAck<BUF>>,
    pending_requests: Vec<PendingRequest, MAX_PENDING_REQUESTS>,
    rx: Vec<u8, BUF>,
    last_outbound_ms: u64,
}

impl<N, P, const MAX_SUBS: usize, const BUF: usize> core::fmt::Debug for Client<'_, N, P, MAX_SUBS, BUF>
where
    N: NetworkConnect,
    P: Platform,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id())
            .field("state", &self.state)
            .field("clean_session", &self.clean_session)
            .field("subscriptions", &self.registry.len())
            .field("pending_publish", &self.pending_publish.as_ref().map(|p| p.packet_id))
            .field("pending_requests", &self.pending_requests.len())
            .finish()
    }
}

impl<'a, N, P, const MAX_SUBS: usize, const BUF: usize> Client<'a, N, P, MAX_SUBS, BUF>
where
    N: NetworkConnect,
    P: Platform,
{
    /// Create a disconnected client.
    ///
    /// When `options.client_id` is `None` an identifier is generated here,
    /// so it stays the same across reconnects.
    ///
    /// # Errors
    ///
    /// * [`EncodingError::InvalidClientId`] - the generated identifier would
    ///   exceed 23 bytes
    /// * [`EncodingError::PayloadTooLarge`] - `max_payload_size` is above the
    ///   protocol maximum
    pub fn new(network: N, mut platform: P, options: Options<'a>) -> Result<Self, Error> {
        if options.max_payload_size > MQTT_MSG_MAX_SZ {
            return Err(EncodingError::PayloadTooLarge.into());
        }
        let generated_id = match options.client_id {
            Some(_) => None,
            None => Some(generate_client_id(&mut platform, options.client_id_prefix)?),
        };
        Ok(Self {
            network,
            platform,
            options,
            generated_id,
            connection: None,
            state: State::Disconnected,
            clean_session: true,
            packet_id: 0,
            registry: Registry::new(),
            observer: None,
            pending_publish: None,
            pending_requests: Vec::new(),
            rx: Vec::new(),
            last_outbound_ms: 0,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the session is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// The identifier sent in CONNECT.
    pub fn client_id(&self) -> &str {
        match (self.options.client_id, &self.generated_id) {
            (Some(id), _) => id,
            (None, Some(id)) => id.as_str(),
            (None, None) => "",
        }
    }

    /// Active configuration.
    pub fn options(&self) -> &Options<'a> {
        &self.options
    }

    /// Clean-session flag of the current (or last) connection.
    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Registered subscriptions.
    pub fn registry(&self) -> &Registry<'a, MAX_SUBS> {
        &self.registry
    }

    /// Board services.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Mutable access to the board services.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// The in-flight QoS 1 publish, if any.
    pub fn pending_publish(&self) -> Option<&PendingAck<BUF>> {
        self.pending_publish.as_ref()
    }

    /// SUBSCRIBE/UNSUBSCRIBE requests left unacknowledged by a timeout.
    pub fn pending_requests(&self) -> &[PendingRequest] {
        &self.pending_requests
    }

    /// Register session callbacks.
    pub fn set_observer(&mut self, observer: &'a dyn Observer) {
        self.observer = Some(observer);
    }

    /// Set or clear the last will. Must be called before [`connect`](Self::connect).
    pub fn set_last_will(&mut self, will: Option<LastWill<'a>>) -> Result<(), Error> {
        if self.state != State::Disconnected {
            return Err(Error::AlreadyConnected);
        }
        if let Some(will) = &will {
            packet::validate_topic(will.topic)?;
        }
        debug!("Setting last will properties");
        self.options.last_will = will;
        Ok(())
    }

    /// Largest payload [`publish`](Self::publish) accepts.
    pub fn max_payload_size(&self) -> usize {
        self.options.max_payload_size
    }

    /// Change the payload limit. Values above 268,435,455 bytes are rejected.
    pub fn set_max_payload_size(&mut self, size: usize) -> Result<(), Error> {
        if size > MQTT_MSG_MAX_SZ {
            return Err(EncodingError::PayloadTooLarge.into());
        }
        self.options.max_payload_size = size;
        Ok(())
    }

    /// Open the transport and perform the CONNECT/CONNACK handshake.
    ///
    /// Returns whether the broker reports a session from a previous
    /// connection.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyConnected`] - the session is not `Disconnected`
    /// * [`Error::Encoding`] - invalid identity or credentials; nothing was
    ///   opened
    /// * [`Error::Transport`] - the connection could not be opened or written
    /// * [`Error::AckTimeout`] - no CONNACK within `connect_timeout`
    /// * [`Error::ProtocolViolation`] - the reply is not `0x20 0x02 ..`
    /// * [`Error::ConnectionRefused`] - non-zero CONNACK return code
    ///
    /// Every error leaves the session `Disconnected`.
    ///
    /// On success, timed-out SUBSCRIBE/UNSUBSCRIBE records are dropped. The
    /// in-flight QoS 1 publish survives only when the broker resumed the
    /// previous session, so it can still be [retried](Self::retry_pending).
    pub fn connect(&mut self, clean_session: bool) -> Result<bool, Error> {
        if self.state != State::Disconnected {
            return Err(Error::AlreadyConnected);
        }

        let mut frame = [0u8; BUF];
        let len = {
            let connect = Connect {
                client_id: self.client_id(),
                clean_session,
                keep_alive: self.options.keep_alive_seconds,
                username: self.options.username,
                password: self.options.password,
                will: self.options.last_will,
                extended_client_id: self.options.extended_client_id,
            };
            packet::encode_connect(&mut frame, &connect)?
        };

        self.state = State::Connecting;
        debug!(
            "Connecting to {}:{} as {}",
            self.options.broker,
            self.options.port(),
            self.client_id()
        );
        let mut connection = match self
            .network
            .connect(self.options.broker, self.options.port(), self.options.mode)
        {
            Ok(connection) => connection,
            Err(_) => {
                self.state = State::Disconnected;
                return Err(TransportError::ConnectFailed.into());
            }
        };

        match handshake(&mut connection, &frame[..len], self.options.connect_timeout) {
            Ok(ack) => {
                self.connection = Some(connection);
                self.state = State::Connected;
                self.clean_session = clean_session;
                // a new connection never sees acks for requests of the old one
                self.pending_requests.clear();
                if clean_session || !ack.session_present {
                    self.pending_publish = None;
                }
                self.last_outbound_ms = self.platform.now_ms();
                info!("Connected, session present: {}", ack.session_present);
                if let Some(observer) = self.observer {
                    observer.on_connect(ack.session_present, ack.return_code);
                }
                Ok(ack.session_present)
            }
            Err(err) => {
                warning!("Connection attempt failed");
                let _ = connection.close();
                self.state = State::Disconnected;
                Err(err)
            }
        }
    }

    /// Send DISCONNECT and close the transport.
    ///
    /// The session is `Disconnected` afterwards even if the write or close
    /// failed; that failure is still reported.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        if self.state != State::Connected {
            return Err(Error::NotConnected);
        }
        let Some(mut connection) = self.connection.take() else {
            self.state = State::Disconnected;
            return Err(Error::NotConnected);
        };
        debug!("Sending DISCONNECT packet to server");
        let written = send(&mut connection, &[&packet::DISCONNECT]);
        let closed = connection.close();
        self.state = State::Disconnected;
        if let Some(observer) = self.observer {
            observer.on_disconnect();
        }
        written?;
        closed.map_err(|_| TransportError::CloseError)?;
        Ok(())
    }

    /// Disconnect if connected; otherwise do nothing.
    pub fn deinit(&mut self) -> Result<(), Error> {
        if self.is_connected() {
            self.disconnect()
        } else {
            Ok(())
        }
    }

    /// Send PINGREQ and wait for PINGRESP.
    ///
    /// Anything other than PINGRESP arriving first is a
    /// [`ProtocolViolation::MissingPingResp`].
    pub fn ping(&mut self) -> Result<(), Error> {
        let result = self.exchange_ping();
        self.last_outbound_ms = self.platform.now_ms();
        self.settle(result)
    }

    /// Publish `payload` to `topic`.
    ///
    /// QoS 0 returns once the frame is written. QoS 1 records a
    /// [`PendingAck`], writes the frame, then processes inbound traffic with
    /// [`poll_once`](Self::poll_once) until the matching PUBACK arrives, so
    /// subscriptions keep being delivered while it waits.
    ///
    /// # Errors
    ///
    /// * [`EncodingError::InvalidTopic`] - empty topic, wildcard, or longer
    ///   than [`MAX_TOPIC_LEN`]; nothing is written
    /// * [`EncodingError::PayloadTooLarge`] - above the configured limit, or
    ///   above `BUF` for QoS 1
    /// * [`Error::UnsupportedQoS`] - QoS 2
    /// * [`Error::NotConnected`]
    /// * [`Error::PublishInFlight`] - an earlier QoS 1 publish is unresolved
    /// * [`Error::AckTimeout`] - no PUBACK in time; the `PendingAck` stays
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), Error> {
        check_topic(topic)?;
        if payload.len() > self.options.max_payload_size {
            return Err(EncodingError::PayloadTooLarge.into());
        }
        match qos {
            QoS::ExactlyOnce => return Err(Error::UnsupportedQoS),
            QoS::AtLeastOnce if self.pending_publish.is_some() => return Err(Error::PublishInFlight),
            _ => {}
        }
        self.connection()?;

        if qos == QoS::AtMostOnce {
            let publish = Publish::new(topic, payload, qos).with_retain(retain);
            self.write_publish(&publish)?;
            if let Some(observer) = self.observer {
                observer.on_publish(None);
            }
            return Ok(());
        }

        let pending = PendingAck {
            packet_id: self.next_packet_id(),
            topic: owned_topic(topic)?,
            payload: Vec::from_slice(payload).map_err(|_| EncodingError::PayloadTooLarge)?,
            retain,
            submitted_at_ms: self.platform.now_ms(),
        };
        let packet_id = pending.packet_id;
        self.pending_publish = Some(pending);

        let publish = Publish::new(topic, payload, qos)
            .with_retain(retain)
            .with_packet_id(packet_id);
        self.write_publish(&publish)?;
        self.await_ack(Expect::PubAck(packet_id))?;
        Ok(())
    }

    /// Publish each message in order, stopping at the first failure.
    ///
    /// The platform sleeps for `interval` between consecutive messages, for
    /// brokers that throttle bursts. `Duration::ZERO` sends them back to back.
    pub fn publish_multiple(&mut self, messages: &[Message<'_>], interval: Duration) -> Result<(), Error> {
        for (index, message) in messages.iter().enumerate() {
            if index > 0 && !interval.is_zero() {
                self.platform.delay(interval);
            }
            self.publish(message.topic, message.payload, message.qos, message.retain)?;
        }
        Ok(())
    }

    /// Re-send the in-flight QoS 1 publish with the DUP flag set and wait
    /// for its PUBACK again. Does nothing when no publish is pending.
    pub fn retry_pending(&mut self) -> Result<(), Error> {
        let Some(pending) = &self.pending_publish else {
            return Ok(());
        };
        let packet_id = pending.packet_id;
        let result = match (self.state, self.connection.as_mut()) {
            (State::Connected, Some(connection)) => {
                let publish = Publish::new(&pending.topic, &pending.payload, QoS::AtLeastOnce)
                    .with_retain(pending.retain)
                    .with_dup(true)
                    .with_packet_id(packet_id);
                debug!("Re-sending PUBLISH {}", packet_id);
                write_publish(connection, &publish, self.options.max_payload_size)
            }
            _ => Err(Error::NotConnected),
        };
        self.settle(result)?;
        let now = self.platform.now_ms();
        if let Some(pending) = self.pending_publish.as_mut() {
            pending.submitted_at_ms = now;
        }
        self.last_outbound_ms = now;
        self.await_ack(Expect::PubAck(packet_id))?;
        Ok(())
    }

    /// Forget the in-flight QoS 1 publish without waiting for it.
    pub fn abandon_pending(&mut self) -> Option<PendingAck<BUF>> {
        self.pending_publish.take()
    }

    /// Forget every timed-out SUBSCRIBE/UNSUBSCRIBE.
    pub fn abandon_requests(&mut self) {
        self.pending_requests.clear();
    }

    /// Subscribe to exactly `topic`, then register `handler` for it.
    ///
    /// `None` registers the default handler, which only logs. The handler is
    /// registered only after a successful SUBACK. Returns the QoS the broker
    /// granted.
    ///
    /// # Errors
    ///
    /// * [`EncodingError::InvalidTopic`] - empty topic or wildcard
    /// * [`Error::UnsupportedQoS`] - QoS 2
    /// * [`Error::AlreadySubscribed`] - the topic already has a handler,
    ///   which is left untouched
    /// * [`Error::RegistryFull`]
    /// * [`Error::NotConnected`]
    /// * [`Error::SubscriptionRejected`] - SUBACK return code `0x80`
    /// * [`Error::AckTimeout`] - no SUBACK in time; the request stays pending
    pub fn subscribe(&mut self, topic: &str, handler: Option<&'a dyn Handler>, qos: QoS) -> Result<QoS, Error> {
        check_topic(topic)?;
        if qos == QoS::ExactlyOnce {
            return Err(Error::UnsupportedQoS);
        }
        if self.registry.contains(topic) {
            return Err(Error::AlreadySubscribed);
        }
        if self.registry.is_full() {
            return Err(Error::RegistryFull);
        }
        let granted = self.request_subscribe(&[(topic, qos)])?.granted_qos()?;
        self.registry.add(topic, qos, handler)?;
        if let Some(observer) = self.observer {
            observer.on_subscribe(topic, granted);
        }
        Ok(granted)
    }

    /// Subscribe to several topics with one SUBSCRIBE and one SUBACK.
    ///
    /// Each entry is registered like a [`subscribe`](Self::subscribe) call,
    /// but only if the broker granted it; rejected entries are logged and
    /// left unregistered. The returned [`SubAck`] carries the per-topic
    /// outcome in request order.
    ///
    /// # Errors
    ///
    /// * [`EncodingError::TopicCount`] - no topics, or more than
    ///   [`MAX_SUBSCRIBE_TOPICS`]
    /// * [`EncodingError::InvalidTopic`], [`Error::UnsupportedQoS`] - any
    ///   entry is invalid; nothing is sent
    /// * [`Error::AlreadySubscribed`] - a topic is registered already or
    ///   appears twice
    /// * [`Error::RegistryFull`] - the registry cannot take every topic
    /// * [`Error::NotConnected`]
    /// * [`Error::AckTimeout`] - no SUBACK in time; the request stays pending
    /// * [`ProtocolViolation::ReturnCodeCount`] - the SUBACK does not carry
    ///   one return code per topic
    pub fn subscribe_multiple(&mut self, topics: &[(&str, QoS, Option<&'a dyn Handler>)]) -> Result<SubAck, Error> {
        if topics.is_empty() || topics.len() > MAX_SUBSCRIBE_TOPICS {
            return Err(EncodingError::TopicCount.into());
        }
        let mut filters: Vec<(&str, QoS), MAX_SUBSCRIBE_TOPICS> = Vec::new();
        for (index, &(topic, qos, _)) in topics.iter().enumerate() {
            check_topic(topic)?;
            if qos == QoS::ExactlyOnce {
                return Err(Error::UnsupportedQoS);
            }
            if self.registry.contains(topic) || topics[..index].iter().any(|&(seen, _, _)| seen == topic) {
                return Err(Error::AlreadySubscribed);
            }
            // length checked above
            let _ = filters.push((topic, qos));
        }
        if self.registry.len() + topics.len() > MAX_SUBS {
            return Err(Error::RegistryFull);
        }

        let ack = self.request_subscribe(&filters)?;
        for (index, &(topic, qos, handler)) in topics.iter().enumerate() {
            match ack.granted_qos_at(index) {
                Some(Ok(granted)) => {
                    self.registry.add(topic, qos, handler)?;
                    if let Some(observer) = self.observer {
                        observer.on_subscribe(topic, granted);
                    }
                }
                _ => warning!("Subscription to {} rejected", topic),
            }
        }
        Ok(ack)
    }

    /// Unsubscribe from `topic` and drop its handler after UNSUBACK.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), Error> {
        check_topic(topic)?;
        self.connection()?;
        let packet_id = self.begin_request(RequestKind::Unsubscribe)?;

        let mut frame = [0u8; HEADER_BUF_LEN];
        let written = packet::encode_unsubscribe(&mut frame, topic, packet_id)
            .and_then(|len| {
                debug!("Unsubscribing from {}", topic);
                self.write_frame(&frame[..len])
            });
        if let Err(err) = written {
            self.forget_request(packet_id);
            return Err(err);
        }

        self.await_ack(Expect::UnsubAck(packet_id))?;
        self.registry.remove(topic);
        if let Some(observer) = self.observer {
            observer.on_unsubscribe(topic);
        }
        Ok(())
    }

    /// Process at most one inbound frame, waiting up to `timeout` for it.
    ///
    /// * `Ok(None)` - nothing arrived, or a PINGRESP was consumed
    /// * `Ok(Some(Incoming::Publish { .. }))` - a PUBLISH was delivered. A
    ///   QoS 1 PUBACK is written before the handler runs, so it is sent even
    ///   if the handler panics. Topics without a handler are dropped.
    /// * `Ok(Some(..))` - any acknowledgement, for the caller to match
    ///
    /// Acknowledgements that resolve a recorded pending publish or request
    /// clear that record here.
    ///
    /// # Errors
    ///
    /// Malformed frames, protocol violations and transport failures tear the
    /// connection down before being returned. QoS 2 traffic fails with
    /// [`Error::UnsupportedQoS`] after the frame is consumed.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<Option<Incoming>, Error> {
        match self.poll_frame(timeout)? {
            Polled::Packet(incoming) => Ok(Some(incoming)),
            Polled::Idle | Polled::PingResp => Ok(None),
        }
    }

    /// Run one iteration of a keep-alive driven loop: [`poll_once`](Self::poll_once),
    /// then a keep-alive ping if nothing has been sent for
    /// `keep_alive_seconds`.
    ///
    /// Unlike [`ping`](Self::ping), the keep-alive exchange keeps delivering
    /// messages that arrive ahead of the PINGRESP. It fails with
    /// [`Error::AckTimeout`] if no PINGRESP arrives within `ack_timeout`.
    pub fn loop_once(&mut self, timeout: Duration) -> Result<Option<Incoming>, Error> {
        let incoming = self.poll_once(timeout)?;
        let keep_alive_ms = u64::from(self.options.keep_alive_seconds) * 1000;
        if keep_alive_ms > 0 {
            let idle = self.platform.now_ms().saturating_sub(self.last_outbound_ms);
            if idle >= keep_alive_ms {
                debug!("Sending keep-alive PINGREQ");
                self.write_frame(&packet::PINGREQ)?;
                self.await_ack(Expect::PingResp)?;
            }
        }
        Ok(incoming)
    }

    /// Send one SUBSCRIBE for `filters` and wait for its SUBACK, without
    /// touching the registry.
    pub(crate) fn request_subscribe(&mut self, filters: &[(&str, QoS)]) -> Result<SubAck, Error> {
        self.connection()?;
        let packet_id = self.begin_request(RequestKind::Subscribe)?;
        debug!("Subscribing to {} topic(s), packet id {}", filters.len(), packet_id);
        let result = self
            .connection()
            .and_then(|connection| write_subscribe(connection, filters, packet_id));
        self.last_outbound_ms = self.platform.now_ms();
        if let Err(err) = self.settle(result) {
            self.forget_request(packet_id);
            return Err(err);
        }

        let ack = match self.await_ack(Expect::SubAck(packet_id))? {
            Polled::Packet(Incoming::SubAck(ack)) => ack,
            _ => return Err(ProtocolViolation::UnexpectedPacket(PacketType::SubAck).into()),
        };
        if ack.return_codes().len() != filters.len() {
            let result = Err(ProtocolViolation::ReturnCodeCount.into());
            return self.settle(result);
        }
        Ok(ack)
    }

    fn exchange_ping(&mut self) -> Result<(), Error> {
        let timeout = self.options.ack_timeout;
        let connection = self.connection()?;
        debug!("Sending PINGREQ");
        send(connection, &[&packet::PINGREQ])?;
        set_timeout(connection, timeout)?;

        let mut response = [0u8; 1];
        match connection.read(&mut response) {
            Ok(0) => return Err(Error::AckTimeout),
            Ok(_) => {}
            Err(_) => return Err(TransportError::ReadError.into()),
        }
        if response[0] != 0xD0 {
            return Err(ProtocolViolation::MissingPingResp.into());
        }
        if packet::decode_remaining_length(connection)? != 0 {
            return Err(MalformedFrame::InvalidLength.into());
        }
        Ok(())
    }

    fn connection(&mut self) -> Result<&mut N::Connection, Error> {
        match (self.state, self.connection.as_mut()) {
            (State::Connected, Some(connection)) => Ok(connection),
            _ => Err(Error::NotConnected),
        }
    }

    /// Next packet identifier: 1..=0xFFFF, wrapping past 0, skipping every
    /// identifier still recorded as pending.
    fn next_packet_id(&mut self) -> u16 {
        loop {
            self.packet_id = match self.packet_id.wrapping_add(1) {
                0 => 1,
                id => id,
            };
            let id = self.packet_id;
            let in_use = self.pending_publish.as_ref().is_some_and(|p| p.packet_id == id)
                || self.pending_requests.iter().any(|r| r.packet_id == id);
            if !in_use {
                return id;
            }
        }
    }

    fn begin_request(&mut self, kind: RequestKind) -> Result<u16, Error> {
        if self.pending_requests.is_full() {
            return Err(Error::TooManyPending);
        }
        let packet_id = self.next_packet_id();
        let request = PendingRequest {
            packet_id,
            kind,
            submitted_at_ms: self.platform.now_ms(),
        };
        // capacity checked above
        let _ = self.pending_requests.push(request);
        Ok(packet_id)
    }

    fn forget_request(&mut self, packet_id: u16) {
        self.pending_requests.retain(|r| r.packet_id != packet_id);
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        let result = self.connection().and_then(|connection| send(connection, &[frame]));
        self.last_outbound_ms = self.platform.now_ms();
        self.settle(result)
    }

    fn write_publish(&mut self, publish: &Publish<'_>) -> Result<(), Error> {
        let max_payload = self.options.max_payload_size;
        debug!("Sending PUBLISH to {} (qos {})", publish.topic, publish.qos as u8);
        let result = self
            .connection()
            .and_then(|connection| write_publish(connection, publish, max_payload));
        self.last_outbound_ms = self.platform.now_ms();
        self.settle(result)
    }

    /// Wait for `expect`, dispatching anything else that arrives meanwhile.
    ///
    /// Only a read that times out with nothing at all ends the wait early; a
    /// stray PINGRESP or an unrelated acknowledgement does not.
    fn await_ack(&mut self, expect: Expect) -> Result<Polled, Error> {
        let timeout_ms = self.options.ack_timeout.as_millis() as u64;
        let deadline = self.platform.now_ms().saturating_add(timeout_ms);
        loop {
            let remaining = deadline.saturating_sub(self.platform.now_ms());
            if remaining == 0 {
                warning!("Timed out waiting for acknowledgement");
                return Err(Error::AckTimeout);
            }
            let polled = self.poll_frame(Duration::from_millis(remaining))?;
            let matched = match (expect, polled) {
                (_, Polled::Idle) => {
                    warning!("Timed out waiting for acknowledgement");
                    return Err(Error::AckTimeout);
                }
                (Expect::PingResp, Polled::PingResp) => true,
                (Expect::PubAck(want), Polled::Packet(Incoming::PubAck(got)))
                | (Expect::UnsubAck(want), Polled::Packet(Incoming::UnsubAck(got))) => want == got,
                (Expect::SubAck(want), Polled::Packet(Incoming::SubAck(ack))) => ack.packet_id == want,
                (_, Polled::Packet(Incoming::ConnAck(_))) => {
                    let result = Err(ProtocolViolation::UnexpectedPacket(PacketType::ConnAck).into());
                    return self.settle(result);
                }
                _ => false,
            };
            if matched {
                return Ok(polled);
            }
            trace!("Still waiting for acknowledgement");
        }
    }

    fn poll_frame(&mut self, timeout: Duration) -> Result<Polled, Error> {
        let result = self.poll_inner(timeout);
        self.settle(result)
    }

    fn poll_inner(&mut self, timeout: Duration) -> Result<Polled, Error> {
        let connection = match (self.state, self.connection.as_mut()) {
            (State::Connected, Some(connection)) => connection,
            _ => return Err(Error::NotConnected),
        };
        set_timeout(connection, timeout)?;
        let Some(frame) = packet::read_frame(connection, &mut self.rx)? else {
            return Ok(Polled::Idle);
        };
        let header = frame.header;
        trace!("Received packet type {}", header.packet_type as u8);

        let incoming = match header.packet_type {
            PacketType::PingResp => {
                return if frame.remaining_length == 0 {
                    Ok(Polled::PingResp)
                } else {
                    Err(MalformedFrame::InvalidLength.into())
                };
            }
            PacketType::Publish => {
                let publish = packet::decode_publish_body(header, &self.rx)?;
                if publish.qos == QoS::ExactlyOnce {
                    warning!("Dropping QoS 2 message on {}", publish.topic);
                    return Err(Error::UnsupportedQoS);
                }
                if let (QoS::AtLeastOnce, Some(id)) = (publish.qos, publish.packet_id) {
                    send(connection, &[&packet::encode_puback(id)])?;
                    self.last_outbound_ms = self.platform.now_ms();
                }
                if !frame.is_complete() {
                    warning!("Dropping message on {}: payload exceeds buffer", publish.topic);
                    return Err(EncodingError::PayloadTooLarge.into());
                }
                let dispatched = self.registry.dispatch(publish.topic, publish.payload);
                if !dispatched {
                    debug!("No handler for {}, message dropped", publish.topic);
                }
                Incoming::Publish {
                    packet_id: publish.packet_id,
                    qos: publish.qos,
                    dispatched,
                }
            }
            PacketType::PubRec | PacketType::PubRel | PacketType::PubComp => {
                return Err(Error::UnsupportedQoS);
            }
            PacketType::ConnAck | PacketType::PubAck | PacketType::SubAck | PacketType::UnsubAck => {
                if !frame.is_complete() {
                    return Err(MalformedFrame::InvalidLength.into());
                }
                match packet::decode_body(header, &self.rx)? {
                    packet::ControlPacket::ConnAck(ack) => Incoming::ConnAck(ack),
                    packet::ControlPacket::PubAck(id) => Incoming::PubAck(id),
                    packet::ControlPacket::SubAck(ack) => Incoming::SubAck(ack),
                    packet::ControlPacket::UnsubAck(id) => Incoming::UnsubAck(id),
                    _ => return Err(ProtocolViolation::UnexpectedPacket(header.packet_type).into()),
                }
            }
            other => return Err(ProtocolViolation::UnexpectedPacket(other).into()),
        };

        self.resolve_pending(&incoming);
        Ok(Polled::Packet(incoming))
    }

    /// Clear whatever record an acknowledgement resolves.
    fn resolve_pending(&mut self, incoming: &Incoming) {
        match *incoming {
            Incoming::PubAck(id) => {
                if self.pending_publish.as_ref().is_some_and(|p| p.packet_id == id) {
                    self.pending_publish = None;
                    debug!("PUBACK received for {}", id);
                    if let Some(observer) = self.observer {
                        observer.on_publish(Some(id));
                    }
                } else {
                    warning!("Ignoring PUBACK for unknown packet id {}", id);
                }
            }
            Incoming::SubAck(SubAck { packet_id, .. }) | Incoming::UnsubAck(packet_id) => {
                self.pending_requests.retain(|r| r.packet_id != packet_id);
            }
            _ => {}
        }
    }

    /// Tear the connection down on errors that leave the stream unusable.
    fn settle<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            if matches!(
                err,
                Error::MalformedFrame(_) | Error::ProtocolViolation(_) | Error::Transport(_)
            ) {
                self.teardown();
            }
        }
        result
    }

    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = connection.close();
        }
        if self.state != State::Disconnected {
            warning!("Connection lost");
            self.state = State::Disconnected;
            if let Some(observer) = self.observer {
                observer.on_disconnect();
            }
        }
    }
}

fn owned_topic(topic: &str) -> Result<String<MAX_TOPIC_LEN>, Error> {
    let mut owned = String::new();
    owned
        .push_str(topic)
        .map_err(|_| EncodingError::InvalidTopic)?;
    Ok(owned)
}

/// Topics the client accepts for publish and subscribe.
fn check_topic(topic: &str) -> Result<(), Error> {
    packet::validate_topic(topic)?;
    if topic.len() > MAX_TOPIC_LEN {
        return Err(EncodingError::InvalidTopic.into());
    }
    Ok(())
}

fn set_timeout<C: Timeout + ?Sized>(connection: &mut C, timeout: Duration) -> Result<(), Error> {
    connection
        .set_timeout(timeout)
        .map_err(|_| TransportError::ReadError.into())
}

fn send<C: Write + ?Sized>(connection: &mut C, parts: &[&[u8]]) -> Result<(), Error> {
    for part in parts {
        network::write_all(connection, part)?;
    }
    connection
        .flush()
        .map_err(|_| TransportError::WriteError.into())
}

/// Header first, then one filter at a time, so no buffer has to hold the
/// whole frame.
fn write_subscribe<C: Write + ?Sized>(
    connection: &mut C,
    filters: &[(&str, QoS)],
    packet_id: u16,
) -> Result<(), Error> {
    let mut header = [0u8; 8];
    let len = packet::encode_subscribe_header(&mut header, filters, packet_id)?;
    network::write_all(connection, &header[..len])?;
    let mut filter = [0u8; HEADER_BUF_LEN];
    for &(topic, qos) in filters {
        let len = packet::encode_subscribe_filter(&mut filter, topic, qos)?;
        network::write_all(connection, &filter[..len])?;
    }
    connection
        .flush()
        .map_err(|_| TransportError::WriteError.into())
}

/// Header and payload go out as two writes so the payload is never copied.
fn write_publish<C: Write + ?Sized>(
    connection: &mut C,
    publish: &Publish<'_>,
    max_payload: usize,
) -> Result<(), Error> {
    let mut header = [0u8; HEADER_BUF_LEN];
    let len = publish.encode_header(&mut header, max_payload)?;
    send(connection, &[&header[..len], publish.payload])
}

/// Write CONNECT and read the 4-byte CONNACK.
fn handshake<C: Connection>(connection: &mut C, frame: &[u8], timeout: Duration) -> Result<ConnAck, Error> {
    set_timeout(connection, timeout)?;
    debug!("Sending CONNECT packet to server");
    send(connection, &[frame])?;

    debug!("Receiving CONNACK packet from server");
    let mut connack = [0u8; 4];
    match connection.read(&mut connack[..1]) {
        Ok(0) => return Err(Error::AckTimeout),
        Ok(_) => {}
        Err(_) => return Err(TransportError::ReadError.into()),
    }
    packet::read_exact(connection, &mut connack[1..])?;

    if connack[0] != 0x20 || connack[1] != 0x02 {
        return Err(ProtocolViolation::InvalidConnAck.into());
    }
    if connack[2] & 0xFE != 0 {
        return Err(MalformedFrame::InvalidFlags.into());
    }
    match connack[3] {
        0 => Ok(ConnAck {
            session_present: connack[2] & 0x01 != 0,
            return_code: 0,
        }),
        code => Err(Error::ConnectionRefused(
            crate::mqtt::error::ConnectReturnCode::from_code(code),
        )),
    }
}
