//! Error taxonomy for the MQTT engine.
//!
//! Every public operation returns either a success value or exactly one
//! [`Error`]. Protocol invariants that a looser implementation would `assert!`
//! are reported as [`Error::MalformedFrame`] or [`Error::ProtocolViolation`]
//! instead.

use crate::mqtt::packet::PacketType;
use crate::network::error::Error as TransportError;
use core::fmt;

/// Failures detected while building an outbound packet.
///
/// No bytes are written to the transport when one of these is returned.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodingError {
    /// Topic is empty, contains `+`/`#`, or does not fit a length prefix.
    InvalidTopic,
    /// Payload exceeds the configured message size limit.
    PayloadTooLarge,
    /// QoS value outside `0..=2`.
    InvalidQoS,
    /// Client identifier is empty or longer than the agreed maximum.
    InvalidClientId,
    /// Remaining length would exceed 268,435,455 bytes.
    RemainingLengthOverflow,
    /// The output buffer cannot hold the encoded packet.
    BufferTooSmall,
    /// A QoS 1 publish was built without a packet identifier.
    MissingPacketId,
    /// MQTT 3.1.1 forbids a password without a username.
    PasswordWithoutUsername,
    /// A length-prefixed string or binary field is longer than 65,535 bytes.
    StringTooLong,
    /// A SUBSCRIBE names no topics, or more than one frame may carry.
    TopicCount,
}

/// Structural violations found while decoding an inbound frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MalformedFrame {
    /// Remaining-length varint did not terminate within four bytes.
    MalformedVarint,
    /// The stream ended (or went silent) in the middle of a frame.
    Truncated,
    /// Topic name is not valid UTF-8.
    InvalidUtf8,
    /// Declared lengths are inconsistent with the packet type.
    InvalidLength,
    /// Reserved fixed-header flag bits have the wrong value.
    InvalidFlags,
    /// PUBLISH header carries QoS 3.
    InvalidQoS,
    /// QoS 1 packet carries identifier 0.
    ZeroPacketId,
    /// SUBACK return code other than 0, 1, 2 or `0x80`.
    InvalidReturnCode,
    /// CONNECT names a protocol other than `MQTT` level 4.
    InvalidProtocol,
    /// Packet type nibble 0 or 15.
    UnknownPacketType(u8),
}

/// Well-formed packets that are wrong for the current protocol state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolViolation {
    /// A packet the broker must never send to a client, or one that arrived
    /// outside the exchange it belongs to.
    UnexpectedPacket(PacketType),
    /// CONNACK did not start with `0x20 0x02`.
    InvalidConnAck,
    /// Something other than PINGRESP answered a PINGREQ.
    MissingPingResp,
    /// SUBACK return codes do not pair up with the requested topics.
    ReturnCodeCount,
}

/// CONNACK refusal reasons.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReturnCode {
    /// 0x01: the broker does not support protocol level 4.
    UnacceptableProtocolVersion,
    /// 0x02: client identifier rejected.
    IdentifierRejected,
    /// 0x03: MQTT service unavailable.
    ServerUnavailable,
    /// 0x04: malformed username or password.
    BadUsernameOrPassword,
    /// 0x05: client not authorized.
    NotAuthorized,
    /// Any code above 5, reserved by MQTT 3.1.1.
    Other(u8),
}

impl ConnectReturnCode {
    /// Map a non-zero CONNACK return code.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUsernameOrPassword,
            5 => Self::NotAuthorized,
            other => Self::Other(other),
        }
    }

    /// The wire value.
    pub fn code(self) -> u8 {
        match self {
            Self::UnacceptableProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadUsernameOrPassword => 4,
            Self::NotAuthorized => 5,
            Self::Other(code) => code,
        }
    }
}

/// The MQTT engine error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// An outbound packet could not be built.
    Encoding(EncodingError),
    /// An inbound frame is structurally invalid.
    MalformedFrame(MalformedFrame),
    /// An inbound packet is invalid for the current state.
    ProtocolViolation(ProtocolViolation),
    /// The broker refused the connection.
    ConnectionRefused(ConnectReturnCode),
    /// SUBACK carried the failure code `0x80`.
    SubscriptionRejected,
    /// The topic already has a registered handler.
    AlreadySubscribed,
    /// The subscription registry has no free slot.
    RegistryFull,
    /// No acknowledgement arrived within the configured bound.
    AckTimeout,
    /// The operation needs a connected session.
    NotConnected,
    /// The operation is only valid while disconnected.
    AlreadyConnected,
    /// QoS 2 (exactly once) is not implemented.
    UnsupportedQoS,
    /// A QoS 1 publish is still waiting for its PUBACK.
    PublishInFlight,
    /// Too many unacknowledged subscribe/unsubscribe requests.
    TooManyPending,
    /// The transport failed.
    Transport(TransportError),
}

impl Error {
    /// Whether a reconnect attempt may succeed after this error.
    ///
    /// Transport failures and a missing CONNACK are transient. A refusal
    /// reported by the broker is not: retrying bad credentials cannot succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::AckTimeout)
    }
}

impl From<EncodingError> for Error {
    fn from(err: EncodingError) -> Self {
        Error::Encoding(err)
    }
}

impl From<MalformedFrame> for Error {
    fn from(err: MalformedFrame) -> Self {
        Error::MalformedFrame(err)
    }
}

impl From<ProtocolViolation> for Error {
    fn from(err: ProtocolViolation) -> Self {
        Error::ProtocolViolation(err)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Encoding(e) => write!(f, "encoding error: {e:?}"),
            Error::MalformedFrame(e) => write!(f, "malformed frame: {e:?}"),
            Error::ProtocolViolation(e) => write!(f, "protocol violation: {e:?}"),
            Error::ConnectionRefused(code) => {
                let reason = match code {
                    ConnectReturnCode::UnacceptableProtocolVersion => "incorrect protocol version",
                    ConnectReturnCode::IdentifierRejected => "client id rejected",
                    ConnectReturnCode::ServerUnavailable => "server unavailable",
                    ConnectReturnCode::BadUsernameOrPassword => "incorrect username/password",
                    ConnectReturnCode::NotAuthorized => "not authorized",
                    ConnectReturnCode::Other(_) => "reserved return code",
                };
                write!(f, "connection refused ({}): {reason}", code.code())
            }
            Error::SubscriptionRejected => f.write_str("subscription rejected by broker"),
            Error::AlreadySubscribed => f.write_str("topic already subscribed"),
            Error::RegistryFull => f.write_str("subscription registry full"),
            Error::AckTimeout => f.write_str("timed out waiting for acknowledgement"),
            Error::NotConnected => f.write_str("not connected"),
            Error::AlreadyConnected => f.write_str("already connected"),
            Error::UnsupportedQoS => f.write_str("QoS 2 is not supported"),
            Error::PublishInFlight => f.write_str("a QoS 1 publish is awaiting PUBACK"),
            Error::TooManyPending => f.write_str("too many unacknowledged requests"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}
