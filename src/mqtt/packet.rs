//! MQTT 3.1.1 control packet codec.
//!
//! Encoding is pure: every `encode_*` function writes one complete frame into a
//! caller-provided buffer and returns the number of bytes used, or fails before
//! anything observable happens. Decoding comes in two layers:
//!
//! - framing from a byte stream ([`decode_fixed_header`],
//!   [`decode_remaining_length`], [`read_frame`]), which consumes exactly the
//!   bytes a frame declares and never over-reads;
//! - body parsing from memory ([`decode_publish_body`], [`ControlPacket::decode`]),
//!   which borrows topics and payloads from the input instead of copying them.
//!
//! All multi-byte integers are big-endian, as the protocol requires.
//!
//! # Examples
//!
//! ```rust
//! use minimqtt::mqtt::packet::{ControlPacket, Publish, QoS, encode_publish, MQTT_MSG_SZ_LIM};
//!
//! let publish = Publish::new("sensors/temperature", b"23.5", QoS::AtLeastOnce).with_packet_id(7);
//! let mut buf = [0u8; 64];
//! let len = encode_publish(&mut buf, &publish, MQTT_MSG_SZ_LIM).unwrap();
//!
//! let (decoded, used) = ControlPacket::decode(&buf[..len]).unwrap();
//! assert_eq!(used, len);
//! assert_eq!(decoded, ControlPacket::Publish(publish));
//! ```

use crate::mqtt::error::{EncodingError, Error, MalformedFrame};
use crate::network::error::Error as TransportError;
use crate::network::Read;
use heapless::Vec;

/// Largest value the remaining-length varint can carry.
pub const MQTT_MSG_MAX_SZ: usize = 268_435_455;
/// Default payload size limit applied by the client.
pub const MQTT_MSG_SZ_LIM: usize = 10_000_000;
/// Largest client identifier every broker must accept.
pub const MAX_CLIENT_ID_LEN: usize = 23;
/// Most topic filters carried by one SUBSCRIBE, and so most return codes
/// expected in one SUBACK.
pub const MAX_SUBSCRIBE_TOPICS: usize = 8;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1

const SUBACK_FAILURE: u8 = 0x80;

/// Quality of Service levels for MQTT messages.
///
/// ```rust
/// use minimqtt::mqtt::packet::QoS;
///
/// assert_eq!(QoS::try_from(1), Ok(QoS::AtLeastOnce));
/// assert!(QoS::try_from(3).is_err());
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    /// At most once: fire and forget.
    #[default]
    AtMostOnce = 0,
    /// At least once: acknowledged with PUBACK.
    AtLeastOnce = 1,
    /// Exactly once. Representable on the wire but not implemented by the
    /// client; publishing or subscribing with it fails with `UnsupportedQoS`.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(EncodingError::InvalidQoS),
        }
    }
}

/// Control packet type, the top nibble of the fixed header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketType {
    /// Client request to connect.
    Connect = 1,
    /// Connect acknowledgement.
    ConnAck = 2,
    /// Application message.
    Publish = 3,
    /// QoS 1 publish acknowledgement.
    PubAck = 4,
    /// QoS 2 publish received.
    PubRec = 5,
    /// QoS 2 publish release.
    PubRel = 6,
    /// QoS 2 publish complete.
    PubComp = 7,
    /// Subscribe request.
    Subscribe = 8,
    /// Subscribe acknowledgement.
    SubAck = 9,
    /// Unsubscribe request.
    Unsubscribe = 10,
    /// Unsubscribe acknowledgement.
    UnsubAck = 11,
    /// Ping request.
    PingReq = 12,
    /// Ping response.
    PingResp = 13,
    /// Client is disconnecting.
    Disconnect = 14,
}

impl PacketType {
    fn from_nibble(nibble: u8) -> Result<Self, MalformedFrame> {
        Ok(match nibble {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            other => return Err(MalformedFrame::UnknownPacketType(other)),
        })
    }

    /// Flag nibble MQTT 3.1.1 mandates for this type; PUBLISH flags are free.
    fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0b0010),
            _ => Some(0),
        }
    }
}

/// Decoded first byte of a frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FixedHeader {
    /// Control packet type.
    pub packet_type: PacketType,
    /// Low nibble: DUP/QoS/RETAIN for PUBLISH, fixed values otherwise.
    pub flags: u8,
}

impl FixedHeader {
    /// QoS bits of a PUBLISH header.
    pub fn qos(&self) -> Result<QoS, MalformedFrame> {
        QoS::try_from((self.flags >> 1) & 0b11).map_err(|_| MalformedFrame::InvalidQoS)
    }

    /// RETAIN bit of a PUBLISH header.
    pub fn retain(&self) -> bool {
        self.flags & 0b0001 != 0
    }

    /// DUP bit of a PUBLISH header.
    pub fn dup(&self) -> bool {
        self.flags & 0b1000 != 0
    }
}

/// Split the first byte of a frame into packet type and flags.
///
/// Reserved flag values are enforced for every type except PUBLISH.
pub fn decode_fixed_header(byte: u8) -> Result<FixedHeader, MalformedFrame> {
    let packet_type = PacketType::from_nibble(byte >> 4)?;
    let flags = byte & 0x0F;
    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(MalformedFrame::InvalidFlags);
        }
    }
    Ok(FixedHeader { packet_type, flags })
}

/// Encode the remaining-length varint: 7 data bits per byte, least
/// significant group first, MSB set on every byte but the last.
pub fn encode_remaining_length(mut len: usize) -> Result<Vec<u8, 4>, EncodingError> {
    if len > MQTT_MSG_MAX_SZ {
        return Err(EncodingError::RemainingLengthOverflow);
    }
    let mut out = Vec::new();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        // at most four bytes for values up to MQTT_MSG_MAX_SZ
        out.push(byte)
            .map_err(|_| EncodingError::RemainingLengthOverflow)?;
        if len == 0 {
            return Ok(out);
        }
    }
}

/// Read a remaining-length varint from `reader`, one byte at a time.
///
/// Fails with [`MalformedFrame::MalformedVarint`] when the fourth byte still
/// has its continuation bit set.
pub fn decode_remaining_length<R: Read + ?Sized>(reader: &mut R) -> Result<usize, Error> {
    let mut value = 0usize;
    for shift in [0u32, 7, 14, 21] {
        let byte = read_u8(reader)?;
        value |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(MalformedFrame::MalformedVarint.into())
}

/// Fill `buf` completely. An empty read in the middle of a frame means the
/// peer went silent, so the frame is reported as truncated.
pub(crate) fn read_exact<R: Read + ?Sized>(reader: &mut R, mut buf: &mut [u8]) -> Result<(), Error> {
    while !buf.is_empty() {
        match reader.read(buf) {
            Ok(0) => return Err(MalformedFrame::Truncated.into()),
            Ok(n) => buf = &mut core::mem::take(&mut buf)[n..],
            Err(_) => return Err(TransportError::ReadError.into()),
        }
    }
    Ok(())
}

fn read_u8<R: Read + ?Sized>(reader: &mut R) -> Result<u8, Error> {
    let mut byte = [0u8; 1];
    read_exact(reader, &mut byte)?;
    Ok(byte[0])
}

/// A frame read off the stream by [`read_frame`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Frame {
    /// Decoded fixed header.
    pub header: FixedHeader,
    /// Declared remaining length.
    pub remaining_length: usize,
    /// Number of body bytes kept in the caller's buffer; smaller than
    /// `remaining_length` when the frame did not fit and the tail was drained.
    pub stored: usize,
}

impl Frame {
    /// Whether the whole body fit in the buffer.
    pub fn is_complete(&self) -> bool {
        self.stored == self.remaining_length
    }
}

/// Read one complete frame from `reader`.
///
/// Returns `Ok(None)` when the first read yields no data (nothing arrived
/// within the timeout). The body is stored in `body`; if it is longer than the
/// buffer's capacity the excess is read and discarded so the stream stays
/// aligned on the next frame boundary.
pub fn read_frame<R: Read + ?Sized, const N: usize>(
    reader: &mut R,
    body: &mut Vec<u8, N>,
) -> Result<Option<Frame>, Error> {
    let mut first = [0u8; 1];
    match reader.read(&mut first) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(_) => return Err(TransportError::ReadError.into()),
    }
    let header = decode_fixed_header(first[0])?;
    let remaining_length = decode_remaining_length(reader)?;

    let stored = remaining_length.min(N);
    body.clear();
    // `stored` never exceeds the capacity
    let _ = body.resize(stored, 0);
    read_exact(reader, body)?;

    let mut excess = remaining_length - stored;
    let mut scratch = [0u8; 64];
    while excess > 0 {
        let chunk = excess.min(scratch.len());
        read_exact(reader, &mut scratch[..chunk])?;
        excess -= chunk;
    }

    Ok(Some(Frame {
        header,
        remaining_length,
        stored,
    }))
}

/// Bounded writer over an output buffer.
struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> Writer<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put_slice(&mut self, data: &[u8]) -> Result<(), EncodingError> {
        let end = self.pos + data.len();
        self.buf
            .get_mut(self.pos..end)
            .ok_or(EncodingError::BufferTooSmall)?
            .copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn put_u8(&mut self, value: u8) -> Result<(), EncodingError> {
        self.put_slice(&[value])
    }

    fn put_u16(&mut self, value: u16) -> Result<(), EncodingError> {
        self.put_slice(&value.to_be_bytes())
    }

    /// Length-prefixed binary data or UTF-8 string.
    fn put_prefixed(&mut self, data: &[u8]) -> Result<(), EncodingError> {
        let len = u16::try_from(data.len()).map_err(|_| EncodingError::StringTooLong)?;
        self.put_u16(len)?;
        self.put_slice(data)
    }

    fn put_fixed_header(&mut self, first: u8, remaining: usize) -> Result<(), EncodingError> {
        self.put_u8(first)?;
        let len = encode_remaining_length(remaining)?;
        self.put_slice(&len)
    }

    fn finish(self) -> usize {
        self.pos
    }
}

/// Bounded reader over an in-memory frame body.
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MalformedFrame> {
        if n > self.buf.len() {
            return Err(MalformedFrame::InvalidLength);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, MalformedFrame> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MalformedFrame> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn packet_id(&mut self) -> Result<u16, MalformedFrame> {
        match self.u16()? {
            0 => Err(MalformedFrame::ZeroPacketId),
            id => Ok(id),
        }
    }

    fn bytes(&mut self) -> Result<&'a [u8], MalformedFrame> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn str(&mut self) -> Result<&'a str, MalformedFrame> {
        core::str::from_utf8(self.bytes()?).map_err(|_| MalformedFrame::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        core::mem::take(&mut self.buf)
    }

    fn end(&self) -> Result<(), MalformedFrame> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(MalformedFrame::InvalidLength)
        }
    }
}

/// Reject topics a client may not publish or subscribe to: empty, containing
/// a wildcard, or too long for a length prefix.
pub fn validate_topic(topic: &str) -> Result<(), EncodingError> {
    if topic.is_empty() || topic.len() > u16::MAX as usize || topic.contains(['+', '#']) {
        return Err(EncodingError::InvalidTopic);
    }
    Ok(())
}

fn prefixed_len(data: &[u8]) -> usize {
    2 + data.len()
}

fn checked_remaining(len: usize) -> Result<usize, EncodingError> {
    if len > MQTT_MSG_MAX_SZ {
        Err(EncodingError::RemainingLengthOverflow)
    } else {
        Ok(len)
    }
}

/// Message the broker publishes on the client's behalf after an unclean
/// disconnect.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LastWill<'a> {
    /// Topic the will is published to.
    pub topic: &'a str,
    /// Will payload.
    pub message: &'a [u8],
    /// QoS the broker publishes the will with.
    pub qos: QoS,
    /// Whether the broker retains the will.
    pub retain: bool,
}

/// CONNECT request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Connect<'a> {
    /// Client identifier.
    pub client_id: &'a str,
    /// Discard any previous session state on the broker.
    pub clean_session: bool,
    /// Keep-alive interval in seconds.
    pub keep_alive: u16,
    /// Username for authentication.
    pub username: Option<&'a str>,
    /// Password; only valid together with a username.
    pub password: Option<&'a str>,
    /// Last will and testament.
    pub will: Option<LastWill<'a>>,
    /// Allow client identifiers longer than [`MAX_CLIENT_ID_LEN`].
    pub extended_client_id: bool,
}

impl<'a> Connect<'a> {
    /// CONNECT without credentials or will.
    pub fn new(client_id: &'a str, clean_session: bool, keep_alive: u16) -> Self {
        Self {
            client_id,
            clean_session,
            keep_alive,
            username: None,
            password: None,
            will: None,
            extended_client_id: false,
        }
    }

    /// Connect flags byte: bit7 username, bit6 password, bit5 will retain,
    /// bits4-3 will QoS, bit2 will flag, bit1 clean session, bit0 reserved.
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.username.is_some() {
            flags |= 0x80;
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if let Some(will) = &self.will {
            if will.retain {
                flags |= 0x20;
            }
            flags |= (will.qos as u8) << 3;
            flags |= 0x04;
        }
        if self.clean_session {
            flags |= 0x02;
        }
        flags
    }

    fn remaining_length(&self) -> usize {
        // protocol name, level, flags, keep-alive
        let mut len = prefixed_len(PROTOCOL_NAME) + 4;
        len += prefixed_len(self.client_id.as_bytes());
        if let Some(will) = &self.will {
            len += prefixed_len(will.topic.as_bytes()) + prefixed_len(will.message);
        }
        if let Some(username) = self.username {
            len += prefixed_len(username.as_bytes());
        }
        if let Some(password) = self.password {
            len += prefixed_len(password.as_bytes());
        }
        len
    }

    fn validate(&self) -> Result<(), EncodingError> {
        let id_len = self.client_id.len();
        if id_len == 0 || (id_len > MAX_CLIENT_ID_LEN && !self.extended_client_id) {
            return Err(EncodingError::InvalidClientId);
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(EncodingError::PasswordWithoutUsername);
        }
        if let Some(will) = &self.will {
            validate_topic(will.topic)?;
        }
        Ok(())
    }
}

/// CONNACK response.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnAck {
    /// The broker kept state from a previous session.
    pub session_present: bool,
    /// 0 when accepted, a refusal code otherwise.
    pub return_code: u8,
}

/// PUBLISH in either direction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Publish<'a> {
    /// Topic name; never a wildcard.
    pub topic: &'a str,
    /// Application payload.
    pub payload: &'a [u8],
    /// Delivery guarantee.
    pub qos: QoS,
    /// RETAIN flag.
    pub retain: bool,
    /// DUP flag, set on redelivery.
    pub dup: bool,
    /// Present exactly when `qos` is above [`QoS::AtMostOnce`].
    pub packet_id: Option<u16>,
}

impl<'a> Publish<'a> {
    /// PUBLISH with no flags and no packet identifier.
    pub fn new(topic: &'a str, payload: &'a [u8], qos: QoS) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain: false,
            dup: false,
            packet_id: None,
        }
    }

    /// Set the packet identifier; required for QoS 1.
    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    /// Set the RETAIN flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Set the DUP flag.
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    /// `0x30 | dup<<3 | qos<<1 | retain`
    fn first_byte(&self) -> u8 {
        0x30 | ((self.dup as u8) << 3) | ((self.qos as u8) << 1) | self.retain as u8
    }

    fn variable_header_len(&self) -> usize {
        prefixed_len(self.topic.as_bytes()) + if self.qos > QoS::AtMostOnce { 2 } else { 0 }
    }

    fn validate(&self, max_payload: usize) -> Result<(), Error> {
        validate_topic(self.topic)?;
        if self.payload.len() > max_payload.min(MQTT_MSG_MAX_SZ) {
            return Err(EncodingError::PayloadTooLarge.into());
        }
        match (self.qos, self.packet_id) {
            (QoS::ExactlyOnce, _) => Err(Error::UnsupportedQoS),
            (QoS::AtLeastOnce, None) => Err(EncodingError::MissingPacketId.into()),
            (QoS::AtLeastOnce, Some(0)) => Err(EncodingError::MissingPacketId.into()),
            _ => Ok(()),
        }
    }

    /// Encode everything but the payload: fixed header, topic and packet
    /// identifier. The payload can then be written straight from the caller's
    /// slice without copying it.
    pub fn encode_header(&self, buf: &mut [u8], max_payload: usize) -> Result<usize, Error> {
        self.validate(max_payload)?;
        let remaining = checked_remaining(self.variable_header_len() + self.payload.len())?;
        let mut w = Writer::new(buf);
        w.put_fixed_header(self.first_byte(), remaining)?;
        w.put_prefixed(self.topic.as_bytes())?;
        if self.qos > QoS::AtMostOnce {
            if let Some(id) = self.packet_id {
                w.put_u16(id)?;
            }
        }
        Ok(w.finish())
    }
}

/// SUBSCRIBE request for a single topic.
///
/// Multi-topic requests are only ever encoded, with
/// [`encode_subscribe_multiple`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Subscribe<'a> {
    /// Packet identifier echoed by the SUBACK.
    pub packet_id: u16,
    /// Topic filter.
    pub topic: &'a str,
    /// Requested QoS.
    pub qos: QoS,
}

/// SUBACK response: one return code per requested topic, in request order.
///
/// ```rust
/// use minimqtt::mqtt::packet::{QoS, SubAck};
///
/// let ack = SubAck::new(3, &[0x01, 0x80]).unwrap();
/// assert_eq!(ack.return_codes(), &[0x01, 0x80]);
/// assert_eq!(ack.granted_qos(), Ok(QoS::AtLeastOnce));
/// assert!(ack.granted_qos_at(1).unwrap().is_err());
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubAck {
    /// Identifier of the SUBSCRIBE being acknowledged.
    pub packet_id: u16,
    codes: [u8; MAX_SUBSCRIBE_TOPICS],
    count: u8,
}

impl SubAck {
    /// Build a SUBACK from its return codes.
    ///
    /// Each code must be 0, 1, 2 or `0x80`, and there must be between one and
    /// [`MAX_SUBSCRIBE_TOPICS`] of them.
    pub fn new(packet_id: u16, return_codes: &[u8]) -> Result<Self, MalformedFrame> {
        if return_codes.is_empty() || return_codes.len() > MAX_SUBSCRIBE_TOPICS {
            return Err(MalformedFrame::InvalidLength);
        }
        if return_codes.iter().any(|&code| code > 2 && code != SUBACK_FAILURE) {
            return Err(MalformedFrame::InvalidReturnCode);
        }
        let mut codes = [0u8; MAX_SUBSCRIBE_TOPICS];
        codes[..return_codes.len()].copy_from_slice(return_codes);
        Ok(Self {
            packet_id,
            codes,
            count: return_codes.len() as u8,
        })
    }

    /// Granted QoS (0, 1, 2) or `0x80` for each requested topic.
    pub fn return_codes(&self) -> &[u8] {
        &self.codes[..self.count as usize]
    }

    /// Outcome for the first (or only) requested topic.
    pub fn granted_qos(&self) -> Result<QoS, Error> {
        granted(self.codes[0])
    }

    /// Outcome for the topic at `index`, or `None` past the last code.
    pub fn granted_qos_at(&self, index: usize) -> Option<Result<QoS, Error>> {
        self.return_codes().get(index).map(|&code| granted(code))
    }
}

/// The granted QoS, or [`Error::SubscriptionRejected`] for `0x80`.
fn granted(code: u8) -> Result<QoS, Error> {
    if code == SUBACK_FAILURE {
        return Err(Error::SubscriptionRejected);
    }
    QoS::try_from(code).map_err(|_| MalformedFrame::InvalidReturnCode.into())
}

/// UNSUBSCRIBE request for a single topic.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Unsubscribe<'a> {
    /// Packet identifier echoed by the UNSUBACK.
    pub packet_id: u16,
    /// Topic filter to remove.
    pub topic: &'a str,
}

/// A complete MQTT 3.1.1 control packet, borrowing its strings and payload.
///
/// QoS 2 handshake packets (PUBREC, PUBREL, PUBCOMP) have no variant: the
/// client does not implement exactly-once delivery.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlPacket<'a> {
    /// CONNECT.
    Connect(Connect<'a>),
    /// CONNACK.
    ConnAck(ConnAck),
    /// PUBLISH.
    Publish(Publish<'a>),
    /// PUBACK with its packet identifier.
    PubAck(u16),
    /// Single-topic SUBSCRIBE.
    Subscribe(Subscribe<'a>),
    /// SUBACK.
    SubAck(SubAck),
    /// Single-topic UNSUBSCRIBE.
    Unsubscribe(Unsubscribe<'a>),
    /// UNSUBACK with its packet identifier.
    UnsubAck(u16),
    /// PINGREQ.
    PingReq,
    /// PINGRESP.
    PingResp,
    /// DISCONNECT.
    Disconnect,
}

impl<'a> ControlPacket<'a> {
    /// Type nibble of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            ControlPacket::Connect(_) => PacketType::Connect,
            ControlPacket::ConnAck(_) => PacketType::ConnAck,
            ControlPacket::Publish(_) => PacketType::Publish,
            ControlPacket::PubAck(_) => PacketType::PubAck,
            ControlPacket::Subscribe(_) => PacketType::Subscribe,
            ControlPacket::SubAck(_) => PacketType::SubAck,
            ControlPacket::Unsubscribe(_) => PacketType::Unsubscribe,
            ControlPacket::UnsubAck(_) => PacketType::UnsubAck,
            ControlPacket::PingReq => PacketType::PingReq,
            ControlPacket::PingResp => PacketType::PingResp,
            ControlPacket::Disconnect => PacketType::Disconnect,
        }
    }

    /// Encode into `buf`, returning the frame length. PUBLISH payloads are
    /// bounded only by the protocol maximum here.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        match self {
            ControlPacket::Connect(connect) => encode_connect(buf, connect),
            ControlPacket::Publish(publish) => encode_publish(buf, publish, MQTT_MSG_MAX_SZ),
            ControlPacket::Subscribe(s) => encode_subscribe(buf, s.topic, s.qos, s.packet_id),
            ControlPacket::Unsubscribe(u) => encode_unsubscribe(buf, u.topic, u.packet_id),
            ControlPacket::ConnAck(ack) => {
                let mut w = Writer::new(buf);
                w.put_slice(&[0x20, 0x02, ack.session_present as u8, ack.return_code])?;
                Ok(w.finish())
            }
            ControlPacket::PubAck(id) => encode_ack(buf, 0x40, *id),
            ControlPacket::SubAck(ack) => {
                let codes = ack.return_codes();
                let mut w = Writer::new(buf);
                w.put_fixed_header(0x90, 2 + codes.len())?;
                w.put_u16(ack.packet_id)?;
                w.put_slice(codes)?;
                Ok(w.finish())
            }
            ControlPacket::UnsubAck(id) => encode_ack(buf, 0xB0, *id),
            ControlPacket::PingReq => encode_empty(buf, 0xC0),
            ControlPacket::PingResp => encode_empty(buf, 0xD0),
            ControlPacket::Disconnect => encode_empty(buf, 0xE0),
        }
    }

    /// Decode one complete frame from the start of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied. A buffer that
    /// ends before the declared remaining length fails with
    /// [`MalformedFrame::Truncated`]; PUBREC/PUBREL/PUBCOMP fail with
    /// [`Error::UnsupportedQoS`].
    pub fn decode(buf: &'a [u8]) -> Result<(Self, usize), Error> {
        let mut reader = buf;
        let first = read_u8(&mut reader)?;
        let header = decode_fixed_header(first)?;
        let remaining = decode_remaining_length(&mut reader)?;
        let header_len = buf.len() - reader.len();
        let body = reader
            .get(..remaining)
            .ok_or(MalformedFrame::Truncated)?;
        let packet = decode_body(header, body)?;
        Ok((packet, header_len + remaining))
    }
}

fn encode_ack(buf: &mut [u8], first: u8, packet_id: u16) -> Result<usize, Error> {
    let mut w = Writer::new(buf);
    w.put_slice(&[first, 0x02])?;
    w.put_u16(packet_id)?;
    Ok(w.finish())
}

fn encode_empty(buf: &mut [u8], first: u8) -> Result<usize, Error> {
    let mut w = Writer::new(buf);
    w.put_slice(&[first, 0x00])?;
    Ok(w.finish())
}

/// Encode a CONNECT frame.
///
/// Fails with [`EncodingError::InvalidClientId`] for an empty identifier or
/// one above 23 bytes unless `extended_client_id` is set.
pub fn encode_connect(buf: &mut [u8], connect: &Connect<'_>) -> Result<usize, Error> {
    connect.validate()?;
    let remaining = checked_remaining(connect.remaining_length())?;
    let mut w = Writer::new(buf);
    w.put_fixed_header(0x10, remaining)?;
    w.put_prefixed(PROTOCOL_NAME)?;
    w.put_u8(PROTOCOL_LEVEL)?;
    w.put_u8(connect.flags())?;
    w.put_u16(connect.keep_alive)?;
    w.put_prefixed(connect.client_id.as_bytes())?;
    if let Some(will) = &connect.will {
        w.put_prefixed(will.topic.as_bytes())?;
        w.put_prefixed(will.message)?;
    }
    if let Some(username) = connect.username {
        w.put_prefixed(username.as_bytes())?;
    }
    if let Some(password) = connect.password {
        w.put_prefixed(password.as_bytes())?;
    }
    Ok(w.finish())
}

/// Encode a complete PUBLISH frame, payload included.
///
/// Remaining length is `2 + len(topic) + len(payload)`, plus 2 for the packet
/// identifier when QoS is above 0.
pub fn encode_publish(buf: &mut [u8], publish: &Publish<'_>, max_payload: usize) -> Result<usize, Error> {
    let header_len = publish.encode_header(buf, max_payload)?;
    let mut w = Writer::new(&mut buf[header_len..]);
    w.put_slice(publish.payload)?;
    Ok(header_len + w.finish())
}

/// Encode a single-topic SUBSCRIBE frame (`0x82`).
pub fn encode_subscribe(buf: &mut [u8], topic: &str, qos: QoS, packet_id: u16) -> Result<usize, Error> {
    encode_subscribe_multiple(buf, &[(topic, qos)], packet_id)
}

/// Encode one SUBSCRIBE frame carrying every `(topic, qos)` pair, in order.
///
/// Fails with [`EncodingError::TopicCount`] for an empty list or one longer
/// than [`MAX_SUBSCRIBE_TOPICS`].
pub fn encode_subscribe_multiple(buf: &mut [u8], topics: &[(&str, QoS)], packet_id: u16) -> Result<usize, Error> {
    let mut len = encode_subscribe_header(buf, topics, packet_id)?;
    for &(topic, qos) in topics {
        len += encode_subscribe_filter(&mut buf[len..], topic, qos)?;
    }
    Ok(len)
}

/// Encode the fixed header and packet identifier of a SUBSCRIBE for
/// `topics`, after validating all of them. The filters follow, one
/// [`encode_subscribe_filter`] each.
pub fn encode_subscribe_header(buf: &mut [u8], topics: &[(&str, QoS)], packet_id: u16) -> Result<usize, Error> {
    if topics.is_empty() || topics.len() > MAX_SUBSCRIBE_TOPICS {
        return Err(EncodingError::TopicCount.into());
    }
    let mut remaining = 2;
    for &(topic, qos) in topics {
        validate_topic(topic)?;
        if qos == QoS::ExactlyOnce {
            return Err(Error::UnsupportedQoS);
        }
        remaining += prefixed_len(topic.as_bytes()) + 1;
    }
    let mut w = Writer::new(buf);
    w.put_fixed_header(0x82, checked_remaining(remaining)?)?;
    w.put_u16(packet_id)?;
    Ok(w.finish())
}

/// Encode one SUBSCRIBE topic filter: length-prefixed topic, then the
/// requested QoS byte.
pub fn encode_subscribe_filter(buf: &mut [u8], topic: &str, qos: QoS) -> Result<usize, Error> {
    let mut w = Writer::new(buf);
    w.put_prefixed(topic.as_bytes())?;
    w.put_u8(qos as u8)?;
    Ok(w.finish())
}

/// Encode a single-topic UNSUBSCRIBE frame (`0xA2`).
pub fn encode_unsubscribe(buf: &mut [u8], topic: &str, packet_id: u16) -> Result<usize, Error> {
    validate_topic(topic)?;
    let remaining = 2 + prefixed_len(topic.as_bytes());
    let mut w = Writer::new(buf);
    w.put_fixed_header(0xA2, remaining)?;
    w.put_u16(packet_id)?;
    w.put_prefixed(topic.as_bytes())?;
    Ok(w.finish())
}

/// PUBACK for an inbound QoS 1 publish.
pub fn encode_puback(packet_id: u16) -> [u8; 4] {
    let [hi, lo] = packet_id.to_be_bytes();
    [0x40, 0x02, hi, lo]
}

/// PINGREQ frame.
pub const PINGREQ: [u8; 2] = [0xC0, 0x00];
/// DISCONNECT frame.
pub const DISCONNECT: [u8; 2] = [0xE0, 0x00];

/// Parse a PUBLISH body (the `remaining_length` bytes after the fixed
/// header): topic, packet identifier iff QoS > 0, then the payload.
pub fn decode_publish_body(header: FixedHeader, body: &[u8]) -> Result<Publish<'_>, MalformedFrame> {
    let qos = header.qos()?;
    let mut cursor = Cursor { buf: body };
    let topic = cursor.str()?;
    let packet_id = if qos > QoS::AtMostOnce {
        Some(cursor.packet_id()?)
    } else {
        None
    };
    Ok(Publish {
        topic,
        payload: cursor.rest(),
        qos,
        retain: header.retain(),
        dup: header.dup(),
        packet_id,
    })
}

/// Parse a frame body whose fixed header has already been decoded.
pub fn decode_body(header: FixedHeader, body: &[u8]) -> Result<ControlPacket<'_>, Error> {
    let mut cursor = Cursor { buf: body };
    let packet = match header.packet_type {
        PacketType::Publish => return Ok(ControlPacket::Publish(decode_publish_body(header, body)?)),
        PacketType::ConnAck => {
            let ack_flags = cursor.u8()?;
            if ack_flags & 0xFE != 0 {
                return Err(MalformedFrame::InvalidFlags.into());
            }
            ControlPacket::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 != 0,
                return_code: cursor.u8()?,
            })
        }
        PacketType::PubAck => ControlPacket::PubAck(cursor.packet_id()?),
        PacketType::UnsubAck => ControlPacket::UnsubAck(cursor.packet_id()?),
        PacketType::SubAck => {
            let packet_id = cursor.packet_id()?;
            ControlPacket::SubAck(SubAck::new(packet_id, cursor.rest())?)
        }
        PacketType::Subscribe => {
            let packet_id = cursor.packet_id()?;
            let topic = cursor.str()?;
            let qos = QoS::try_from(cursor.u8()?).map_err(|_| MalformedFrame::InvalidQoS)?;
            ControlPacket::Subscribe(Subscribe { packet_id, topic, qos })
        }
        PacketType::Unsubscribe => {
            let packet_id = cursor.packet_id()?;
            ControlPacket::Unsubscribe(Unsubscribe {
                packet_id,
                topic: cursor.str()?,
            })
        }
        PacketType::Connect => ControlPacket::Connect(decode_connect_body(&mut cursor)?),
        PacketType::PingReq => ControlPacket::PingReq,
        PacketType::PingResp => ControlPacket::PingResp,
        PacketType::Disconnect => ControlPacket::Disconnect,
        PacketType::PubRec | PacketType::PubRel | PacketType::PubComp => {
            return Err(Error::UnsupportedQoS);
        }
    };
    cursor.end()?;
    Ok(packet)
}

fn decode_connect_body<'a>(cursor: &mut Cursor<'a>) -> Result<Connect<'a>, MalformedFrame> {
    if cursor.bytes()? != PROTOCOL_NAME || cursor.u8()? != PROTOCOL_LEVEL {
        return Err(MalformedFrame::InvalidProtocol);
    }
    let flags = cursor.u8()?;
    if flags & 0x01 != 0 {
        return Err(MalformedFrame::InvalidFlags);
    }
    let keep_alive = cursor.u16()?;
    let client_id = cursor.str()?;
    let will = if flags & 0x04 != 0 {
        let qos = QoS::try_from((flags >> 3) & 0b11).map_err(|_| MalformedFrame::InvalidQoS)?;
        Some(LastWill {
            topic: cursor.str()?,
            message: cursor.bytes()?,
            qos,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 { Some(cursor.str()?) } else { None };
    let password = if flags & 0x40 != 0 { Some(cursor.str()?) } else { None };
    Ok(Connect {
        client_id,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        username,
        password,
        will,
        extended_client_id: client_id.len() > MAX_CLIENT_ID_LEN,
    })
}
