//! MQTT v3.1.1 client engine.
//!
//! * [`packet`] - wire codec: remaining-length varint, packet builders, frame
//!   reader and body parsers
//! * [`registry`] - exact-topic subscription table and the [`Handler`] trait
//! * [`client`] - the session state machine, [`Client`]
//! * [`reconnect`] - [`ReconnectPolicy`] and bounded reconnection
//! * [`platform`] - board services the session depends on
//! * [`error`] - the error taxonomy
//!
//! QoS 0 and 1 are supported in both directions. QoS 2 is refused with
//! [`Error::UnsupportedQoS`].

pub mod client;
pub mod error;
pub mod packet;
pub mod platform;
pub mod reconnect;
pub mod registry;

pub use client::{Client, Incoming, Message, Observer, Options, PendingAck, PendingRequest, RequestKind, State};
pub use error::{ConnectReturnCode, EncodingError, Error, MalformedFrame, ProtocolViolation};
pub use packet::{LastWill, QoS};
pub use platform::Platform;
pub use reconnect::ReconnectPolicy;
pub use registry::{Handler, Registry};
