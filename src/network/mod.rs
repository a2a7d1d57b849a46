//! Transport abstraction layer for the MQTT engine.
//!
//! The MQTT session never touches sockets directly. It talks to a byte stream
//! through the small set of blocking traits defined here, so the same engine can
//! run over a TCP socket on a Linux gateway, a TLS session offloaded to a WiFi
//! co-processor, or a scripted mock in a test.
//!
//! # Read semantics
//!
//! [`Read::read`] returning `Ok(0)` means *no data arrived within the current
//! timeout*. The session treats that as "nothing to do" when idle and as an
//! acknowledgement timeout while it is waiting on a reply. Hard failures must be
//! reported through `Err`.

#![deny(unsafe_code)]

use core::convert::Infallible;
use core::time::Duration;

/// Common error types for transport operations
pub mod error;

/// `std::net::TcpStream` adapter
#[cfg(feature = "std")]
pub mod tcp;

/// Re-exports of common traits
pub mod prelude {
    pub use super::{Close, Connect, Connection, Read, Timeout, TransportMode, Write};
}

/// How the connector should reach the broker.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportMode {
    /// Plain TCP, conventionally port 1883.
    Tcp,
    /// TLS, conventionally port 8883.
    #[default]
    Tls,
}

impl TransportMode {
    /// The IANA-registered MQTT port for this mode.
    pub const fn default_port(self) -> u16 {
        match self {
            TransportMode::Tcp => 1883,
            TransportMode::Tls => 8883,
        }
    }
}

/// A blocking byte source.
pub trait Read {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Read available data, returning `Ok(0)` if nothing arrived before the timeout
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// A blocking byte sink.
pub trait Write {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Write data to the connection
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error>;
    /// Flush the write buffer
    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// Consumes a connection to shut it down.
pub trait Close {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Close the connection
    fn close(self) -> Result<(), Self::Error>;
}

/// Bounds every subsequent blocking read.
pub trait Timeout {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Set the read timeout used by the following [`Read::read`] calls
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Self::Error>;
}

/// A synchronous connection
pub trait Connection: Read + Write + Close + Timeout {}

/// A synchronous connector (client)
pub trait Connect {
    /// Associated connection type
    type Connection: Connection;
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Open a connection to `remote:port`
    fn connect(
        &mut self,
        remote: &str,
        port: u16,
        mode: TransportMode,
    ) -> Result<Self::Connection, Self::Error>;
}

/// Byte slices are readers, which lets the codec decode frames that are
/// already in memory through the same entry points it uses for sockets.
impl Read for &[u8] {
    type Error = Infallible;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let len = buf.len().min(self.len());
        let (head, tail) = self.split_at(len);
        buf[..len].copy_from_slice(head);
        *self = tail;
        Ok(len)
    }
}

/// Write every byte of `buf`, retrying short writes.
///
/// A write that accepts zero bytes is reported as a closed connection.
pub(crate) fn write_all<W: Write + ?Sized>(writer: &mut W, mut buf: &[u8]) -> Result<(), error::Error> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(error::Error::ConnectionClosed),
            Ok(n) => buf = &buf[n..],
            Err(_) => return Err(error::Error::WriteError),
        }
    }
    Ok(())
}
