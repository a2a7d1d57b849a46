//! Common error types for transport operations

use core::fmt;

/// A common error type for transport operations.
///
/// Transport implementations may use this as their associated error type, and
/// the MQTT session reports transport-level failures with it. It is designed to
/// be simple and portable for `no_std` environments.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The connector could not open a connection to the broker.
    ConnectFailed,
    /// An error occurred during a write operation.
    WriteError,
    /// An error occurred during a read operation.
    ReadError,
    /// An error occurred while closing the connection.
    CloseError,
    /// The connection was closed by the peer.
    ConnectionClosed,
    /// An invalid address was provided.
    InvalidAddress,
    /// The requested transport mode is not available.
    UnsupportedMode,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::ConnectFailed => "connection attempt failed",
            Error::WriteError => "write failed",
            Error::ReadError => "read failed",
            Error::CloseError => "close failed",
            Error::ConnectionClosed => "connection closed by peer",
            Error::InvalidAddress => "invalid broker address",
            Error::UnsupportedMode => "transport mode not supported",
        };
        f.write_str(text)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::ConnectFailed => defmt::write!(f, "ConnectFailed"),
            Error::WriteError => defmt::write!(f, "WriteError"),
            Error::ReadError => defmt::write!(f, "ReadError"),
            Error::CloseError => defmt::write!(f, "CloseError"),
            Error::ConnectionClosed => defmt::write!(f, "ConnectionClosed"),
            Error::InvalidAddress => defmt::write!(f, "InvalidAddress"),
            Error::UnsupportedMode => defmt::write!(f, "UnsupportedMode"),
        }
    }
}
