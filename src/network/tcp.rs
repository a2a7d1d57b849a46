//! Blocking TCP transport backed by [`std::net::TcpStream`].
//!
//! Only [`TransportMode::Tcp`] is supported. TLS needs a platform TLS stack and
//! is left to the integrator's own [`Connect`] implementation.

use super::error::Error;
use super::{Close, Connect, Connection, Read, Timeout, TransportMode, Write};
use core::time::Duration;
use std::io::{ErrorKind, Read as StdRead, Write as StdWrite};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

/// Opens [`TcpConnection`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpNetwork;

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    /// Wrap an already connected stream.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Connect for TcpNetwork {
    type Connection = TcpConnection;
    type Error = Error;

    fn connect(
        &mut self,
        remote: &str,
        port: u16,
        mode: TransportMode,
    ) -> Result<Self::Connection, Self::Error> {
        if mode != TransportMode::Tcp {
            return Err(Error::UnsupportedMode);
        }
        let addr = (remote, port)
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let stream = TcpStream::connect(addr).map_err(|_| Error::ConnectFailed)?;
        Ok(TcpConnection { stream })
    }
}

impl Read for TcpConnection {
    type Error = Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        match self.stream.read(buf) {
            // EOF is not a timeout, so it must not look like one
            Ok(0) if !buf.is_empty() => Err(Error::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(_) => Err(Error::ReadError),
        }
    }
}

impl Write for TcpConnection {
    type Error = Error;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.stream.write(buf).map_err(|_| Error::WriteError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.stream.flush().map_err(|_| Error::WriteError)
    }
}

impl Close for TcpConnection {
    type Error = Error;

    fn close(self) -> Result<(), Self::Error> {
        self.stream
            .shutdown(Shutdown::Both)
            .map_err(|_| Error::CloseError)
    }
}

impl Timeout for TcpConnection {
    type Error = Error;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Self::Error> {
        // std rejects a zero timeout; round it up to the smallest bounded wait.
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|_| Error::ReadError)
    }
}

impl Connection for TcpConnection {}
