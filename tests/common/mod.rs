#![allow(dead_code)]

use minimqtt::mqtt::{Client, Options, Platform};
use minimqtt::network::error::Error;
use minimqtt::network::*;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// Broker side of a mock connection, shared between the test and the client.
#[derive(Debug, Default)]
pub struct Wire {
    /// Chunks handed out by `read`, in order. An empty chunk is one read
    /// timeout; an exhausted queue times out forever.
    pub inbound: VecDeque<Vec<u8>>,
    /// Everything the client wrote.
    pub outbound: Vec<u8>,
    pub closed: bool,
    pub connects: usize,
    /// Connection attempts still to be refused.
    pub refuse_connects: usize,
    pub timeouts: Vec<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct SharedWire(pub Rc<RefCell<Wire>>);

impl SharedWire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the client to read.
    pub fn push(&self, bytes: &[u8]) {
        self.0.borrow_mut().inbound.push_back(bytes.to_vec());
    }

    /// Queue one read timeout.
    pub fn push_timeout(&self) {
        self.0.borrow_mut().inbound.push_back(Vec::new());
    }

    /// Take the bytes written so far.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.borrow_mut().outbound)
    }

    pub fn outbound(&self) -> Vec<u8> {
        self.0.borrow().outbound.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    pub fn connects(&self) -> usize {
        self.0.borrow().connects
    }

    pub fn refuse_connects(&self, count: usize) {
        self.0.borrow_mut().refuse_connects = count;
    }
}

#[derive(Debug)]
pub struct MockConnection {
    wire: SharedWire,
}

impl Read for MockConnection {
    type Error = Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut wire = self.wire.0.borrow_mut();
        if wire.closed {
            return Err(Error::ConnectionClosed);
        }
        let Some(mut chunk) = wire.inbound.pop_front() else {
            return Ok(0);
        };
        if chunk.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(chunk.len());
        buf[..len].copy_from_slice(&chunk[..len]);
        let rest = chunk.split_off(len);
        if !rest.is_empty() {
            wire.inbound.push_front(rest);
        }
        Ok(len)
    }
}

impl Write for MockConnection {
    type Error = Error;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut wire = self.wire.0.borrow_mut();
        if wire.closed {
            return Err(Error::WriteError);
        }
        wire.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Close for MockConnection {
    type Error = Error;

    fn close(self) -> Result<(), Self::Error> {
        self.wire.0.borrow_mut().closed = true;
        Ok(())
    }
}

impl Timeout for MockConnection {
    type Error = Error;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Self::Error> {
        self.wire.0.borrow_mut().timeouts.push(timeout);
        Ok(())
    }
}

impl Connection for MockConnection {}

#[derive(Debug)]
pub struct MockNetwork {
    pub wire: SharedWire,
}

impl Connect for MockNetwork {
    type Connection = MockConnection;
    type Error = Error;

    fn connect(&mut self, _remote: &str, _port: u16, _mode: TransportMode) -> Result<Self::Connection, Self::Error> {
        let mut wire = self.wire.0.borrow_mut();
        wire.connects += 1;
        if wire.refuse_connects > 0 {
            wire.refuse_connects -= 1;
            return Err(Error::ConnectFailed);
        }
        wire.closed = false;
        Ok(MockConnection {
            wire: self.wire.clone(),
        })
    }
}

/// Board with a hand-driven clock.
#[derive(Debug, Clone)]
pub struct MockPlatform {
    pub clock: Rc<Cell<u64>>,
    pub resets: Rc<Cell<u32>>,
    seed: u32,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            clock: Rc::new(Cell::new(0)),
            resets: Rc::new(Cell::new(0)),
            seed: 7,
        }
    }
}

impl Platform for MockPlatform {
    fn unique_id(&self) -> &[u8] {
        &[0x2A, 0x07, 0xC3]
    }

    fn random(&mut self) -> u32 {
        self.seed = self.seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        self.seed >> 16
    }

    fn now_ms(&self) -> u64 {
        self.clock.get()
    }

    fn delay(&mut self, duration: Duration) {
        self.clock.set(self.clock.get() + duration.as_millis() as u64);
    }

    fn hard_reset(&mut self) {
        self.resets.set(self.resets.get() + 1);
    }
}

pub type TestClient<'a> = Client<'a, MockNetwork, MockPlatform>;

pub const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

pub fn options() -> Options<'static> {
    Options::new("broker.test")
        .with_mode(TransportMode::Tcp)
        .with_client_id("test-client")
        .with_ack_timeout(Duration::from_secs(5))
}

pub fn client<'a>(wire: &SharedWire, platform: MockPlatform) -> TestClient<'a> {
    Client::new(MockNetwork { wire: wire.clone() }, platform, options()).unwrap()
}

/// A client that has completed the handshake; the CONNECT bytes are discarded.
pub fn connected<'a>(wire: &SharedWire) -> TestClient<'a> {
    let mut client = client(wire, MockPlatform::new());
    wire.push(&CONNACK_ACCEPTED);
    client.connect(true).unwrap();
    wire.take_outbound();
    client
}
