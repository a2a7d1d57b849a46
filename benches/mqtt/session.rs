use criterion::{Criterion, Throughput};
use minimqtt::mqtt::{Client, Options, Platform, QoS};
use minimqtt::network::*;
use std::cell::Cell;
use std::convert::Infallible;
use std::hint::black_box;
use std::time::Duration;

const PREAMBLE: &[u8] = &[0x20, 0x02, 0x00, 0x00, 0x90, 0x03, 0x00, 0x01, 0x00];
const INBOUND: &[u8] = &[
    0x30, 0x0C, 0x00, 0x05, b'b', b'e', b'n', b'c', b'h', b'h', b'e', b'l', b'l', b'o',
];

/// Answers CONNECT and the first SUBSCRIBE, then repeats `INBOUND` forever
/// and swallows writes.
struct BenchConnection {
    preamble: &'static [u8],
    pos: usize,
}

impl Read for BenchConnection {
    type Error = Infallible;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if !self.preamble.is_empty() {
            let n = buf.len().min(self.preamble.len());
            buf[..n].copy_from_slice(&self.preamble[..n]);
            self.preamble = &self.preamble[n..];
            return Ok(n);
        }
        let n = buf.len().min(INBOUND.len() - self.pos);
        buf[..n].copy_from_slice(&INBOUND[self.pos..self.pos + n]);
        self.pos = (self.pos + n) % INBOUND.len();
        Ok(n)
    }
}

impl Write for BenchConnection {
    type Error = Infallible;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Close for BenchConnection {
    type Error = Infallible;

    fn close(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Timeout for BenchConnection {
    type Error = Infallible;

    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Connection for BenchConnection {}

struct BenchNetwork;

impl Connect for BenchNetwork {
    type Connection = BenchConnection;
    type Error = Infallible;

    fn connect(&mut self, _remote: &str, _port: u16, _mode: TransportMode) -> Result<Self::Connection, Self::Error> {
        Ok(BenchConnection {
            preamble: PREAMBLE,
            pos: 0,
        })
    }
}

struct BenchPlatform;

impl Platform for BenchPlatform {
    fn unique_id(&self) -> &[u8] {
        b"bench"
    }

    fn random(&mut self) -> u32 {
        4
    }

    fn now_ms(&self) -> u64 {
        0
    }

    fn delay(&mut self, _duration: Duration) {}

    fn hard_reset(&mut self) {}
}

fn setup_client<'a>() -> Client<'a, BenchNetwork, BenchPlatform> {
    let options = Options::new("bench.local")
        .with_mode(TransportMode::Tcp)
        .with_client_id("minimqtt-bench");
    let mut client = Client::new(BenchNetwork, BenchPlatform, options).unwrap();
    client.connect(true).expect("Failed to connect");
    client
}

pub fn bench_publish_qos0(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    let payload = b"hello from publish";
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("qos0", |b| {
        let mut client = setup_client();
        b.iter(|| {
            client
                .publish("minimqtt/bench-topic", black_box(payload), QoS::AtMostOnce, false)
                .expect("Failed to publish");
        });
    });
    group.finish();
}

pub fn bench_poll_dispatch(c: &mut Criterion) {
    let hits = Cell::new(0u64);
    let handler = |_: &str, payload: &[u8]| hits.set(hits.get() + payload.len() as u64);

    let mut group = c.benchmark_group("poll");
    group.throughput(Throughput::Bytes(INBOUND.len() as u64));
    group.bench_function("dispatch", |b| {
        let mut client = setup_client();
        client
            .subscribe("bench", Some(&handler), QoS::AtMostOnce)
            .expect("Failed to subscribe");
        b.iter(|| black_box(client.poll_once(Duration::from_millis(10)).unwrap()));
    });
    group.finish();
    black_box(hits.get());
}
