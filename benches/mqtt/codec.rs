use criterion::{BenchmarkId, Criterion, Throughput};
use heapless::Vec;
use minimqtt::mqtt::packet::{
    MQTT_MSG_SZ_LIM, Publish, QoS, decode_publish_body, decode_remaining_length, encode_publish,
    encode_remaining_length, read_frame,
};
use std::hint::black_box;

pub fn bench_encode_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_publish");
    let mut buf = [0u8; 2048];
    for size in [16usize, 256, 1024] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                let publish = Publish::new("sensors/greenhouse/temperature", payload, QoS::AtLeastOnce)
                    .with_packet_id(42);
                encode_publish(black_box(&mut buf), black_box(&publish), MQTT_MSG_SZ_LIM).unwrap()
            });
        });
    }
    group.finish();
}

pub fn bench_decode_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_publish");
    let payload = vec![0x5Au8; 256];
    let publish = Publish::new("sensors/greenhouse/temperature", &payload, QoS::AtLeastOnce).with_packet_id(7);
    let mut wire = [0u8; 512];
    let len = encode_publish(&mut wire, &publish, MQTT_MSG_SZ_LIM).unwrap();

    group.throughput(Throughput::Bytes(len as u64));
    group.bench_function("read_frame", |b| {
        let mut body: Vec<u8, 512> = Vec::new();
        b.iter(|| {
            let mut reader: &[u8] = black_box(&wire[..len]);
            let frame = read_frame(&mut reader, &mut body).unwrap().unwrap();
            let decoded = decode_publish_body(frame.header, &body).unwrap();
            black_box(decoded.payload.len())
        });
    });
    group.finish();
}

pub fn bench_remaining_length(c: &mut Criterion) {
    c.bench_function("remaining_length", |b| {
        b.iter(|| {
            for value in [0usize, 127, 16_383, 2_097_151, 268_435_455] {
                let encoded = encode_remaining_length(black_box(value)).unwrap();
                let mut reader: &[u8] = &encoded;
                black_box(decode_remaining_length(&mut reader).unwrap());
            }
        });
    });
}
