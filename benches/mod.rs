use criterion::{criterion_group, criterion_main};

mod mqtt;

criterion_group!(
    benches,
    mqtt::codec::bench_encode_publish,
    mqtt::codec::bench_decode_publish,
    mqtt::codec::bench_remaining_length,
    mqtt::session::bench_publish_qos0,
    mqtt::session::bench_poll_dispatch
);
criterion_main!(benches);
