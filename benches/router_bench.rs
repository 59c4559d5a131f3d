//! Routing and codec benchmarks for chargemesh

use chargemesh::addressing::RequestId;
use chargemesh::crypto::{ActionPattern, Identity, SignaturePolicy, SignatureRule};
use chargemesh::network::ChannelId;
use chargemesh::protocol::{CodecConfig, CodecSet, WireFormat, DEFAULT_MAX_PAYLOAD_SIZE};
use chargemesh::{Envelope, NextHop, NodeId, Payload, RoutingTable};
use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::hint::black_box;

fn id(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

fn meter_values() -> Envelope {
    Envelope::request(
        RequestId::new(1_000_042),
        id("CS-1"),
        NodeId::controller(),
        "MeterValues",
        Payload::Structured(json!({
            "connectorId": 1,
            "transactionId": 7781,
            "meterValue": [{
                "timestamp": "2024-05-01T10:00:00Z",
                "sampledValue": [{"value": "1234.5", "measurand": "Energy.Active.Import.Register"}]
            }]
        })),
    )
}

fn benchmark_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for size in [10usize, 1_000, 10_000] {
        let table = RoutingTable::new(id("HUB-1"));
        let now = Utc::now();
        for i in 0..size {
            let destination = id(&format!("CS-{}", i));
            let next_hop = NextHop::Channel(ChannelId::new("down"));
            table.add_static_route(destination.clone(), next_hop, 1, now, None);
            table.learn_route(destination, NextHop::Channel(ChannelId::new("up")), 2, now, None);
        }
        let target = id(&format!("CS-{}", size / 2));

        group.bench_with_input(BenchmarkId::from_parameter(size), &target, |b, target| {
            b.iter(|| black_box(table.resolve(black_box(target))))
        });
    }

    group.finish();
}

fn benchmark_codecs(c: &mut Criterion) {
    let codecs = CodecSet::new(CodecConfig {
        max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
    });
    let envelope = meter_values();
    let mut group = c.benchmark_group("codec");

    for format in [WireFormat::Text, WireFormat::Binary] {
        let frame = codecs.encode(format, &envelope).unwrap();

        group.bench_function(BenchmarkId::new("encode", format!("{:?}", format)), |b| {
            b.iter(|| black_box(codecs.encode(format, black_box(&envelope))))
        });
        group.bench_function(BenchmarkId::new("decode", format!("{:?}", format)), |b| {
            b.iter(|| black_box(codecs.decode(black_box(&frame))))
        });
    }

    group.finish();
}

fn benchmark_signing(c: &mut Criterion) {
    let policy = SignaturePolicy::with_default(SignatureRule::signed(ActionPattern::Any));
    let identity = Identity::from_seed(&[3u8; 32]);
    let public = identity.public_key();
    policy.keyring_mut().set_local("cs-1", identity);
    policy.keyring_mut().trust("cs-1", public);

    let envelope = meter_values();
    let signed = policy.apply(envelope.clone()).unwrap();

    c.bench_function("sign_envelope", |b| {
        b.iter(|| black_box(policy.apply(black_box(envelope.clone()))))
    });
    c.bench_function("verify_envelope", |b| {
        b.iter(|| black_box(policy.verify(black_box(&signed))))
    });
}

criterion_group!(benches, benchmark_resolve, benchmark_codecs, benchmark_signing);
criterion_main!(benches);
