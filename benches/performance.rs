//! Performance benchmarks for the synsweep hot paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use synsweep::network::packet::{PacketParser, TcpPacketBuilder};
use synsweep::scanner::ProbeCorrelator;
use synsweep::AddressRangeParser;

/// Benchmark packet crafting performance
fn bench_packet_crafting(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_crafting");
    let src: IpAddr = "192.168.1.1".parse().unwrap();
    let dst: IpAddr = "192.168.1.100".parse().unwrap();
    let src6: IpAddr = "2001:db8::1".parse().unwrap();
    let dst6: IpAddr = "2001:db8::100".parse().unwrap();

    group.bench_function("ipv4_syn", |b| {
        b.iter(|| {
            let packet = TcpPacketBuilder::new(black_box(src), black_box(dst), 40000, 80)
                .syn()
                .seq_num(black_box(0x1234_5678))
                .build();
            black_box(packet)
        })
    });

    group.bench_function("ipv6_syn", |b| {
        b.iter(|| {
            let packet = TcpPacketBuilder::new(black_box(src6), black_box(dst6), 40000, 80)
                .syn()
                .build();
            black_box(packet)
        })
    });

    group.finish();
}

/// Benchmark reply parsing
fn bench_packet_parsing(c: &mut Criterion) {
    let reply = TcpPacketBuilder::new(
        "10.0.0.1".parse().unwrap(),
        "192.168.1.10".parse().unwrap(),
        80,
        40000,
    )
    .flags(0x12)
    .build()
    .unwrap();

    c.bench_function("parse_ipv4_syn_ack", |b| {
        b.iter(|| black_box(PacketParser::parse_ipv4_tcp(black_box(&reply))))
    });
}

/// Benchmark token derivation and reply matching
fn bench_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation");

    group.bench_function("token", |b| {
        let correlator =
            ProbeCorrelator::new(443, 0xfeed, Duration::from_secs(2), 32768..=60999);
        let addr: IpAddr = "10.20.30.40".parse().unwrap();
        b.iter(|| black_box(correlator.token(black_box(&addr))))
    });

    for in_flight in [1_000u32, 65_536] {
        group.bench_with_input(
            BenchmarkId::new("register_resolve", in_flight),
            &in_flight,
            |b, &in_flight| {
                let mut correlator =
                    ProbeCorrelator::new(443, 0xfeed, Duration::from_secs(2), 32768..=60999);
                let now = Instant::now();
                for i in 0..in_flight {
                    correlator.register(IpAddr::from((0x0a00_0000u32 + i).to_be_bytes()), now);
                }
                let target: IpAddr = "172.16.0.1".parse().unwrap();

                b.iter(|| {
                    let probe = correlator.register(target, now);
                    let reply = synsweep::network::packet::TcpResponse {
                        source_ip: target,
                        source_port: 443,
                        dest_port: probe.token.source_port,
                        flags: 0x12,
                        seq_num: 1,
                        ack_num: probe.token.sequence.wrapping_add(1),
                    };
                    black_box(correlator.resolve(&reply, now))
                })
            },
        );
    }

    group.finish();
}

/// Benchmark target list parsing
fn bench_address_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_parsing");

    let lines: String = (0..5_000)
        .map(|i| format!("10.{}.{}.0/24\n", i / 256, i % 256))
        .collect();
    group.bench_function("5000_cidr_lines", |b| {
        b.iter(|| black_box(AddressRangeParser::new().parse(black_box(&lines))))
    });

    let space = AddressRangeParser::new().parse("10.0.0.0/8").unwrap();
    group.bench_function("enumerate_65536", |b| {
        b.iter(|| black_box(space.iter().take(65_536).count()))
    });
    group.bench_function("random_access", |b| {
        b.iter(|| black_box(space.get(black_box(12_345_678))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_crafting,
    bench_packet_parsing,
    bench_correlation,
    bench_address_parsing
);
criterion_main!(benches);
