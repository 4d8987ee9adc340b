use crossbeam_channel::bounded;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;
use seven_link::demux::{Demultiplexer, DiagnosticSlots, Reassembler, RecordSink};
use seven_link::frame::{encode_network, encode_record, FrameEncoder, RecordTime};
use seven_link::{Command, RecordType};
use std::net::Ipv4Addr;
use std::sync::Arc;

fn message(rng: &mut ThreadRng, code: u32, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    encode_network(7125, 0, &encode_record(code, 7125, 0, RecordTime::now(), &data))
}

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    let encoder = FrameEncoder::new(7125, 0);
    let gain = Command::Gain(42.0);
    let request = Command::RecordRequest {
        ip: Ipv4Addr::new(192, 168, 0, 10),
        port: 5000,
        kind: seven_link::DeliveryKind::Udp,
        records: vec![
            RecordType::Ping,
            RecordType::Bathymetry,
            RecordType::Backscatter,
            RecordType::RawDetection,
        ],
    };

    // One ping's worth of records as the device sends them
    let ping: Vec<Vec<u8>> = [(7000, 156), (7006, 2048), (7008, 16384), (7027, 8192)]
        .iter()
        .map(|&(code, len)| message(&mut rng, code, len))
        .collect();
    let stream: Vec<u8> = ping.concat();

    c.bench_function("encode gain", |b| {
        b.iter(|| encoder.encode_command(black_box(&gain)))
    });

    c.bench_function("encode recordrequest", |b| {
        b.iter(|| encoder.encode_command(black_box(&request)))
    });

    c.bench_function("encode by name", |b| {
        b.iter(|| encoder.encode_named(black_box("snippetwindow"), black_box(&["1", "15"])))
    });

    c.bench_function("demultiplex ping", |b| {
        let (tx, rx) = bounded(1024);
        let mut demux = Demultiplexer::new(tx, Arc::new(DiagnosticSlots::default()));
        b.iter(|| {
            for chunk in &ping {
                demux.handle(black_box(chunk));
            }
            rx.try_iter().for_each(drop);
        })
    });

    c.bench_function("reassemble ping stream", |b| {
        let (tx, rx) = bounded(1024);
        let demux = Demultiplexer::new(tx, Arc::new(DiagnosticSlots::default()));
        let mut reassembler = Reassembler::new(demux);
        b.iter(|| {
            for piece in stream.chunks(1500) {
                reassembler.consume(black_box(piece)).unwrap();
            }
            rx.try_iter().for_each(drop);
        })
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
