use criterion::{criterion_group, criterion_main, BenchmarkId};
use raconteur::prelude::*;
use raconteur::transport::frame;
use raconteur::transport::StringTable;
use rand::prelude::*;

pub const KB: usize = 1024;

fn message_of(size: usize) -> Message {
    let mut rng = rand::thread_rng();
    let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
    Message::new().with_entry(
        MessageEntry::new(MessageEntryType::Other(1), "sample_member")
            .with_element(MessageElement::uint32("seq", 1))
            .with_element(MessageElement::new("data", ElementData::Bytes(data))),
    )
}

fn frame_encoding(c: &mut criterion::Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [1, KB, 4 * KB, 64 * KB, 1024 * KB].iter() {
        let msg = message_of(*size);
        group.bench_with_input(BenchmarkId::new("message2", size), &msg, |b, msg| {
            b.iter(|| frame::encode_message2(msg).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("message4", size), &msg, |b, msg| {
            b.iter(|| frame::encode_message4(msg, None, &mut Vec::new()).unwrap());
        });
    }
    group.finish();
}

fn frame_decoding(c: &mut criterion::Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [1, KB, 4 * KB, 64 * KB, 1024 * KB].iter() {
        let bytes = frame::encode_message4(&message_of(*size), None, &mut Vec::new()).unwrap();
        let header = frame::parse_header(&bytes, usize::MAX, true).unwrap();
        group.bench_with_input(BenchmarkId::new("message4", size), &bytes, |b, bytes| {
            b.iter(|| frame::decode_frame(bytes, &header, None).unwrap());
        });
    }
    group.finish();
}

fn string_table_lookup(c: &mut criterion::Criterion) {
    let table = StringTable::new();
    let msg = message_of(16);
    // Unconfirmed strings are spelled out; this measures the lookup cost alone
    c.bench_function("encode_message4_with_table", |b| {
        b.iter(|| {
            let mut proposals = Vec::new();
            frame::encode_message4(&msg, Some(&table), &mut proposals).unwrap()
        });
    });
}

criterion_group!(benches, frame_encoding, frame_decoding, string_table_lookup);
criterion_main!(benches);
