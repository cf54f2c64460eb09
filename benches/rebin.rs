//! Criterion benchmarks for record decode and rebinning.
//!
//! Run with: cargo bench --bench rebin

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sndaq::payload::{codec, SCALER_UDT};
use sndaq::rebin::Rebinner;
use sndaq::simulate::{SyntheticConfig, SyntheticStream};

/// Rebin consecutive records of one module at several record lengths.
fn rebin_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebin_record");
    for slots in [25usize, 250, 2_500] {
        let scalers: Vec<u8> = (0..slots).map(|k| (k % 5) as u8).collect();
        let mut rebinner = Rebinner::with_origin(1, 0);
        let mut out = Vec::with_capacity(slots);
        let mut time = 0u64;
        group.throughput(Throughput::Elements(slots as u64));
        group.bench_with_input(BenchmarkId::from_parameter(slots), &slots, |b, _| {
            b.iter(|| {
                out.clear();
                rebinner.rebin(0, 1, time, black_box(&scalers), &mut out);
                time += slots as u64 * SCALER_UDT;
                black_box(out.len());
            });
        });
    }
    group.finish();
}

/// Decode a batch of encoded 250-slot records.
fn decode_records(c: &mut Criterion) {
    let frames: Vec<_> = SyntheticStream::new(SyntheticConfig::flat(100, 800.0, 1.0))
        .map(|r| codec::encode(&r).unwrap())
        .collect();
    let bytes: u64 = frames.iter().map(|f| f.len() as u64).sum();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(bytes));
    group.bench_function("batch", |b| {
        b.iter(|| black_box(codec::decode_batch(black_box(&frames))));
    });
    group.finish();
}

criterion_group!(benches, rebin_record, decode_records);
criterion_main!(benches);
