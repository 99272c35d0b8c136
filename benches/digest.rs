use std::io::Cursor;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use ingest_core::digest::{digest_reader, DigestSelection, MultiDigest};

const MIB: usize = 1024 * 1024;

fn make_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn bench_single_pass(c: &mut Criterion) {
    let payload = make_payload(16 * MIB);
    let mut group = c.benchmark_group("digest");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.sample_size(10);

    group.bench_function("all_digests_16mib", |b| {
        b.iter(|| {
            digest_reader(Cursor::new(&payload), 8 * MIB, DigestSelection::ALL).unwrap()
        })
    });
    group.bench_function("crc32c_only_16mib", |b| {
        let selection = DigestSelection {
            md5: false,
            multipart_tag: false,
            crc32c: true,
        };
        b.iter(|| digest_reader(Cursor::new(&payload), 8 * MIB, selection).unwrap())
    });
    group.bench_function("multipart_tag_small_chunks", |b| {
        b.iter(|| {
            let mut state = MultiDigest::new(MIB, DigestSelection {
                md5: false,
                multipart_tag: true,
                crc32c: false,
            });
            for piece in payload.chunks(64 * 1024) {
                state.update(piece);
            }
            state.finish()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_single_pass);
criterion_main!(benches);
