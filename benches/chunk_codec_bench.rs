use criterion::{black_box, criterion_group, criterion_main, Criterion};
use docstore::config::{ChecksumFlavor, CompressionAlgo};
use docstore::record::{decode_chunk, encode_chunk, Record};

fn make_records(count: usize, payload_len: usize) -> Vec<Record> {
    (0..count as u64)
        .map(|i| Record {
            serial: i,
            lid: i as u32,
            bytes: vec![(i % 256) as u8; payload_len],
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let records = make_records(64, 1024);
    for (name, algo) in [
        ("none", CompressionAlgo::None),
        ("lz4", CompressionAlgo::Lz4),
        ("zstd", CompressionAlgo::Zstd),
    ] {
        c.bench_function(&format!("encode_chunk_64x1kb_{name}"), |b| {
            b.iter(|| {
                encode_chunk(black_box(&records), algo, ChecksumFlavor::CcittCrc32).unwrap()
            })
        });
    }
}

fn bench_decode(c: &mut Criterion) {
    let records = make_records(64, 1024);
    for (name, algo) in [
        ("none", CompressionAlgo::None),
        ("lz4", CompressionAlgo::Lz4),
        ("zstd", CompressionAlgo::Zstd),
    ] {
        let frame = encode_chunk(&records, algo, ChecksumFlavor::CcittCrc32).unwrap();
        c.bench_function(&format!("decode_chunk_64x1kb_{name}"), |b| {
            b.iter(|| decode_chunk(black_box(&frame), false).unwrap())
        });
    }
}

fn bench_checksum_flavors(c: &mut Criterion) {
    let records = make_records(64, 1024);
    for flavor in [ChecksumFlavor::CcittCrc32, ChecksumFlavor::Xxh64] {
        let label = match flavor {
            ChecksumFlavor::CcittCrc32 => "crc32",
            ChecksumFlavor::Xxh64 => "xxh64",
        };
        c.bench_function(&format!("encode_chunk_checksum_{label}"), |b| {
            b.iter(|| encode_chunk(black_box(&records), CompressionAlgo::None, flavor).unwrap())
        });
    }
}

criterion_group!(benches, bench_encode, bench_decode, bench_checksum_flavors);
criterion_main!(benches);
