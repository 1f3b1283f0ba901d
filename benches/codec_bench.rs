use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use m2m_client::core::bencode::{decode, encode, CachingDecoder, Value};

fn sample_value(payload: usize) -> Value {
    Value::List(vec![
        Value::Int(102),
        Value::Int(42),
        Value::from("3f2b6c1e-7003-11e4-b2aa-474b3c38e550"),
        Value::dict([
            ("action", Value::from("sync")),
            ("blob", Value::Bytes(Bytes::from(vec![0xABu8; payload]))),
            ("retries", Value::Int(3)),
        ]),
    ])
}

#[allow(clippy::unwrap_used)]
fn bench_bencode(c: &mut Criterion) {
    let mut group = c.benchmark_group("bencode");
    let payload_sizes = [0usize, 64, 4096, 65536];

    for &size in &payload_sizes {
        let value = sample_value(size);
        let wire = encode(&value).unwrap();
        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter(|| encode(&value).unwrap())
        });
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter(|| decode(&wire).unwrap())
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_cached_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_decode");
    // Short frames like keep-alives and acks are where the cache pays off
    let frames: Vec<Vec<u8>> = (0..16)
        .map(|i| encode(&Value::List(vec![Value::Int(4), Value::from(format!("ok {i}"))])).unwrap())
        .collect();

    group.bench_function("uncached_short", |b| {
        b.iter(|| {
            for frame in &frames {
                decode(frame).unwrap();
            }
        })
    });

    let decoder = CachingDecoder::default();
    group.bench_function("cached_short", |b| {
        b.iter(|| {
            for frame in &frames {
                decoder.decode(frame).unwrap();
            }
        })
    });

    let thrashing = CachingDecoder::new(4, 100);
    group.bench_function("cached_short_evicting", |b| {
        b.iter(|| {
            for frame in &frames {
                thrashing.decode(frame).unwrap();
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_bencode, bench_cached_decode);
criterion_main!(benches);
