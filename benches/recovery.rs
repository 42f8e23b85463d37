use criterion::{criterion_group, criterion_main, Criterion};
use wal_relay::{Config, InstanceUuid, MockStream, Recovery, Row, SegmentMeta, SegmentWriter, Vclock};

fn vclock_ops(c: &mut Criterion) {
    let mut clock = Vclock::new();
    for replica_id in 0..16 {
        clock.follow(replica_id, 1_000);
    }
    let other = Vclock::from_components((0..16).map(|replica_id| (replica_id, 1_500)));

    c.bench_function("vclock signature 16 replicas", |b| {
        b.iter(|| clock.signature());
    });

    c.bench_function("vclock compare 16 replicas", |b| {
        b.iter(|| clock.compare(&other));
    });
}

fn replay(c: &mut Criterion) {
    let folder = tempfile::tempdir().unwrap();
    let uuid = InstanceUuid::from_bytes(*b"benchmark-node-0");

    let meta = SegmentMeta {
        instance_uuid: uuid,
        vclock: Vclock::new(),
        prev_vclock: None,
    };
    let mut writer = SegmentWriter::create(folder.path(), &meta).unwrap();
    for lsn in 1..=10_000 {
        writer
            .write_row(&Row::new(1, lsn, vec![0u8; 64]))
            .unwrap();
    }
    writer.seal().unwrap();

    c.bench_function("replay 10k rows", |b| {
        b.iter(|| {
            let mut recovery =
                Recovery::new(folder.path(), Config::new(uuid), Vclock::new()).unwrap();
            let mut stream = MockStream::default();
            recovery
                .recover_remaining(&mut stream, None, true)
                .unwrap();
            assert_eq!(10_000, stream.len());
        });
    });
}

criterion_group!(benches, vclock_ops, replay);
criterion_main!(benches);
