#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};
use wal_relay::{InstanceUuid, Row, SegmentMeta, SegmentWriter, Vclock};

/// Generates a random instance identity.
pub fn instance_uuid() -> InstanceUuid {
    InstanceUuid::from_bytes(rand::random())
}

/// Builds a clock from components.
pub fn vclock(components: &[(u32, i64)]) -> Vclock {
    Vclock::from_components(components.iter().copied())
}

/// Builds `count` consecutive rows for one replica, starting at
/// `first_lsn`.
pub fn rows(replica_id: u32, first_lsn: i64, count: i64) -> Vec<Row> {
    (0..count)
        .map(|i| {
            Row::new(
                replica_id,
                first_lsn + i,
                format!("row-{}", first_lsn + i).into_bytes(),
            )
        })
        .collect()
}

/// Writes a segment into `folder` and seals it.
///
/// Returns the end clock (the `prev_vclock` of a successor).
pub fn write_segment(
    folder: &Path,
    uuid: InstanceUuid,
    start: &[(u32, i64)],
    prev: Option<&[(u32, i64)]>,
    rows: &[Row],
) -> wal_relay::Result<Vclock> {
    let mut writer = open_segment(folder, uuid, start, prev)?;
    for row in rows {
        writer.write_row(row)?;
    }
    writer.seal()
}

/// Creates a segment writer without sealing, for unsealed-tail and
/// live-append scenarios.
pub fn open_segment(
    folder: &Path,
    uuid: InstanceUuid,
    start: &[(u32, i64)],
    prev: Option<&[(u32, i64)]>,
) -> wal_relay::Result<SegmentWriter> {
    SegmentWriter::create(
        folder,
        &SegmentMeta {
            instance_uuid: uuid,
            vclock: vclock(start),
            prev_vclock: prev.map(vclock),
        },
    )
}

/// Polls `predicate` until it holds or the deadline expires.
pub fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
