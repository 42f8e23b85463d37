// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    segment::{meta::SegmentMeta, Segment, SEGMENT_FILE_SUFFIX},
    uuid::InstanceUuid,
    vclock::Vclock,
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Ordered index of the segments in a log directory, keyed by the
/// signature of each segment's starting clock.
pub struct SegmentDirectory {
    path: PathBuf,
    instance_uuid: InstanceUuid,
    permissive: bool,
    index: BTreeMap<i64, Arc<Segment>>,
}

impl SegmentDirectory {
    /// Opens a log directory without scanning it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the directory is not readable.
    pub fn open<P: AsRef<Path>>(
        path: P,
        instance_uuid: InstanceUuid,
        permissive: bool,
    ) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Probe readability up front so a misconfigured path fails at
        // startup, not mid-recovery
        std::fs::read_dir(&path)?;

        Ok(Self {
            path,
            instance_uuid,
            permissive,
            index: BTreeMap::new(),
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuilds the index from the files currently on disk.
    ///
    /// Files that are not segments of this instance are skipped: wrong
    /// suffix, a name that does not parse as a signature, a foreign
    /// instance UUID, or a header clock that contradicts the file name.
    /// An unreadable header is an error in strict mode and a logged skip
    /// in permissive mode. Two distinct files indexed under one signature
    /// are always fatal.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn scan(&mut self) -> crate::Result<()> {
        let mut index = BTreeMap::new();

        for dirent in std::fs::read_dir(&self.path)? {
            let dirent = dirent?;

            if !dirent.file_type()?.is_file() {
                continue;
            }

            let path = dirent.path();

            if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_FILE_SUFFIX) {
                log::trace!("skipping non-segment file {path:?}");
                continue;
            }

            let Some(signature) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<i64>().ok())
            else {
                log::trace!("skipping {path:?}: name is not a signature");
                continue;
            };

            let meta = match SegmentMeta::from_file(&path) {
                Ok(meta) => meta,
                Err(e) if self.permissive => {
                    log::warn!("skipping {path:?}: unreadable header: {e:?}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if meta.instance_uuid != self.instance_uuid {
                log::trace!(
                    "skipping {path:?}: foreign instance {}",
                    meta.instance_uuid,
                );
                continue;
            }

            if meta.vclock.signature() != signature {
                log::warn!(
                    "skipping {path:?}: header clock {} does not match file name",
                    meta.vclock,
                );
                continue;
            }

            let segment = Arc::new(Segment {
                signature,
                path,
                meta,
            });

            if let Some(duplicate) = index.insert(signature, segment) {
                return Err(crate::Error::Corruption(format!(
                    "duplicate segment signature {signature}: {:?}",
                    duplicate.path,
                )));
            }
        }

        log::debug!(
            "scanned {:?}: {} segment(s) indexed",
            self.path,
            index.len(),
        );

        self.index = index;
        Ok(())
    }

    /// Returns the segment indexed under the given signature.
    #[must_use]
    pub fn get(&self, signature: i64) -> Option<Arc<Segment>> {
        self.index.get(&signature).cloned()
    }

    /// Returns the last segment whose starting clock signature does not
    /// exceed the given clock's, falling back to the first segment.
    ///
    /// The fallback lets recovery start at the earliest available segment
    /// and report the discontinuity through the gap check.
    #[must_use]
    pub fn match_vclock(&self, vclock: &Vclock) -> Option<Arc<Segment>> {
        let signature = vclock.signature();

        self.index
            .range(..=signature)
            .next_back()
            .or_else(|| self.index.iter().next())
            .map(|(_, segment)| segment.clone())
    }

    /// Returns the segment following the given signature.
    #[must_use]
    pub fn next_after(&self, signature: i64) -> Option<Arc<Segment>> {
        self.index
            .range(signature + 1..)
            .next()
            .map(|(_, segment)| segment.clone())
    }

    /// Returns the starting clock of the first segment.
    #[must_use]
    pub fn first_vclock(&self) -> Option<Vclock> {
        self.index
            .values()
            .next()
            .map(|segment| segment.meta.vclock.clone())
    }

    /// Returns the starting clock of the last segment.
    #[must_use]
    pub fn last_vclock(&self) -> Option<Vclock> {
        self.index
            .values()
            .next_back()
            .map(|segment| segment.meta.vclock.clone())
    }

    /// Counts indexed segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if no segment is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::writer::SegmentWriter;
    use std::io::Write;
    use test_log::test;

    fn meta(uuid: InstanceUuid, components: &[(u32, i64)]) -> SegmentMeta {
        SegmentMeta {
            instance_uuid: uuid,
            vclock: Vclock::from_components(components.iter().copied()),
            prev_vclock: None,
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn scan_skips_directory_noise() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let uuid = InstanceUuid::from_bytes(*b"scan-noise-test!");

        let writer = SegmentWriter::create(folder.path(), &meta(uuid, &[(1, 10)]))?;
        writer.seal()?;

        // Not a segment at all
        let mut junk = std::fs::File::create(folder.path().join("journal.txt"))?;
        write!(junk, "not a segment")?;

        // Right suffix, unparsable name
        std::fs::File::create(folder.path().join("latest.xlog"))?;

        // Foreign instance
        let foreign = InstanceUuid::from_bytes(*b"some-other-node!");
        let writer = SegmentWriter::create(folder.path(), &meta(foreign, &[(1, 50)]))?;
        writer.seal()?;

        let mut dir = SegmentDirectory::open(folder.path(), uuid, false)?;
        dir.scan()?;

        assert_eq!(1, dir.len());
        assert_eq!(
            Some(Vclock::from_components([(1, 10)])),
            dir.first_vclock()
        );

        Ok(())
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn match_vclock_picks_greatest_not_above() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let uuid = InstanceUuid::from_bytes(*b"match-vclock-tst");

        for start in [0, 100, 200] {
            let writer = SegmentWriter::create(folder.path(), &meta(uuid, &[(1, start)]))?;
            writer.seal()?;
        }

        let mut dir = SegmentDirectory::open(folder.path(), uuid, false)?;
        dir.scan()?;

        let hit = dir
            .match_vclock(&Vclock::from_components([(1, 150)]))
            .expect("should match");
        assert_eq!(100, hit.signature);

        // Below every segment: fall back to the first
        let hit = dir
            .match_vclock(&Vclock::new())
            .expect("should fall back to first");
        assert_eq!(0, hit.signature);

        let next = dir.next_after(100).expect("should have successor");
        assert_eq!(200, next.signature);
        assert!(dir.next_after(200).is_none());

        Ok(())
    }
}
