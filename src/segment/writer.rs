// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{meta::SegmentMeta, segment_file_name, EOF_MAGIC, MAX_ROW_SIZE, ROW_MAGIC};
use crate::{coding::Encode, row::Row, vclock::Vclock};
use byteorder::{BigEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Appends framed rows to a segment file.
///
/// The header is written on creation; [`SegmentWriter::seal`] terminates
/// the file with the EOF marker. A writer dropped without sealing leaves
/// the segment looking exactly like a crashed producer's: readable up to
/// the last complete frame, with no EOF marker.
pub struct SegmentWriter {
    path: PathBuf,
    inner: BufWriter<File>,
    end_vclock: Vclock,
    row_count: u64,
}

impl SegmentWriter {
    /// Creates a segment in `folder`, named by the signature of the
    /// starting clock, and writes its header.
    ///
    /// The file is staged under an `.inprogress` name and renamed into
    /// place only once the header is on disk, so a concurrent directory
    /// scan never sees a segment with a partial header.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn create<P: AsRef<Path>>(folder: P, meta: &SegmentMeta) -> crate::Result<Self> {
        let path = folder
            .as_ref()
            .join(segment_file_name(meta.vclock.signature()));
        let staging_path = path.with_extension("xlog.inprogress");

        log::debug!("creating segment {path:?} at {}", meta.vclock);

        let file = File::create(&staging_path)?;
        let mut inner = BufWriter::new(file);
        meta.write_into(&mut inner)?;

        inner.flush()?;
        inner.get_mut().sync_all()?;
        std::fs::rename(&staging_path, &path)?;

        Ok(Self {
            path,
            inner,
            end_vclock: meta.vclock.clone(),
            row_count: 0,
        })
    }

    /// Returns the segment file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the clock advanced past every written row.
    #[must_use]
    pub fn end_vclock(&self) -> &Vclock {
        &self.end_vclock
    }

    /// Returns the amount of rows written.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Appends one row frame.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or the row exceeds the
    /// frame cap.
    pub fn write_row(&mut self, row: &Row) -> crate::Result<()> {
        let payload = row.encode_into_vec()?;

        if payload.len() > MAX_ROW_SIZE as usize {
            return Err(crate::Error::IllegalParams(format!(
                "row of {} bytes exceeds the frame cap",
                payload.len(),
            )));
        }

        self.inner.write_all(ROW_MAGIC)?;
        self.inner
            .write_u64::<BigEndian>(xxhash_rust::xxh3::xxh3_64(&payload))?;

        // NOTE: Truncation is okay, the frame cap fits u32
        #[allow(clippy::cast_possible_truncation)]
        self.inner.write_u32::<BigEndian>(payload.len() as u32)?;
        self.inner.write_all(&payload)?;

        if row.lsn > self.end_vclock.get(row.replica_id) {
            self.end_vclock.follow(row.replica_id, row.lsn);
        }
        self.row_count += 1;

        Ok(())
    }

    /// Flushes buffered rows and fsyncs the file, making them visible to
    /// a concurrently polling cursor.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn flush(&mut self) -> crate::Result<()> {
        self.inner.flush()?;
        self.inner.get_mut().sync_all()?;
        Ok(())
    }

    /// Writes the EOF marker and fsyncs, finalizing the segment.
    ///
    /// Returns the end clock of the segment, which becomes the
    /// `prev_vclock` of its successor.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn seal(mut self) -> crate::Result<Vclock> {
        self.inner.write_all(EOF_MAGIC)?;
        self.flush()?;

        log::debug!(
            "sealed segment {:?} ({} rows, end clock {})",
            self.path,
            self.row_count,
            self.end_vclock,
        );

        Ok(self.end_vclock)
    }
}
