// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{meta::SegmentMeta, EOF_MAGIC, MAX_ROW_SIZE, ROW_MAGIC};
use crate::{coding::Decode, coding::DecodeError, row::Row, vclock::Vclock};
use byteorder::{BigEndian, ByteOrder};
use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

/// Result of advancing a segment cursor.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The next row in file order
    Row(Row),

    /// The file ends before a complete frame and carries no EOF marker.
    ///
    /// The writer may still be appending; the cursor stays usable and a
    /// later call re-reads from the same position.
    Pending,

    /// The EOF marker was read; the segment was cleanly finalized.
    ///
    /// Latched: every subsequent call reports EOF again.
    Eof,
}

enum FrameBody {
    Row(Row),
    Pending,
    Skip,
}

enum Resync {
    RowMagic,
    EofMagic,
    Truncated,
}

/// Reads through a segment in file order.
pub struct SegmentReader {
    path: PathBuf,
    inner: BufReader<File>,
    meta: SegmentMeta,
    end_vclock: Vclock,
    signature: i64,
    eof: bool,
    permissive: bool,
}

impl SegmentReader {
    /// Opens a cursor over a segment file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, the header is malformed
    /// or the header clock does not match the expected signature.
    pub fn open<P: AsRef<Path>>(
        path: P,
        expected_signature: i64,
        permissive: bool,
    ) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = BufReader::new(File::open(&path)?);

        let meta = SegmentMeta::from_reader(&mut inner)?;

        if meta.vclock.signature() != expected_signature {
            return Err(crate::Error::Corruption(format!(
                "segment {path:?} starts at {} but was indexed under signature {expected_signature}",
                meta.vclock,
            )));
        }

        let end_vclock = meta.vclock.clone();

        Ok(Self {
            path,
            inner,
            meta,
            end_vclock,
            signature: expected_signature,
            eof: false,
            permissive,
        })
    }

    /// Returns the segment header.
    #[must_use]
    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Returns the clock advanced past every row read so far.
    #[must_use]
    pub fn end_vclock(&self) -> &Vclock {
        &self.end_vclock
    }

    /// Returns the signature the segment is indexed under.
    #[must_use]
    pub fn signature(&self) -> i64 {
        self.signature
    }

    /// Returns the segment file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` once the EOF marker has been read.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Advances the cursor to the next row.
    ///
    /// Rows are returned in file order. In permissive mode framing noise,
    /// checksum failures and undecodable rows are logged and skipped; in
    /// strict mode they fail the read. The file descriptor is released
    /// when the reader is dropped.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or on corrupt data in
    /// strict mode.
    pub fn next_row(&mut self) -> crate::Result<ReadOutcome> {
        if self.eof {
            return Ok(ReadOutcome::Eof);
        }

        loop {
            let frame_start = self.inner.stream_position()?;

            let mut magic = [0u8; 8];
            if !self.read_fully(&mut magic, frame_start)? {
                return Ok(ReadOutcome::Pending);
            }

            if magic == EOF_MAGIC {
                self.eof = true;
                return Ok(ReadOutcome::Eof);
            }

            if magic != ROW_MAGIC {
                if !self.permissive {
                    return Err(crate::Error::Corruption(format!(
                        "invalid row frame in {:?} at offset {frame_start}",
                        self.path,
                    )));
                }

                log::warn!(
                    "skipping garbage in {:?} at offset {frame_start}",
                    self.path,
                );

                match self.resync(magic, frame_start)? {
                    Resync::RowMagic => {}
                    Resync::EofMagic => {
                        self.eof = true;
                        return Ok(ReadOutcome::Eof);
                    }
                    Resync::Truncated => return Ok(ReadOutcome::Pending),
                }
            }

            match self.read_frame_body(frame_start)? {
                FrameBody::Row(row) => {
                    if row.lsn > self.end_vclock.get(row.replica_id) {
                        self.end_vclock.follow(row.replica_id, row.lsn);
                    }
                    return Ok(ReadOutcome::Row(row));
                }
                FrameBody::Pending => return Ok(ReadOutcome::Pending),
                FrameBody::Skip => {}
            }
        }
    }

    /// Reads checksum, length and payload of one row frame.
    fn read_frame_body(&mut self, frame_start: u64) -> crate::Result<FrameBody> {
        let mut header = [0u8; 12];
        if !self.read_fully(&mut header, frame_start)? {
            return Ok(FrameBody::Pending);
        }

        let (checksum_bytes, len_bytes) = header.split_at(8);
        let expected_checksum = BigEndian::read_u64(checksum_bytes);
        let payload_len = BigEndian::read_u32(len_bytes);

        if payload_len > MAX_ROW_SIZE {
            if !self.permissive {
                return Err(crate::Error::Corruption(format!(
                    "row frame of {payload_len} bytes in {:?} exceeds the frame cap",
                    self.path,
                )));
            }
            log::warn!(
                "skipping oversized row frame in {:?} at offset {frame_start}",
                self.path,
            );
            return Ok(FrameBody::Skip);
        }

        let mut payload = vec![0u8; payload_len as usize];
        if !self.read_fully(&mut payload, frame_start)? {
            return Ok(FrameBody::Pending);
        }

        if xxhash_rust::xxh3::xxh3_64(&payload) != expected_checksum {
            if !self.permissive {
                return Err(crate::Error::Decode(DecodeError::InvalidChecksum));
            }
            log::warn!(
                "skipping row with bad checksum in {:?} at offset {frame_start}",
                self.path,
            );
            return Ok(FrameBody::Skip);
        }

        match Row::decode_from(&mut std::io::Cursor::new(payload)) {
            Ok(row) => Ok(FrameBody::Row(row)),
            Err(e) if self.permissive => {
                log::warn!(
                    "skipping undecodable row in {:?} at offset {frame_start}: {e:?}",
                    self.path,
                );
                Ok(FrameBody::Skip)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fills `buf`, or rewinds to `rewind_to` and reports `false` when the
    /// file ends first.
    fn read_fully(&mut self, buf: &mut [u8], rewind_to: u64) -> crate::Result<bool> {
        match self.inner.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.inner.seek(SeekFrom::Start(rewind_to))?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Scans forward for the next row or EOF magic after framing noise.
    fn resync(&mut self, window: [u8; 8], frame_start: u64) -> crate::Result<Resync> {
        let mut window = window;

        loop {
            if window == ROW_MAGIC {
                return Ok(Resync::RowMagic);
            }
            if window == EOF_MAGIC {
                return Ok(Resync::EofMagic);
            }

            let mut byte = [0u8; 1];
            if !self.read_fully(&mut byte, frame_start)? {
                return Ok(Resync::Truncated);
            }

            window.rotate_left(1);
            if let Some(last) = window.last_mut() {
                *last = byte[0];
            }
        }
    }
}
