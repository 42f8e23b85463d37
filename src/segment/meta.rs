// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    uuid::InstanceUuid,
    vclock::Vclock,
    version::Version,
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, Read, Write},
    path::Path,
};

/// Segment header.
///
/// Written once when the segment is created; everything after it is a
/// sequence of framed rows, optionally terminated by the EOF marker.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentMeta {
    /// Identity of the producing instance
    pub instance_uuid: InstanceUuid,

    /// Clock at which the segment starts
    pub vclock: Vclock,

    /// Clock at which the preceding segment ended
    ///
    /// Unset for the first segment of a directory and for legacy files.
    pub prev_vclock: Option<Vclock>,
}

impl SegmentMeta {
    /// Reads the header of a segment file, without touching its rows.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or the header is malformed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::from_reader(&mut reader)
    }

    /// Reads the header from the start of a reader.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or the header is malformed.
    pub fn from_reader<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header)?;

        match Version::parse_file_header(&header) {
            Some(Version::V1) => {}
            None => return Err(crate::Error::InvalidVersion(None)),
        }

        Ok(Self::decode_from(reader)?)
    }

    /// Writes the version header followed by the segment header.
    pub(crate) fn write_into<W: Write>(&self, writer: &mut W) -> crate::Result<()> {
        Version::V1.write_file_header(writer)?;
        self.encode_into(writer)?;
        Ok(())
    }
}

impl Encode for SegmentMeta {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.instance_uuid.encode_into(writer)?;
        self.vclock.encode_into(writer)?;

        match &self.prev_vclock {
            Some(prev) => {
                writer.write_u8(1)?;
                prev.encode_into(writer)?;
            }
            None => writer.write_u8(0)?,
        }

        Ok(())
    }
}

impl Decode for SegmentMeta {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let instance_uuid = InstanceUuid::decode_from(reader)?;
        let vclock = Vclock::decode_from(reader)?;

        let prev_vclock = match reader.read_u8()? {
            0 => None,
            1 => Some(Vclock::decode_from(reader)?),
            tag => return Err(DecodeError::InvalidTag(("PrevVclock", tag))),
        };

        Ok(Self {
            instance_uuid,
            vclock,
            prev_vclock,
        })
    }
}
