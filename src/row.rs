// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Replication group of globally visible rows.
pub const GROUP_DEFAULT: u8 = 0;

/// Replication group of instance-local rows.
///
/// Local rows are signed with replica id 0 and are never replicated.
pub const GROUP_LOCAL: u8 = 1;

/// A single replicated log row.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// Id of the replica that authored the row (0 for local rows)
    pub replica_id: u32,

    /// Log sequence number, monotonically increasing per replica
    pub lsn: i64,

    /// Replication group of the row
    pub group_id: u8,

    /// Wall clock time the row was written at, in seconds
    pub timestamp: f64,

    /// Opaque request body
    pub body: Vec<u8>,
}

impl Row {
    /// Creates a globally replicated row.
    #[must_use]
    pub fn new(replica_id: u32, lsn: i64, body: Vec<u8>) -> Self {
        Self {
            replica_id,
            lsn,
            group_id: GROUP_DEFAULT,
            timestamp: 0.0,
            body,
        }
    }

    /// Creates an instance-local row.
    #[must_use]
    pub fn local(lsn: i64, body: Vec<u8>) -> Self {
        Self {
            replica_id: 0,
            lsn,
            group_id: GROUP_LOCAL,
            timestamp: 0.0,
            body,
        }
    }

    /// Sets the row timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl Encode for Row {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.replica_id)?;
        writer.write_i64::<BigEndian>(self.lsn)?;
        writer.write_u8(self.group_id)?;
        writer.write_f64::<BigEndian>(self.timestamp)?;

        // NOTE: Truncation is okay, bodies are bounded by the frame size cap
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.body.len() as u32)?;
        writer.write_all(&self.body)?;

        Ok(())
    }
}

impl Decode for Row {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let replica_id = reader.read_u32::<BigEndian>()?;
        let lsn = reader.read_i64::<BigEndian>()?;
        let group_id = reader.read_u8()?;

        if group_id > GROUP_LOCAL {
            return Err(DecodeError::InvalidTag(("GroupId", group_id)));
        }

        let timestamp = reader.read_f64::<BigEndian>()?;

        let body_len = reader.read_u32::<BigEndian>()?;
        let mut body = vec![0u8; body_len as usize];
        reader.read_exact(&mut body)?;

        Ok(Self {
            replica_id,
            lsn,
            group_id,
            timestamp,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    #[allow(clippy::expect_used)]
    fn row_round_trip() {
        let row = Row::new(3, 77, b"request".to_vec()).with_timestamp(1.5);

        let bytes = row.encode_into_vec().expect("should encode");
        let mut cursor = std::io::Cursor::new(bytes);
        let copy = Row::decode_from(&mut cursor).expect("should decode");

        assert_eq!(row, copy);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn row_invalid_group_tag() {
        let mut bytes = Row::new(1, 1, vec![]).encode_into_vec().expect("encode");
        *bytes.get_mut(12).expect("group tag offset") = 42;

        let mut cursor = std::io::Cursor::new(bytes);
        assert!(matches!(
            Row::decode_from(&mut cursor),
            Err(DecodeError::InvalidTag(("GroupId", 42)))
        ));
    }

    #[test]
    fn local_rows_use_zero_replica() {
        let row = Row::local(5, vec![1, 2, 3]);
        assert_eq!(0, row.replica_id);
        assert_eq!(GROUP_LOCAL, row.group_id);
    }
}
