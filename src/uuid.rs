// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};

/// Identity of the database instance that produced a log directory.
///
/// Segments carrying a foreign instance UUID are treated as directory noise
/// and skipped during scan.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct InstanceUuid([u8; 16]);

impl InstanceUuid {
    /// Creates an instance UUID from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for InstanceUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, byte) in self.0.iter().enumerate() {
            if matches!(idx, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Encode for InstanceUuid {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&self.0)?;
        Ok(())
    }
}

impl Decode for InstanceUuid {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut bytes = [0u8; 16];
        reader.read_exact(&mut bytes)?;
        Ok(Self(bytes))
    }
}
