// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::row::Row;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Result of comparing two vector clocks.
///
/// Two clocks are comparable only if one is less than or equal to the
/// other component-wise; otherwise they are [`VclockCmp::Incomparable`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VclockCmp {
    /// Both clocks carry the same components
    Equal,

    /// Every component of `self` is <= the other clock's
    Less,

    /// Every component of the other clock is <= `self`'s
    Greater,

    /// The clocks diverge and have no defined order
    Incomparable,
}

/// Vector clock: a mapping from replica id to the last seen LSN.
///
/// Gives a partial order on replicated events. Components with an LSN of
/// zero are equivalent to absent components, so `{1: 0}` compares equal
/// to the empty clock.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Vclock(BTreeMap<u32, i64>);

impl Vclock {
    /// Creates an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock from `(replica_id, lsn)` components.
    #[must_use]
    pub fn from_components<I: IntoIterator<Item = (u32, i64)>>(components: I) -> Self {
        let mut clock = Self::new();
        for (replica_id, lsn) in components {
            if lsn != 0 {
                clock.0.insert(replica_id, lsn);
            }
        }
        clock
    }

    /// Returns the LSN tracked for a replica, 0 if the component is absent.
    #[must_use]
    pub fn get(&self, replica_id: u32) -> i64 {
        self.0.get(&replica_id).copied().unwrap_or_default()
    }

    /// Returns the sum of all components.
    ///
    /// The signature is the sort key of the log directory: every valid
    /// segment has a distinct starting clock, hence a distinct signature.
    #[must_use]
    pub fn signature(&self) -> i64 {
        self.0.values().sum()
    }

    /// Returns `true` if no component is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Advances a single component.
    ///
    /// The clock never retreats: following an LSN at or below the tracked
    /// one is a caller bug.
    pub fn follow(&mut self, replica_id: u32, lsn: i64) {
        debug_assert!(
            lsn > self.get(replica_id),
            "vclock component {replica_id} may not retreat",
        );
        self.0.insert(replica_id, lsn);
    }

    /// Advances the clock past the given row.
    pub fn follow_row(&mut self, row: &Row) {
        self.follow(row.replica_id, row.lsn);
    }

    /// Joins another clock in: every component becomes the maximum of
    /// the two.
    pub fn merge(&mut self, other: &Self) {
        for (replica_id, lsn) in other.components() {
            if lsn > self.get(replica_id) {
                self.0.insert(replica_id, lsn);
            }
        }
    }

    /// Compares two clocks component-wise.
    #[must_use]
    pub fn compare(&self, other: &Self) -> VclockCmp {
        let mut le = true;
        let mut ge = true;

        for &replica_id in self.0.keys().chain(other.0.keys()) {
            let lhs = self.get(replica_id);
            let rhs = other.get(replica_id);

            if lhs < rhs {
                ge = false;
            }
            if lhs > rhs {
                le = false;
            }
        }

        match (le, ge) {
            (true, true) => VclockCmp::Equal,
            (true, false) => VclockCmp::Less,
            (false, true) => VclockCmp::Greater,
            (false, false) => VclockCmp::Incomparable,
        }
    }

    /// Returns an iterator over `(replica_id, lsn)` components.
    pub fn components(&self) -> impl Iterator<Item = (u32, i64)> + '_ {
        self.0.iter().map(|(&replica_id, &lsn)| (replica_id, lsn))
    }
}

impl std::fmt::Display for Vclock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (idx, (replica_id, lsn)) in self.components().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{replica_id}: {lsn}")?;
        }
        write!(f, "}}")
    }
}

impl Encode for Vclock {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Truncation is okay, a clock never holds u32::MAX replicas
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.0.len() as u32)?;

        for (replica_id, lsn) in self.components() {
            writer.write_u32::<BigEndian>(replica_id)?;
            writer.write_i64::<BigEndian>(lsn)?;
        }

        Ok(())
    }
}

impl Decode for Vclock {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let cnt = reader.read_u32::<BigEndian>()?;

        let mut clock = Self::new();
        for _ in 0..cnt {
            let replica_id = reader.read_u32::<BigEndian>()?;
            let lsn = reader.read_i64::<BigEndian>()?;
            if lsn != 0 {
                clock.0.insert(replica_id, lsn);
            }
        }

        Ok(clock)
    }
}
