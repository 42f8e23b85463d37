// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::row::Row;

/// Sink that recovered rows are replayed into.
///
/// Implemented by the consumers of recovery: the local state machine
/// applier, or a replication relay forwarding rows to a downstream
/// replica. Emission order is the recovery guarantee: strictly
/// LSN-ordered per replica, file order within a segment, signature order
/// across segments.
pub trait RowStream {
    /// Consumes one recovered row.
    ///
    /// The recovery clock has already been advanced past the row when
    /// this is called, so a failed write does not rewind replay.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the row cannot be applied; recovery treats
    /// this as fatal unless running permissively.
    fn write(&mut self, row: &Row) -> crate::Result<()>;
}
