// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::error::Error;

/// Byte sink a stored procedure pushes its results through.
///
/// Results are self-describing packed bytes; the port does not interpret
/// them.
#[derive(Debug, Default)]
pub struct Port {
    data: Vec<u8>,
}

impl Port {
    /// Creates an empty port.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends result bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Returns the accumulated results.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the accumulated length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Discards the accumulated results.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Execution context handed to a stored procedure.
///
/// Carries the return port and the call's diagnostic slot. A procedure
/// that fails should set a diagnostic; if it returns non-zero without
/// one, the dispatcher synthesizes a generic failure.
pub struct ProcContext<'a> {
    port: &'a mut Port,
    diag: Option<Error>,
}

impl<'a> ProcContext<'a> {
    /// Creates a context writing into the given port.
    #[must_use]
    pub fn new(port: &'a mut Port) -> Self {
        Self { port, diag: None }
    }

    /// Returns the return port.
    pub fn port(&mut self) -> &mut Port {
        self.port
    }

    /// Sets the call diagnostic. An earlier diagnostic is kept — the
    /// first error wins.
    pub fn set_error(&mut self, error: Error) {
        if self.diag.is_none() {
            self.diag = Some(error);
        }
    }

    /// Takes the call diagnostic.
    pub fn take_error(&mut self) -> Option<Error> {
        self.diag.take()
    }
}

/// Per-call scratch region, the bump-allocator analog on the executing
/// task.
///
/// Callers take a savepoint, stage call arguments, and truncate back on
/// return regardless of outcome.
#[derive(Debug, Default)]
pub struct Region {
    buf: Vec<u8>,
}

impl Region {
    /// Creates an empty region.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current fill, used as a savepoint.
    #[must_use]
    pub fn used(&self) -> usize {
        self.buf.len()
    }

    /// Stages bytes and returns their range within the region.
    pub fn append(&mut self, bytes: &[u8]) -> std::ops::Range<usize> {
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);
        start..self.buf.len()
    }

    /// Returns a staged range.
    #[must_use]
    pub fn slice(&self, range: std::ops::Range<usize>) -> &[u8] {
        self.buf.get(range).unwrap_or_default()
    }

    /// Rolls the region back to a savepoint.
    pub fn truncate(&mut self, savepoint: usize) {
        self.buf.truncate(savepoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn port_accumulates() {
        let mut port = Port::new();
        assert!(port.is_empty());

        port.write_bytes(b"abc");
        port.write_bytes(b"def");
        assert_eq!(b"abcdef", port.as_bytes());
        assert_eq!(6, port.len());

        port.clear();
        assert!(port.is_empty());
    }

    #[test]
    fn context_keeps_first_error() {
        let mut port = Port::new();
        let mut ctx = ProcContext::new(&mut port);

        ctx.set_error(Error::Proc("first".into()));
        ctx.set_error(Error::Proc("second".into()));

        assert!(matches!(ctx.take_error(), Some(Error::Proc(msg)) if msg == "first"));
        assert!(ctx.take_error().is_none());
    }

    #[test]
    fn region_truncates_to_savepoint() {
        let mut region = Region::new();
        let savepoint = region.used();

        let range = region.append(b"arguments");
        assert_eq!(b"arguments", region.slice(range));

        region.truncate(savepoint);
        assert_eq!(0, region.used());
    }
}
