// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Recovery core of a replicated in-memory database.
//!
//! Two subsystems share this crate:
//!
//! - The **write-ahead-log recovery engine** restores state from a
//!   directory of append-only log segments and can keep *following* the
//!   directory as a hot standby while a primary appends to it. Replay is
//!   deterministic (LSN order per replica, file order within a segment,
//!   signature order across segments), idempotent, detects gaps in the
//!   segment chain and tolerates a truncated trailing segment.
//! - The **native stored-procedure loader** dlopens user-supplied shared
//!   libraries through a shadow copy (so a reload produces a fresh OS
//!   handle), caches them by package name, binds symbols that survive
//!   hot reload, and pins a module for the dynamic extent of every call.
//!
//! # Example
//!
//! ```no_run
//! use wal_relay::{Config, InstanceUuid, MockStream, Recovery, Vclock};
//!
//! # fn main() -> wal_relay::Result<()> {
//! let config = Config::new(InstanceUuid::from_bytes(*b"0123456789abcdef"));
//! let mut recovery = Recovery::new("wal", config, Vclock::new())?;
//!
//! let mut stream = MockStream::default();
//! recovery.recover_remaining(&mut stream, None, true)?;
//! recovery.finalize()?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]

mod coding;
mod config;
mod dir;
mod error;
mod mock;
mod recovery;
mod row;
mod segment;
mod stream;
mod uuid;
mod vclock;
mod version;
mod watcher;

pub mod proc;

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, xxhash_rust::xxh3::Xxh3Builder>;

pub use {
    config::Config,
    dir::SegmentDirectory,
    error::{Error, Result},
    proc::{
        cache::{Module, ModuleCache},
        func::{
            Credentials, Func, FuncBackend, FuncDef, NativeBackend, Session, UserDirectory,
            FUNC_CALL_ACCESS, PRIV_EXECUTE, PRIV_USAGE,
        },
        loader::{DsoLoader, ModuleHandle, ModuleLoader, ProcRawFn, ProcSymbol, DSO_SUFFIX},
        port::{Port, ProcContext, Region},
        registry::{FuncHandle, FuncRegistry},
        symbol::{FuncName, SymbolBinding},
    },
    recovery::{FollowHandle, OnCloseLog, Recovery},
    row::{Row, GROUP_DEFAULT, GROUP_LOCAL},
    segment::{
        meta::SegmentMeta, reader::ReadOutcome, reader::SegmentReader, segment_file_name,
        writer::SegmentWriter, Segment, SEGMENT_FILE_SUFFIX,
    },
    stream::RowStream,
    uuid::InstanceUuid,
    vclock::{Vclock, VclockCmp},
    version::Version,
    watcher::{DirWatcher, EventSet, WaitOutcome, WatcherWaker},
};

#[doc(hidden)]
pub use mock::{MockHandle, MockLoader, MockStream};
