// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    version::Version,
};

/// Represents errors that can occur in the relay
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// FS watcher error
    Watch(notify::Error),

    /// Invalid data format version
    InvalidVersion(Option<Version>),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Log data failed checksum or structural validation
    Corruption(String),

    /// Discontinuity between consecutive log segments
    XlogGap {
        /// Clock the recovery had reached
        from: String,

        /// Clock the next segment (or stop position) expected
        to: String,
    },

    /// Invalid arguments from the caller
    IllegalParams(String),

    /// Shared library could not be found or loaded
    LoadModule {
        /// Package name of the module
        package: String,

        /// Loader diagnostic
        reason: String,
    },

    /// Symbol could not be resolved within a loaded module
    LoadFunction {
        /// Symbol name
        name: String,

        /// Loader diagnostic
        reason: String,
    },

    /// Module is not present in the cache
    NoSuchModule(String),

    /// Function is not present in the registry
    NoSuchFunction(String),

    /// Effective user lacks the required privileges
    AccessDenied {
        /// Privilege that was missing
        access: &'static str,

        /// Object the access was checked against
        object: String,

        /// Effective user id
        user: u32,
    },

    /// Stored procedure returned failure
    Proc(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WalRelayError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Watch(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<notify::Error> for Error {
    fn from(value: notify::Error) -> Self {
        Self::Watch(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Relay result
pub type Result<T> = std::result::Result<T, Error>;
