// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::uuid::InstanceUuid;
use std::time::Duration;

/// Recovery configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Identity of the instance whose segments are recovered
    pub(crate) instance_uuid: InstanceUuid,

    /// Downgrade gap and corruption errors to warnings
    pub(crate) permissive: bool,

    /// How long the hot-standby loop sleeps before rescanning the
    /// directory when no FS event arrives
    pub(crate) rescan_delay: Duration,
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// Segments whose header carries a different instance UUID are treated
    /// as directory noise and skipped.
    #[must_use]
    pub fn new(instance_uuid: InstanceUuid) -> Self {
        Self {
            instance_uuid,
            permissive: false,
            rescan_delay: Duration::from_secs(2),
        }
    }

    /// Sets permissive mode.
    ///
    /// In permissive mode, log gaps, corrupt rows and sink write failures
    /// are logged and skipped instead of aborting recovery. The
    /// final-position check of a bounded recovery stays fatal.
    ///
    /// Default = false
    #[must_use]
    pub fn permissive(mut self, permissive: bool) -> Self {
        self.permissive = permissive;
        self
    }

    /// Sets the hot-standby rescan delay.
    ///
    /// A timed-out wait triggers a directory rescan, so this bounds how
    /// stale a standby can get when FS events are lost.
    ///
    /// Default = 2 s
    #[must_use]
    pub fn rescan_delay(mut self, delay: Duration) -> Self {
        self.rescan_delay = delay;
        self
    }
}
