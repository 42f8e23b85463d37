// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::{
    path::{Path, PathBuf},
    sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
    time::Duration,
};

/// Set of wakeup reasons accumulated by a [`DirWatcher`].
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct EventSet(u8);

impl EventSet {
    /// The directory changed: a segment was created, renamed or removed.
    pub const ROTATE: Self = Self(1 << 0);

    /// The followed tail segment grew or was otherwise modified.
    pub const WRITE: Self = Self(1 << 1);

    /// Returns `true` if no flag is set.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every flag of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Adds the flags of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for EventSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for EventSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.contains(Self::ROTATE), self.contains(Self::WRITE)) {
            (true, true) => write!(f, "ROTATE|WRITE"),
            (true, false) => write!(f, "ROTATE"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "(empty)"),
        }
    }
}

/// Outcome of parking on a [`DirWatcher`].
#[derive(Debug)]
pub enum WaitOutcome {
    /// Woken by FS activity; the accumulated flags, now cleared.
    Events(EventSet),

    /// The timeout elapsed without FS activity.
    TimedOut,

    /// A [`WatcherWaker`] cancelled the wait.
    Cancelled,
}

enum WatchMessage {
    Fs(notify::Result<Event>),
    Cancel,
}

/// Wakes a parked [`DirWatcher`] from another thread.
#[derive(Clone)]
pub struct WatcherWaker(Sender<WatchMessage>);

impl WatcherWaker {
    /// Cancels the current (or next) wait.
    pub fn cancel(&self) {
        // A dead receiver means the watcher is already gone
        let _ = self.0.send(WatchMessage::Cancel);
    }
}

/// Subscription to changes of a log directory and its tail segment.
///
/// A directory-level change raises [`EventSet::ROTATE`]; a change of the
/// followed file raises [`EventSet::WRITE`]. Spurious flags are permitted
/// — the consumer rescans and finds nothing new.
pub struct DirWatcher {
    // Held for its Drop: dropping deregisters the OS watch
    _watcher: RecommendedWatcher,
    rx: Receiver<WatchMessage>,
    tx: Sender<WatchMessage>,
    file_path: Option<PathBuf>,
    pending: EventSet,
}

impl DirWatcher {
    /// Installs a (non-recursive) watch on a log directory.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the OS watch cannot be installed.
    pub fn subscribe<P: AsRef<Path>>(dir: P) -> crate::Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel();

        let fs_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |event| {
            // A dead receiver means the subscription was dropped
            let _ = fs_tx.send(WatchMessage::Fs(event));
        })?;

        watcher.watch(dir.as_ref(), RecursiveMode::NonRecursive)?;

        Ok(Self {
            _watcher: watcher,
            rx,
            tx,
            file_path: None,
            pending: EventSet::default(),
        })
    }

    /// Returns a handle that can cancel a pending wait.
    #[must_use]
    pub fn waker(&self) -> WatcherWaker {
        WatcherWaker(self.tx.clone())
    }

    /// Replaces the followed tail file. No-op if the path is unchanged.
    ///
    /// The directory watch already covers the file; this only affects
    /// event classification.
    pub fn set_file(&mut self, path: Option<PathBuf>) {
        if self.file_path != path {
            log::trace!("watching tail file {path:?}");
            self.file_path = path;
        }
    }

    /// Drains delivered events and returns the accumulated flags without
    /// clearing them.
    pub fn poll_pending(&mut self) -> EventSet {
        loop {
            match self.rx.try_recv() {
                Ok(WatchMessage::Fs(event)) => self.note(event),
                // Cancellation outside wait is picked up by the caller's
                // own cancellation check
                Ok(WatchMessage::Cancel) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => break,
            }
        }
        self.pending
    }

    /// Drains delivered events, clears and returns the accumulated flags.
    pub fn take_pending(&mut self) -> EventSet {
        let events = self.poll_pending();
        self.pending = EventSet::default();
        events
    }

    /// Parks until FS activity, cancellation or the timeout.
    ///
    /// On [`WaitOutcome::Events`] the flag set is returned and cleared
    /// atomically with respect to this watcher.
    pub fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        self.poll_pending();

        if self.pending.is_empty() {
            match self.rx.recv_timeout(timeout) {
                Ok(WatchMessage::Fs(event)) => self.note(event),
                Ok(WatchMessage::Cancel) => return WaitOutcome::Cancelled,
                Err(RecvTimeoutError::Timeout) => return WaitOutcome::TimedOut,
                Err(RecvTimeoutError::Disconnected) => return WaitOutcome::Cancelled,
            }

            // Pick up anything that arrived in the same burst
            self.poll_pending();
        }

        WaitOutcome::Events(std::mem::take(&mut self.pending))
    }

    fn note(&mut self, event: notify::Result<Event>) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                // Treat a lossy backend as "anything may have changed"
                log::warn!("watch error, forcing rescan: {e:?}");
                self.pending.insert(EventSet::ROTATE);
                return;
            }
        };

        if event.paths.is_empty() {
            self.pending.insert(EventSet::ROTATE);
            return;
        }

        for path in &event.paths {
            let on_tail = self.file_path.as_deref() == Some(path.as_path());

            let flag = match event.kind {
                EventKind::Modify(_) | EventKind::Access(_) | EventKind::Any if on_tail => {
                    EventSet::WRITE
                }
                _ => EventSet::ROTATE,
            };

            self.pending.insert(flag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn event_set_ops() {
        let mut set = EventSet::default();
        assert!(set.is_empty());

        set.insert(EventSet::ROTATE);
        assert!(set.contains(EventSet::ROTATE));
        assert!(!set.contains(EventSet::WRITE));

        let both = set | EventSet::WRITE;
        assert!(both.contains(EventSet::ROTATE | EventSet::WRITE));
        assert_eq!("ROTATE|WRITE", format!("{both:?}"));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn cancel_wakes_wait() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let mut watcher = DirWatcher::subscribe(folder.path())?;

        let waker = watcher.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.cancel();
        });

        let outcome = watcher.wait(Duration::from_secs(30));
        assert!(matches!(outcome, WaitOutcome::Cancelled));

        handle.join().expect("waker thread should not panic");
        Ok(())
    }

    #[test]
    fn wait_times_out_without_activity() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let mut watcher = DirWatcher::subscribe(folder.path())?;

        let outcome = watcher.wait(Duration::from_millis(50));
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        Ok(())
    }
}
