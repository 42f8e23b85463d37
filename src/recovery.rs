// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    config::Config,
    dir::SegmentDirectory,
    row::GROUP_LOCAL,
    segment::{
        reader::{ReadOutcome, SegmentReader},
        Segment,
    },
    stream::RowStream,
    vclock::{Vclock, VclockCmp},
    watcher::{DirWatcher, EventSet, WaitOutcome},
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

/// Callback run whenever the driver closes a segment cursor.
///
/// Consumers use this to checkpoint replay progress at segment
/// boundaries.
pub type OnCloseLog = Box<dyn FnMut() -> crate::Result<()> + Send>;

/// Position retained after a cursor leaves the OPEN state.
#[derive(Clone, Debug)]
struct CursorMeta {
    /// Starting clock of the segment the cursor was on
    start: Vclock,

    /// Clock advanced past every row the cursor read
    end: Vclock,

    /// Segment file path, for diagnostics
    path: PathBuf,
}

/// Cursor state machine: NEW -> OPEN -> EOF -> CLOSED, with OPEN -> CLOSED
/// on a file that was abandoned before its EOF marker.
enum Cursor {
    New,
    Open(SegmentReader),
    Eof(CursorMeta),
    Closed(CursorMeta),
}

impl Cursor {
    fn snapshot(reader: &SegmentReader) -> CursorMeta {
        CursorMeta {
            start: reader.meta().vclock.clone(),
            end: reader.end_vclock().clone(),
            path: reader.path().to_path_buf(),
        }
    }

    /// Position of the last segment this cursor touched, `None` while NEW.
    fn last_position(&self) -> Option<CursorMeta> {
        match self {
            Self::New => None,
            Self::Open(reader) => Some(Self::snapshot(reader)),
            Self::Eof(meta) | Self::Closed(meta) => Some(meta.clone()),
        }
    }
}

/// Restores database state from a directory of append-only log segments
/// and optionally keeps following the directory as a hot standby.
///
/// The recovery clock advances monotonically and never retreats; replay
/// is idempotent with respect to rows at or below the clock.
pub struct Recovery {
    dir: SegmentDirectory,
    cursor: Cursor,
    vclock: Vclock,
    permissive: bool,
    config: Config,
    on_close_log: Vec<OnCloseLog>,
}

impl Recovery {
    /// Creates a recovery over a log directory, starting at the given
    /// clock (the position of the last snapshot, or empty).
    ///
    /// # Errors
    ///
    /// Will return `Err` if the directory is not readable.
    pub fn new<P: AsRef<Path>>(path: P, config: Config, vclock: Vclock) -> crate::Result<Self> {
        let dir = SegmentDirectory::open(path, config.instance_uuid, config.permissive)?;

        Ok(Self {
            dir,
            cursor: Cursor::New,
            vclock,
            permissive: config.permissive,
            config,
            on_close_log: Vec::new(),
        })
    }

    /// Returns the current recovery clock.
    #[must_use]
    pub fn vclock(&self) -> &Vclock {
        &self.vclock
    }

    /// Returns the directory index.
    #[must_use]
    pub fn dir(&self) -> &SegmentDirectory {
        &self.dir
    }

    /// Returns `true` while a segment cursor is open (the tail segment
    /// exists but its EOF marker has not been read).
    #[must_use]
    pub fn cursor_is_open(&self) -> bool {
        matches!(self.cursor, Cursor::Open(_))
    }

    /// Returns the path of the open tail segment, if any.
    #[must_use]
    pub fn open_segment_path(&self) -> Option<PathBuf> {
        match &self.cursor {
            Cursor::Open(reader) => Some(reader.path().to_path_buf()),
            _ => None,
        }
    }

    /// Registers a callback run whenever a segment cursor is closed.
    pub fn on_close_log(&mut self, trigger: OnCloseLog) {
        self.on_close_log.push(trigger);
    }

    /// Surveys the directory before recovery.
    ///
    /// Returns `(end_vclock, gc_vclock)`: the clock at the very end of
    /// the directory (scanning the rows of the last segment, which may
    /// still be unsealed) and the starting clock of the oldest segment
    /// (the garbage-collection floor). When the directory holds nothing
    /// past the current clock, both equal the current clock.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs. In strict mode an
    /// unreadable last segment is an error; permissive mode settles for
    /// its starting clock.
    pub fn scan(&mut self) -> crate::Result<(Vclock, Vclock)> {
        self.dir.scan()?;

        let Some(last) = self.dir.last_vclock() else {
            return Ok((self.vclock.clone(), self.vclock.clone()));
        };

        if last.compare(&self.vclock) == VclockCmp::Less {
            // No segments past the snapshot position
            return Ok((self.vclock.clone(), self.vclock.clone()));
        }

        let gc_vclock = self.dir.first_vclock().unwrap_or_else(|| last.clone());

        // Scan the last segment to find the true end clock; it may be an
        // unsealed tail, so read permissively
        let signature = last.signature();
        let Some(segment) = self.dir.get(signature) else {
            return Ok((last, gc_vclock));
        };

        let mut reader = match SegmentReader::open(&segment.path, signature, true) {
            Ok(reader) => reader,
            Err(e) if self.permissive => {
                log::warn!("cannot scan tail segment {:?}: {e:?}", segment.path);
                return Ok((last, gc_vclock));
            }
            Err(e) => return Err(e),
        };

        loop {
            match reader.next_row() {
                Ok(ReadOutcome::Row(_)) => {}
                Ok(ReadOutcome::Pending | ReadOutcome::Eof) => break,
                Err(e) => {
                    log::warn!("tail segment scan stopped early: {e:?}");
                    break;
                }
            }
        }

        Ok((reader.end_vclock().clone(), gc_vclock))
    }

    /// Replays everything the directory holds past the current clock.
    ///
    /// Resumes from an open cursor if there is one, otherwise starts at
    /// the last segment whose starting clock does not exceed the
    /// recovery clock. With `stop_vclock` given, replay halts at that
    /// position and failing to reach it exactly is a gap error — even in
    /// permissive mode. With `rescan`, the directory is re-scanned first.
    ///
    /// Does not close an open tail cursor: a truncated trailing segment
    /// stays open for the watcher to retry.
    ///
    /// # Errors
    ///
    /// Will return `Err` on gap or corruption in strict mode, on sink
    /// write failure in strict mode, and on IO errors.
    pub fn recover_remaining(
        &mut self,
        stream: &mut dyn RowStream,
        stop_vclock: Option<&Vclock>,
        rescan: bool,
    ) -> crate::Result<()> {
        if rescan {
            self.dir.scan()?;
        }

        let mut resume_signature = None;

        let open_position = match &self.cursor {
            Cursor::Open(reader) => Some((reader.signature(), reader.path().to_path_buf())),
            _ => None,
        };

        if let Some((signature, path)) = open_position {
            if self.dir.get(signature).is_some() {
                // A segment is already open, drain it first
                self.recover_current(stream, stop_vclock)?;
                resume_signature = Some(signature);
            } else {
                // Assume anything can happen in production and go on
                log::error!("file {path:?} was deleted under our feet");
            }
        }

        let mut next = match resume_signature {
            Some(signature) => self.dir.next_after(signature),
            None => self.dir.match_vclock(&self.vclock),
        };

        while let Some(segment) = next {
            if let Some(stop) = stop_vclock {
                if segment.signature >= stop.signature() {
                    break;
                }
            }

            let already_consumed = matches!(
                &self.cursor,
                Cursor::Eof(meta) if meta.start.signature() >= segment.signature
            );

            if !already_consumed {
                self.open_log(&segment)?;
                log::info!("recover from {:?}", segment.path);
                self.recover_current(stream, stop_vclock)?;
            }

            next = self.dir.next_after(segment.signature);
        }

        if matches!(self.cursor, Cursor::Eof(_)) {
            self.close_log()?;
        }

        if let Some(stop) = stop_vclock {
            if self.vclock.compare(stop) != VclockCmp::Equal {
                return Err(crate::Error::XlogGap {
                    from: self.vclock.to_string(),
                    to: stop.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Closes the cursor outside follow mode.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an on-close trigger fails.
    pub fn finalize(&mut self) -> crate::Result<()> {
        self.close_log()
    }

    /// Reads rows from the open cursor until the segment is exhausted,
    /// EOF is latched, or the stop position is reached.
    fn recover_current(
        &mut self,
        stream: &mut dyn RowStream,
        stop_vclock: Option<&Vclock>,
    ) -> crate::Result<()> {
        let mut row_count: u64 = 0;

        loop {
            let outcome = match &mut self.cursor {
                Cursor::Open(reader) => reader.next_row()?,
                _ => return Ok(()),
            };

            match outcome {
                ReadOutcome::Pending => return Ok(()),
                ReadOutcome::Eof => {
                    self.cursor = match std::mem::replace(&mut self.cursor, Cursor::New) {
                        Cursor::Open(reader) => Cursor::Eof(Cursor::snapshot(&reader)),
                        other => other,
                    };
                    return Ok(());
                }
                ReadOutcome::Row(row) => {
                    if let Some(stop) = stop_vclock {
                        if self.vclock.signature() >= stop.signature() {
                            return Ok(());
                        }
                    }

                    if row.lsn <= self.vclock.get(row.replica_id) {
                        // Already applied, skip
                        continue;
                    }

                    debug_assert!(
                        row.replica_id != 0 || row.group_id == GROUP_LOCAL,
                        "only local rows may carry replica id 0",
                    );

                    // Promote the clock before emission, so that a row
                    // skipped permissively still advances it
                    self.vclock.follow_row(&row);

                    match stream.write(&row) {
                        Ok(()) => {
                            row_count += 1;
                            if row_count % 100_000 == 0 {
                                #[allow(clippy::cast_precision_loss)]
                                log::info!("{:.1}M rows processed", row_count as f64 / 1_000_000.0);
                            }
                        }
                        Err(e) if self.permissive => {
                            log::error!(
                                "skipping row {{{}: {}}}: {e:?}",
                                row.replica_id,
                                row.lsn,
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Closes the current cursor and opens the given segment, running the
    /// gap checks.
    ///
    /// The recovery clock is promoted to at least the segment's starting
    /// clock even when a gap is detected, so segments created later keep
    /// the file-order invariant.
    fn open_log(&mut self, segment: &Segment) -> crate::Result<()> {
        let prev = self.cursor.last_position();

        self.close_log()?;

        let reader = segment.open(self.permissive)?;
        let segment_vclock = reader.meta().vclock.clone();
        let prev_vclock_header = reader.meta().prev_vclock.clone();
        self.cursor = Cursor::Open(reader);

        let gap = match &prev {
            // This is the first segment we are about to scan and the best
            // clock we could find starts past the recovery position
            None => matches!(
                segment_vclock.compare(&self.vclock),
                VclockCmp::Greater | VclockCmp::Incomparable
            ),

            // Segments are missing between the last scanned one and this
            // one
            Some(prev) => match &prev_vclock_header {
                Some(header) => header.compare(&prev.end) != VclockCmp::Equal,
                None => false,
            },
        };

        let mut rc = Ok(());

        if gap {
            if self.permissive {
                log::warn!(
                    "ignoring a gap in LSN between {} and {}",
                    self.vclock,
                    segment_vclock,
                );
            } else {
                rc = Err(crate::Error::XlogGap {
                    from: self.vclock.to_string(),
                    to: segment_vclock.to_string(),
                });
            }
        }

        if self.vclock.compare(&segment_vclock) == VclockCmp::Less {
            self.vclock = segment_vclock;
        }

        rc
    }

    /// Closes an open or EOF cursor and runs the on-close triggers.
    fn close_log(&mut self) -> crate::Result<()> {
        let meta = match std::mem::replace(&mut self.cursor, Cursor::New) {
            Cursor::Open(reader) => {
                let meta = Cursor::snapshot(&reader);
                log::warn!("file {:?} wasn't correctly closed", meta.path);
                meta
            }
            Cursor::Eof(meta) => {
                log::info!("done {:?}", meta.path);
                meta
            }
            keep @ (Cursor::New | Cursor::Closed(_)) => {
                self.cursor = keep;
                return Ok(());
            }
        };

        self.cursor = Cursor::Closed(meta);

        for trigger in &mut self.on_close_log {
            trigger()?;
        }

        Ok(())
    }

    /// Transitions into follow mode: replays the directory, then keeps
    /// draining it as the primary appends, on a background thread.
    ///
    /// The thread owns the recovery; [`FollowHandle::stop`] hands it
    /// back. Cancellation is only honored while the loop is parked on the
    /// watcher — never mid-replay, preserving clock monotonicity.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the watcher cannot be installed or the
    /// thread cannot be spawned.
    pub fn follow_local<S>(
        self,
        stream: S,
        name: &str,
        rescan_delay: Option<std::time::Duration>,
    ) -> crate::Result<FollowHandle<S>>
    where
        S: RowStream + Send + 'static,
    {
        let mut watcher = DirWatcher::subscribe(self.dir.path())?;
        let waker = watcher.waker();
        let cancel = Arc::new(AtomicBool::new(false));
        let delay = rescan_delay.unwrap_or(self.config.rescan_delay);

        let thread_cancel = cancel.clone();
        let join = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut recovery = self;
                let mut stream = stream;
                let result =
                    hot_standby(&mut recovery, &mut stream, &mut watcher, delay, &thread_cancel);
                if let Err(e) = &result {
                    log::error!("hot standby failed: {e:?}");
                }
                (recovery, stream, result)
            })?;

        Ok(FollowHandle {
            join,
            cancel,
            waker,
        })
    }
}

/// Handle to a running hot-standby follower.
pub struct FollowHandle<S: RowStream + Send + 'static> {
    join: JoinHandle<(Recovery, S, crate::Result<()>)>,
    cancel: Arc<AtomicBool>,
    waker: crate::watcher::WatcherWaker,
}

impl<S: RowStream + Send + 'static> FollowHandle<S> {
    /// Cancels the follower and joins it, returning the recovery and the
    /// sink.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the follower already failed; the recovery
    /// state is lost in that case (its clock is tainted by the failure).
    pub fn stop(self) -> crate::Result<(Recovery, S)> {
        self.cancel.store(true, Ordering::Release);
        self.waker.cancel();

        match self.join.join() {
            Ok((recovery, stream, result)) => result.map(|()| (recovery, stream)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// The follow loop: drain, re-arm the watcher, park, classify the wakeup.
fn hot_standby<S: RowStream>(
    recovery: &mut Recovery,
    stream: &mut S,
    watcher: &mut DirWatcher,
    rescan_delay: std::time::Duration,
    cancel: &AtomicBool,
) -> crate::Result<()> {
    let mut rescan = true;

    while !cancel.load(Ordering::Acquire) {
        // Recover until nothing new appeared in the directory while the
        // previous pass was running. Once a cursor stays open the tail
        // segment is mid-write: progress then blocks on the watcher, not
        // on rescanning, preventing a tight spin.
        loop {
            let start = recovery.vclock.signature();
            recovery.recover_remaining(stream, None, rescan)?;
            let end = recovery.vclock.signature();

            if !(end > start && !recovery.cursor_is_open()) {
                break;
            }
        }

        watcher.set_file(recovery.open_segment_path());

        let mut timed_out = false;
        let mut events = watcher.poll_pending();

        if events.is_empty() {
            match watcher.wait(rescan_delay) {
                WaitOutcome::Cancelled => break,
                WaitOutcome::TimedOut => timed_out = true,
                WaitOutcome::Events(set) => events = set,
            }
        } else {
            events = watcher.take_pending();
        }

        rescan = timed_out || events.contains(EventSet::ROTATE);
    }

    Ok(())
}
