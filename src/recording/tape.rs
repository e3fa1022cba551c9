// src/recording/tape.rs
//! Client-facing tape handle
//!
//! The handle owns the producer and consumer ends of the worker channels,
//! the worker isolate and the handle-side watchdog. It can be shared
//! between a producer thread calling [`TapeHandle::record`] and consumer
//! threads replaying chapters; control calls are serialized by a lock.
//!
//! Every blocking call takes a timeout and degrades to `None`/empty/false
//! when it expires. Calls fail with [`TapeError::Cancelled`] once the handle
//! is closing or the worker stopped answering heartbeats.

use crate::recording::compressor::Compressor;
use crate::recording::event_queue::{write_queue, QueueStats, QueueWriter};
use crate::recording::protocol::{
    Command, OpenRequest, Reply, Request, Response, StatsMap, WriteItem,
};
use crate::recording::record::CaptureRecord;
use crate::recording::watchdog::{heartbeat_link, CancelToken, Watchdog, WatchdogTiming};
use crate::recording::worker::{RecorderWorker, WorkerChannels, WorkerSettings};
use crate::runtime::isolate::{Isolate, IsolateExit};
use crate::utils::config::TapeConfig;
use crate::utils::errors::{Result, TapeError};
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State guarded by the control lock
#[derive(Default)]
struct CallState {
    seq: u64,
    /// Records delivered for a `Next` that had already given up
    stash: VecDeque<CaptureRecord>,
    /// Chapter and index of the last record handed to a caller
    delivered: Option<(String, u64)>,
}

impl CallState {
    fn take_stashed(&mut self, chapter: Option<&str>) -> Option<CaptureRecord> {
        let pos = self
            .stash
            .iter()
            .position(|r| chapter.map_or(true, |c| r.chapter.as_deref() == Some(c)))?;
        self.stash.remove(pos)
    }

    /// A stashed record was handed out ahead of the worker's read cursor;
    /// the worker serves it again once the cursor rewinds to that chapter
    fn is_replay(&self, record: &CaptureRecord) -> bool {
        match (&self.delivered, record.chapter.as_deref()) {
            (Some((chapter, index)), Some(c)) => chapter == c && record.index <= *index,
            _ => false,
        }
    }

    fn deliver(&mut self, record: CaptureRecord) -> Option<CaptureRecord> {
        self.delivered = record.chapter.clone().map(|c| (c, record.index));
        Some(record)
    }
}

/// Handle to a recording tape
pub struct TapeHandle {
    config: TapeConfig,
    control: Sender<Request>,
    replies: Receiver<Response>,
    writes: QueueWriter,
    calls: Mutex<CallState>,
    closing: AtomicBool,
    /// Dropped by `close` to interrupt a waiting call
    interrupt_tx: Mutex<Option<Sender<()>>>,
    interrupt: Receiver<()>,
    cancel: CancelToken,
    watchdog: Mutex<Option<Watchdog>>,
    isolate: Mutex<Option<Isolate>>,
}

impl TapeHandle {
    /// Start the worker and both watchdogs; the tape is not open yet
    pub fn spawn(config: &TapeConfig) -> Result<Self> {
        let handle = Self::start(config)?;
        {
            let mut state = handle.calls.lock();
            handle.send(&mut state, Command::Watchdog)?;
        }
        info!("Tape worker spawned");
        Ok(handle)
    }

    /// Start the worker and the handle-side watchdog only
    fn start(config: &TapeConfig) -> Result<Self> {
        let settings = &config.tape;

        let (control_tx, control_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        let (writer, reader) = write_queue(settings.queue_depth);
        let (handle_link, worker_link) = heartbeat_link();

        let worker_settings = WorkerSettings {
            idle_quantum: settings.idle_quantum(),
            compressor: Compressor::new(config.compression.level),
            watchdog: WatchdogTiming {
                interval: config.watchdog.interval(),
                patience: config.watchdog.worker_patience(),
            },
        };
        let channels = WorkerChannels {
            control: control_rx,
            replies: reply_tx,
            writes: reader,
            heartbeat: Some(worker_link),
        };

        let isolate = Isolate::spawn("tape-worker", move || {
            RecorderWorker::new(worker_settings, channels).run()
        })?;

        let watchdog = Watchdog::start(
            "handle",
            handle_link,
            WatchdogTiming {
                interval: config.watchdog.interval(),
                patience: config.watchdog.handle_patience(),
            },
        )?;

        let (interrupt_tx, interrupt) = bounded(1);

        Ok(Self {
            config: config.clone(),
            control: control_tx,
            replies: reply_rx,
            writes: writer,
            calls: Mutex::new(CallState::default()),
            closing: AtomicBool::new(false),
            interrupt_tx: Mutex::new(Some(interrupt_tx)),
            interrupt,
            cancel: watchdog.cancel_token(),
            watchdog: Mutex::new(Some(watchdog)),
            isolate: Mutex::new(Some(isolate)),
        })
    }

    /// Spawn the worker and open the tape described by `config.tape`
    ///
    /// On failure the worker is shut down again before the error is returned.
    pub fn load(config: &TapeConfig) -> Result<Self> {
        let handle = Self::spawn(config)?;
        if let Err(e) = handle.open(config.tape.open_request()) {
            handle.close();
            return Err(e);
        }
        Ok(handle)
    }

    /// Open the store; a second open on the same worker fails
    pub fn open(&self, request: OpenRequest) -> Result<()> {
        self.ensure_live()?;
        let mut state = self.calls.lock();
        let seq = self.send(&mut state, Command::Open(request))?;
        match self.await_reply(&mut state, seq, self.config.tape.reply_timeout(), true)? {
            Some(Reply::Status(Ok(()))) => Ok(()),
            Some(Reply::Status(Err(msg))) => Err(TapeError::SetupFailed(msg)),
            Some(other) => Err(TapeError::SetupFailed(format!(
                "unexpected reply to Open: {:?}",
                other
            ))),
            None => Err(TapeError::SetupFailed("worker did not answer Open".to_string())),
        }
    }

    /// Queue a side copy of `record`, or the end-of-stream marker for `None`
    pub fn record(&self, record: Option<&CaptureRecord>) -> Result<()> {
        self.ensure_live()?;
        let item = match record {
            Some(record) => {
                let copy = record.side_copy().map_err(|e| {
                    warn!("Dropping record: {}", e);
                    e
                })?;
                WriteItem::Record(Box::new(copy))
            }
            None => WriteItem::EndOfStream,
        };
        self.writes.push(item, self.config.tape.record_timeout())
    }

    /// Chapter names known to the store; empty on timeout
    pub fn chapters(&self, timeout: Duration) -> Result<Vec<String>> {
        self.ensure_live()?;
        let mut state = self.calls.lock();
        let seq = self.send(&mut state, Command::Chapters)?;
        match self.await_reply(&mut state, seq, timeout, true)? {
            Some(Reply::Chapters(chapters)) => Ok(chapters),
            _ => Ok(Vec::new()),
        }
    }

    /// Next chunk of `chapter`, in index order
    ///
    /// With `wait`, a chunk that is not written yet is awaited up to
    /// `timeout`. With `purge`, the chunk is dropped from a memory store
    /// once returned.
    pub fn play_next(
        &self,
        chapter: Option<&str>,
        wait: bool,
        timeout: Duration,
        purge: bool,
    ) -> Result<Option<CaptureRecord>> {
        self.ensure_live()?;
        let mut state = self.calls.lock();

        if let Some(record) = state.take_stashed(chapter) {
            return Ok(state.deliver(record));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let seq = self.send(
                &mut state,
                Command::Next {
                    chapter: chapter.map(str::to_string),
                    wait,
                    purge,
                },
            )?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut reply = self.await_reply(&mut state, seq, remaining, true)?;
            if matches!(reply, Some(Reply::Wait)) {
                if let Some(record) = state.take_stashed(chapter) {
                    return Ok(state.deliver(record));
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                reply = self.await_reply(&mut state, seq, remaining, true)?;
            }

            match reply {
                Some(Reply::Record(Some(record))) => {
                    if state.is_replay(&record) {
                        debug!(
                            "Chunk {} of {:?} already delivered, skipping",
                            record.index, record.chapter
                        );
                        if Instant::now() >= deadline {
                            return Ok(None);
                        }
                        continue;
                    }
                    // Records stashed while waiting came first
                    state.stash.push_back(*record);
                    return Ok(state.take_stashed(chapter).and_then(|r| state.deliver(r)));
                }
                Some(Reply::Record(None)) | Some(Reply::Wait) | None => {
                    return Ok(state.take_stashed(chapter).and_then(|r| state.deliver(r)));
                }
                Some(other) => {
                    warn!("Unexpected reply to Next: {:?}", other);
                    return Ok(None);
                }
            }
        }
    }

    /// Most recent chunk of the current write chapter
    pub fn play_last(&self, timeout: Duration) -> Result<Option<CaptureRecord>> {
        self.ensure_live()?;
        let mut state = self.calls.lock();
        let seq = self.send(&mut state, Command::Last)?;
        match self.await_reply(&mut state, seq, timeout, true)? {
            Some(Reply::Record(record)) => Ok(record.map(|r| *r)),
            _ => Ok(None),
        }
    }

    /// Per-chunk write stats of the current chapter, if enabled at open
    pub fn pull_stats(&self, timeout: Duration) -> Result<Option<StatsMap>> {
        self.ensure_live()?;
        let mut state = self.calls.lock();
        let seq = self.send(&mut state, Command::Stats)?;
        match self.await_reply(&mut state, seq, timeout, true)? {
            Some(Reply::Stats(stats)) => Ok(stats),
            _ => Ok(None),
        }
    }

    /// Poll until `chapter` (or any chapter, for `None`) exists
    pub fn wait2start(&self, chapter: Option<&str>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.chapters(remaining.min(self.config.tape.reply_timeout())) {
                Ok(chapters) => {
                    let found = match chapter {
                        Some(c) => chapters.iter().any(|name| name == c),
                        None => !chapters.is_empty(),
                    };
                    if found {
                        return true;
                    }
                }
                Err(_) => return false,
            }
            thread::sleep(POLL_INTERVAL);
        }
        false
    }

    /// Poll until the write queue has drained
    pub fn wait2finish(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.writes.is_empty() {
                return true;
            }
            if !self.is_processing() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Worker alive and the handle not closing
    pub fn is_processing(&self) -> bool {
        self.ensure_live().is_ok()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.writes.stats()
    }

    /// Stop the worker and release everything; idempotent
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing tape");

        // Wake a consumer blocked on a reply so the lock frees up
        self.interrupt_tx.lock().take();

        {
            let mut state = self.calls.lock();
            let alive = self
                .isolate
                .lock()
                .as_ref()
                .is_some_and(|isolate| !isolate.is_finished());
            if alive {
                match self.send(&mut state, Command::Exit) {
                    Ok(seq) => {
                        match self.await_reply(&mut state, seq, self.config.tape.reply_timeout(), false) {
                            Ok(Some(Reply::Exited)) => debug!("Worker acknowledged exit"),
                            Ok(_) => warn!("Worker did not acknowledge exit"),
                            Err(e) => debug!("Exit not acknowledged: {}", e),
                        }
                    }
                    Err(e) => debug!("Exit not sent: {}", e),
                }
            }
            if !state.stash.is_empty() {
                debug!("Discarding {} undelivered records", state.stash.len());
                state.stash.clear();
            }
        }

        if let Some(isolate) = self.isolate.lock().take() {
            if isolate.wait(self.config.tape.reply_timeout()) {
                debug!("{} ran for {:?}", isolate.name(), isolate.uptime());
                if let IsolateExit::Panicked(msg) = isolate.join() {
                    warn!("Recorder worker had panicked: {}", msg);
                }
            } else {
                warn!("Recorder worker did not stop, detaching it");
            }
        }

        if let Some(mut dog) = self.watchdog.lock().take() {
            dog.stop();
        }
        info!("Tape closed");
    }

    /// Alias of [`TapeHandle::close`]
    pub fn eject(&self) {
        self.close();
    }

    fn ensure_live(&self) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TapeError::Cancelled);
        }
        if let Some(dog) = self.watchdog.lock().as_ref() {
            if dog.peer_dead() {
                return Err(TapeError::Cancelled);
            }
        }
        if let Some(isolate) = self.isolate.lock().as_ref() {
            if isolate.is_finished() {
                return Err(TapeError::Cancelled);
            }
        }
        Ok(())
    }

    fn send(&self, state: &mut CallState, command: Command) -> Result<u64> {
        state.seq += 1;
        let seq = state.seq;
        self.control
            .send(Request { seq, command })
            .map_err(|_| TapeError::Cancelled)?;
        Ok(seq)
    }

    /// Wait for the reply to `seq`
    ///
    /// Replies to earlier requests that arrive first are stale: records among
    /// them are stashed for the next `play_next`, the rest is discarded.
    fn await_reply(
        &self,
        state: &mut CallState,
        seq: u64,
        timeout: Duration,
        interruptible: bool,
    ) -> Result<Option<Reply>> {
        let deadline = Instant::now() + timeout;
        let interrupt = if interruptible {
            self.interrupt.clone()
        } else {
            never()
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(self.replies) -> response => match response {
                    Ok(Response { seq: got, reply }) if got == seq => return Ok(Some(reply)),
                    Ok(Response { seq: got, reply: Reply::Record(Some(record)) }) => {
                        debug!("Late record for request #{} kept", got);
                        state.stash.push_back(*record);
                    }
                    Ok(Response { seq: got, reply }) => {
                        debug!("Stale reply to request #{} dropped: {:?}", got, reply);
                    }
                    Err(_) => return Err(TapeError::Cancelled),
                },
                recv(self.cancel) -> _ => return Err(TapeError::Cancelled),
                recv(interrupt) -> _ => return Err(TapeError::Cancelled),
                default(remaining) => return Ok(None),
            }
        }
    }
}

impl Drop for TapeHandle {
    fn drop(&mut self) {
        self.close();
    }
}
