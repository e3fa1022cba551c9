// src/recording/worker.rs
//! Recorder worker
//!
//! Owns the record store for the lifetime of a tape. A single cooperative
//! loop services the control channel and the write queue:
//!
//! 1. Dispatch at most one control command
//! 2. If a store is open, handle at most one write item
//! 3. Sleep one idle quantum when neither produced work
//!
//! The loop never blocks on I/O while idle. A consumer asking for a chunk
//! that does not exist yet is parked; the write path hands it the next
//! record of its chapter.

use crate::recording::compressor::Compressor;
use crate::recording::event_queue::QueueReader;
use crate::recording::protocol::{
    ChunkStats, Command, OpenRequest, Reply, Request, Response, StatsMap, WriteItem,
};
use crate::recording::record::CaptureRecord;
use crate::recording::storage::{open_store, RecordStore};
use crate::recording::watchdog::{HeartbeatLink, Watchdog, WatchdogTiming};
use crate::utils::errors::Result;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use metrics::{counter, histogram};
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Worker tuning
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Sleep between polls when there is nothing to do
    pub idle_quantum: Duration,
    pub compressor: Compressor,
    pub watchdog: WatchdogTiming,
}

/// Worker ends of the tape channels
pub struct WorkerChannels {
    pub control: Receiver<Request>,
    pub replies: Sender<Response>,
    pub writes: QueueReader,
    /// Heartbeat link, consumed by the `Watchdog` command
    pub heartbeat: Option<HeartbeatLink>,
}

/// Next chunk a consumer will read
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadCursor {
    chapter: String,
    index: u64,
}

/// Consumer waiting for the next chunk of `chapter`
#[derive(Debug, Clone)]
struct Parked {
    seq: u64,
    chapter: String,
    purge: bool,
}

/// Store-owning event loop
pub struct RecorderWorker {
    settings: WorkerSettings,
    channels: WorkerChannels,
    store: Option<Box<dyn RecordStore>>,
    title: String,
    backlog_limit: usize,
    backlog_warned: bool,
    stats_enabled: bool,
    /// Per-chunk stats of the current write chapter
    stats: Option<StatsMap>,
    write_chapter: Option<String>,
    next_index: HashMap<String, u64>,
    last: Option<CaptureRecord>,
    cursor: Option<ReadCursor>,
    parked: Option<Parked>,
    stopped: bool,
    watchdog: Option<Watchdog>,
}

impl RecorderWorker {
    pub fn new(settings: WorkerSettings, channels: WorkerChannels) -> Self {
        Self {
            settings,
            channels,
            store: None,
            title: String::new(),
            backlog_limit: 0,
            backlog_warned: false,
            stats_enabled: false,
            stats: None,
            write_chapter: None,
            next_index: HashMap::new(),
            last: None,
            cursor: None,
            parked: None,
            stopped: false,
            watchdog: None,
        }
    }

    /// Run until `Exit`, a dead handle, or a tripped watchdog
    pub fn run(mut self) {
        info!("Recorder worker started");

        loop {
            if self.watchdog.as_ref().is_some_and(Watchdog::peer_dead) {
                warn!("Tape handle stopped answering heartbeats, shutting down");
                break;
            }

            let mut busy = false;

            match self.channels.control.try_recv() {
                Ok(request) => {
                    busy = true;
                    if !self.dispatch(request) {
                        break;
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    info!("Tape handle dropped, shutting down");
                    break;
                }
            }

            if self.store.is_some() {
                // A disconnected write queue means the handle is closing;
                // the control channel reports that separately
                if let Ok(Some(item)) = self.channels.writes.try_pop() {
                    busy = true;
                    self.handle_write(item);
                }
            }

            if !busy {
                thread::sleep(self.settings.idle_quantum);
            }
        }

        self.shutdown();
    }

    /// Handle one command; returns false when the loop must end
    fn dispatch(&mut self, request: Request) -> bool {
        let Request { seq, command } = request;
        trace!("Command #{}: {}", seq, command.name());

        match command {
            Command::Open(open) => {
                let status = self.open(open);
                self.reply(seq, Reply::Status(status));
            }
            Command::Chapters => {
                let chapters = self.chapters();
                self.reply(seq, Reply::Chapters(chapters));
            }
            Command::Next {
                chapter,
                wait,
                purge,
            } => self.next(seq, chapter, wait, purge),
            Command::Last => {
                let last = self.last.clone().map(Box::new);
                self.reply(seq, Reply::Record(last));
            }
            Command::Stats => {
                let stats = self.stats.clone();
                self.reply(seq, Reply::Stats(stats));
            }
            Command::Watchdog => self.start_watchdog(),
            Command::Exit => {
                self.reply(seq, Reply::Exited);
                return false;
            }
        }
        true
    }

    fn reply(&self, seq: u64, reply: Reply) {
        if self.channels.replies.send(Response { seq, reply }).is_err() {
            debug!("Reply #{} dropped, handle gone", seq);
        }
    }

    fn open(&mut self, request: OpenRequest) -> std::result::Result<(), String> {
        if self.store.is_some() {
            warn!("Open rejected, tape '{}' already open", self.title);
            return Err("tape already open".to_string());
        }

        let title = request
            .title
            .clone()
            .unwrap_or_else(|| Utc::now().format("Tape-%Y%m%d-%H%M%S").to_string());

        let store = open_store(&request, &title, self.settings.compressor).map_err(|e| {
            error!("Failed to open tape '{}': {}", title, e);
            e.to_string()
        })?;

        info!(
            "Tape '{}' open ({:?} store, backlog limit {}, stats {})",
            title,
            store.kind(),
            request.queue_depth,
            request.stats
        );

        self.store = Some(store);
        self.title = title;
        self.backlog_limit = request.queue_depth;
        self.stats_enabled = request.stats;
        self.stats = request.stats.then(StatsMap::new);
        self.write_chapter = None;
        self.next_index.clear();
        self.last = None;
        self.cursor = None;
        self.parked = None;
        self.stopped = false;
        Ok(())
    }

    fn chapters(&self) -> Vec<String> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };
        store.list_chapters().unwrap_or_else(|e| {
            error!("Failed to list chapters: {}", e);
            Vec::new()
        })
    }

    fn start_watchdog(&mut self) {
        if self.watchdog.is_some() {
            debug!("Worker watchdog already running");
            return;
        }
        let Some(link) = self.channels.heartbeat.take() else {
            warn!("Watchdog requested but no heartbeat link was provided");
            return;
        };
        match Watchdog::start("worker", link, self.settings.watchdog) {
            Ok(dog) => self.watchdog = Some(dog),
            Err(e) => error!("{}", e),
        }
    }

    fn next(&mut self, seq: u64, chapter: Option<String>, wait: bool, purge: bool) {
        if let Some(stale) = self.parked.take() {
            debug!(
                "Consumer #{} on '{}' superseded by #{}",
                stale.seq, stale.chapter, seq
            );
        }

        let chapter = chapter
            .or_else(|| self.cursor.as_ref().map(|c| c.chapter.clone()))
            .or_else(|| self.write_chapter.clone());
        let (Some(chapter), Some(store)) = (chapter, self.store.as_mut()) else {
            self.reply(seq, Reply::Record(None));
            return;
        };

        let cursor = match self.cursor.take() {
            Some(cursor) if cursor.chapter == chapter => cursor,
            _ => ReadCursor {
                chapter: chapter.clone(),
                index: 0,
            },
        };

        // An unknown chapter reads as not-yet-written, so `wait` parks on it
        let found = match store.has_chapter(&chapter) {
            Ok(false) => Ok(None),
            Ok(true) if purge => store.take(&chapter, cursor.index),
            Ok(true) => store.read(&chapter, cursor.index),
            Err(e) => Err(e),
        };

        match found {
            Ok(Some(record)) => {
                self.cursor = Some(ReadCursor {
                    chapter,
                    index: cursor.index + 1,
                });
                self.reply(seq, Reply::Record(Some(Box::new(record))));
            }
            Ok(None) if wait && !self.stopped => {
                debug!(
                    "Consumer #{} parked on '{}' chunk {}",
                    seq, chapter, cursor.index
                );
                self.cursor = Some(cursor);
                self.parked = Some(Parked {
                    seq,
                    chapter,
                    purge,
                });
                self.reply(seq, Reply::Wait);
            }
            Ok(None) => {
                self.cursor = Some(cursor);
                self.reply(seq, Reply::Record(None));
            }
            Err(e) => {
                error!("Failed to read '{}' chunk {}: {}", chapter, cursor.index, e);
                self.cursor = Some(cursor);
                self.reply(seq, Reply::Record(None));
            }
        }
    }

    fn handle_write(&mut self, item: WriteItem) {
        match item {
            WriteItem::EndOfStream => {
                info!("End of stream on '{}'", self.write_chapter.as_deref().unwrap_or("-"));
                self.stopped = true;
                if let Some(parked) = self.parked.take() {
                    self.reply(parked.seq, Reply::Record(None));
                }
                self.flush();
            }
            WriteItem::Record(record) => self.write(*record),
        }
        self.check_backlog();
    }

    fn write(&mut self, mut record: CaptureRecord) {
        let chapter = record
            .chapter
            .take()
            .or_else(|| self.write_chapter.clone())
            .unwrap_or_else(|| Utc::now().format("%Y%m%d_%H%M%S").to_string());
        record.chapter = Some(chapter.clone());

        if self.write_chapter.as_deref() != Some(chapter.as_str()) {
            if let Err(e) = self.switch_chapter(&record) {
                error!("Failed to open chapter '{}': {}", chapter, e);
                counter!("tape_records_dropped_total").increment(1);
                return;
            }
        }

        let index = self.next_index.get(&chapter).copied().unwrap_or(0);
        record.index = index;

        let Some(store) = self.store.as_mut() else {
            return;
        };

        let started = Instant::now();
        let bytes_written = match record.validate().and_then(|_| store.write(&record)) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Dropped chunk {} of '{}': {}", index, chapter, e);
                counter!("tape_records_dropped_total").increment(1);
                return;
            }
        };
        let write_duration = started.elapsed();

        self.next_index.insert(chapter.clone(), index + 1);
        self.stopped = false;

        counter!("tape_chunks_written_total").increment(1);
        counter!("tape_bytes_written_total").increment(bytes_written);
        histogram!("tape_chunk_write_seconds").record(write_duration.as_secs_f64());
        debug!(
            "Chunk {} of '{}' written in {:?} ({} bytes)",
            index, chapter, write_duration, bytes_written
        );

        if let Some(stats) = self.stats.as_mut() {
            stats.insert(
                index,
                ChunkStats {
                    write_duration,
                    bytes_written,
                },
            );
        }

        self.deliver_parked(&record);
        self.last = Some(record);
    }

    /// Make `header.chapter` the write chapter
    fn switch_chapter(&mut self, header: &CaptureRecord) -> Result<()> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        if let Some(previous) = self.write_chapter.take() {
            debug!("Closing chapter '{}'", previous);
            store.flush()?;
        }
        store.begin_chapter(header)?;

        let chapter = header.chapter.clone().unwrap_or_default();
        let resume = self.next_index.get(&chapter).copied().unwrap_or(0);
        info!("Recording chapter '{}' from chunk {}", chapter, resume);

        self.write_chapter = Some(chapter);
        self.last = None;
        self.stats = self.stats_enabled.then(StatsMap::new);
        Ok(())
    }

    /// Hand a freshly written record to a consumer parked on its chapter
    fn deliver_parked(&mut self, record: &CaptureRecord) {
        let chapter = record.chapter.as_deref().unwrap_or_default();
        if !self.parked.as_ref().is_some_and(|p| p.chapter == chapter) {
            return;
        }
        let Some(parked) = self.parked.take() else {
            return;
        };

        self.cursor = Some(ReadCursor {
            chapter: parked.chapter.clone(),
            index: record.index + 1,
        });

        if parked.purge {
            if let Some(store) = self.store.as_mut() {
                if let Err(e) = store.purge(&parked.chapter, record.index) {
                    warn!("Failed to purge chunk {} of '{}': {}", record.index, parked.chapter, e);
                }
            }
        }

        trace!("Chunk {} delivered to consumer #{}", record.index, parked.seq);
        self.reply(parked.seq, Reply::Record(Some(Box::new(record.clone()))));
    }

    fn check_backlog(&mut self) {
        if self.backlog_limit == 0 {
            return;
        }
        let backlog = self.channels.writes.len();
        if backlog >= self.backlog_limit && !self.backlog_warned {
            warn!(
                "Write backlog at {} records (limit {}), producer outpacing storage",
                backlog, self.backlog_limit
            );
            self.backlog_warned = true;
        } else if backlog < self.backlog_limit / 2 {
            self.backlog_warned = false;
        }
    }

    fn flush(&mut self) {
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.flush() {
                error!("Failed to flush tape '{}': {}", self.title, e);
            }
        }
    }

    fn shutdown(&mut self) {
        self.flush();
        if self.store.take().is_some() {
            info!("Tape '{}' closed", self.title);
        }
        if let Some(mut dog) = self.watchdog.take() {
            dog.stop();
        }
        info!("Recorder worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::event_queue::{write_queue, QueueWriter};
    use crate::recording::record::LineId;
    use crossbeam_channel::unbounded;
    use std::thread::JoinHandle;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        control: Sender<Request>,
        replies: Receiver<Response>,
        writes: QueueWriter,
        seq: u64,
        thread: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn start() -> Self {
            let (control_tx, control_rx) = unbounded();
            let (reply_tx, reply_rx) = unbounded();
            let (writer, reader) = write_queue(64);
            let worker = RecorderWorker::new(
                WorkerSettings {
                    idle_quantum: Duration::from_micros(200),
                    compressor: Compressor::default(),
                    watchdog: WatchdogTiming {
                        interval: Duration::from_millis(100),
                        patience: Duration::from_secs(2),
                    },
                },
                WorkerChannels {
                    control: control_rx,
                    replies: reply_tx,
                    writes: reader,
                    heartbeat: None,
                },
            );
            let thread = thread::spawn(move || worker.run());
            Self {
                control: control_tx,
                replies: reply_rx,
                writes: writer,
                seq: 0,
                thread: Some(thread),
            }
        }

        fn send(&mut self, command: Command) -> u64 {
            self.seq += 1;
            self.control
                .send(Request {
                    seq: self.seq,
                    command,
                })
                .unwrap();
            self.seq
        }

        fn recv(&self) -> Response {
            self.replies.recv_timeout(WAIT).unwrap()
        }

        fn call(&mut self, command: Command) -> Reply {
            let seq = self.send(command);
            let response = self.recv();
            assert_eq!(response.seq, seq);
            response.reply
        }

        fn open_memory(&mut self) {
            let reply = self.call(Command::Open(OpenRequest {
                stats: true,
                ..OpenRequest::memory()
            }));
            assert!(matches!(reply, Reply::Status(Ok(()))));
        }

        fn write(&self, record: CaptureRecord) {
            self.writes
                .push(WriteItem::Record(Box::new(record)), WAIT)
                .unwrap();
        }

        fn end(&self) {
            self.writes.push(WriteItem::EndOfStream, WAIT).unwrap();
        }

        fn next(&mut self, chapter: &str, wait: bool, purge: bool) -> Reply {
            self.call(Command::Next {
                chapter: Some(chapter.to_string()),
                wait,
                purge,
            })
        }

        /// Poll until `count` chunks of `chapter` are readable
        fn settle(&mut self, count: usize) {
            let deadline = Instant::now() + WAIT;
            while Instant::now() < deadline {
                if let Reply::Stats(Some(stats)) = self.call(Command::Stats) {
                    if stats.len() >= count {
                        return;
                    }
                }
                thread::sleep(Duration::from_millis(2));
            }
            panic!("worker did not write {} chunks", count);
        }

        /// Poll until the last written chunk is `chapter`/`index`
        fn settle_last(&mut self, chapter: &str, index: u64) {
            let deadline = Instant::now() + WAIT;
            while Instant::now() < deadline {
                if let Reply::Record(Some(last)) = self.call(Command::Last) {
                    if last.chapter.as_deref() == Some(chapter) && last.index == index {
                        return;
                    }
                }
                thread::sleep(Duration::from_millis(2));
            }
            panic!("worker did not write chunk {} of '{}'", index, chapter);
        }

        fn exit(mut self) {
            assert!(matches!(self.call(Command::Exit), Reply::Exited));
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    fn record(chapter: Option<&str>, samples: usize) -> CaptureRecord {
        let mut rec = CaptureRecord::new("unused", 4);
        rec.chapter = chapter.map(str::to_string);
        rec.set_array(LineId::Channel(0), "raw", vec![samples as i16; 4]);
        rec.set_window(0, samples);
        rec
    }

    fn unwrap_record(reply: Reply) -> Option<CaptureRecord> {
        match reply {
            Reply::Record(rec) => rec.map(|r| *r),
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_open_twice_rejected() {
        let mut h = Harness::start();
        h.open_memory();
        match h.call(Command::Open(OpenRequest::memory())) {
            Reply::Status(Err(msg)) => assert!(msg.contains("already open")),
            other => panic!("unexpected {:?}", other),
        }
        h.exit();
    }

    #[test]
    fn test_open_missing_directory_keeps_tape_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::start();
        let path = dir.path().join("nope").join("run.tape");
        match h.call(Command::Open(OpenRequest::file(&path))) {
            Reply::Status(Err(msg)) => assert!(msg.contains("not found")),
            other => panic!("unexpected {:?}", other),
        }
        // Still closed, so a second open is accepted
        h.open_memory();
        h.exit();
    }

    #[test]
    fn test_indices_are_gap_free_per_chapter() {
        let mut h = Harness::start();
        h.open_memory();

        for _ in 0..3 {
            h.write(record(Some("A"), 4));
        }
        h.settle(3);
        assert_eq!(h.call(Command::Chapters).unwrap_chapters(), vec!["A"]);

        for expected in 0..3 {
            let rec = unwrap_record(h.next("A", false, false)).unwrap();
            assert_eq!(rec.index, expected);
        }
        assert!(unwrap_record(h.next("A", false, false)).is_none());
        h.exit();
    }

    #[test]
    fn test_returning_to_chapter_resumes_counter() {
        let mut h = Harness::start();
        h.open_memory();

        h.write(record(Some("A"), 4));
        h.write(record(Some("B"), 4));
        h.write(record(None, 4));
        h.write(record(Some("A"), 4));
        h.settle_last("A", 1);

        assert_eq!(unwrap_record(h.next("B", false, false)).unwrap().index, 0);
        assert_eq!(unwrap_record(h.next("B", false, false)).unwrap().index, 1);
        assert_eq!(unwrap_record(h.next("A", false, false)).unwrap().index, 0);
        assert_eq!(unwrap_record(h.next("A", false, false)).unwrap().index, 1);
        h.exit();
    }

    #[test]
    fn test_parked_consumer_gets_exact_record() {
        let mut h = Harness::start();
        h.open_memory();

        let seq = h.send(Command::Next {
            chapter: Some("X".to_string()),
            wait: true,
            purge: false,
        });
        let parked = h.recv();
        assert_eq!(parked.seq, seq);
        assert!(matches!(parked.reply, Reply::Wait));

        h.write(record(Some("Y"), 1));
        h.write(record(Some("X"), 3));

        let delivered = h.recv();
        assert_eq!(delivered.seq, seq);
        let rec = unwrap_record(delivered.reply).unwrap();
        assert_eq!(rec.chapter.as_deref(), Some("X"));
        assert_eq!(rec.samples, 3);
        assert_eq!(rec.index, 0);

        // Cursor moved past the delivered chunk
        assert!(unwrap_record(h.next("X", false, false)).is_none());
        h.exit();
    }

    #[test]
    fn test_end_of_stream_releases_parked_consumer() {
        let mut h = Harness::start();
        h.open_memory();

        assert!(matches!(h.next("A", true, false), Reply::Wait));
        h.end();
        let released = h.recv();
        assert!(matches!(released.reply, Reply::Record(None)));

        // Stopped: no more parking
        assert!(unwrap_record(h.next("A", true, false)).is_none());
        h.exit();
    }

    #[test]
    fn test_purge_drains_memory_store() {
        let mut h = Harness::start();
        h.open_memory();
        h.write(record(Some("A"), 4));
        h.write(record(Some("A"), 2));
        h.settle(2);

        assert!(unwrap_record(h.next("A", false, true)).is_some());
        assert!(unwrap_record(h.next("A", false, true)).is_some());
        assert!(unwrap_record(h.next("A", false, true)).is_none());

        // Restarting the cursor finds nothing left
        assert!(unwrap_record(h.next("B", false, false)).is_none());
        assert!(unwrap_record(h.next("A", false, false)).is_none());
        h.exit();
    }

    #[test]
    fn test_last_tracks_write_chapter() {
        let mut h = Harness::start();
        h.open_memory();
        assert!(unwrap_record(h.call(Command::Last)).is_none());

        h.write(record(Some("A"), 4));
        h.write(record(Some("A"), 2));
        h.settle(2);
        let last = unwrap_record(h.call(Command::Last)).unwrap();
        assert_eq!((last.index, last.samples), (1, 2));
        h.exit();
    }

    #[test]
    fn test_malformed_record_dropped_without_gap() {
        let mut h = Harness::start();
        h.open_memory();

        let mut bad = record(Some("A"), 4);
        bad.set_window(2, 4);
        h.write(record(Some("A"), 4));
        h.write(bad);
        h.write(record(Some("A"), 1));
        h.settle(2);

        let second = {
            unwrap_record(h.next("A", false, false)).unwrap();
            unwrap_record(h.next("A", false, false)).unwrap()
        };
        assert_eq!((second.index, second.samples), (1, 1));
        h.exit();
    }

    #[test]
    fn test_stats_disabled_by_default() {
        let mut h = Harness::start();
        assert!(matches!(
            h.call(Command::Open(OpenRequest::memory())),
            Reply::Status(Ok(()))
        ));
        h.write(record(Some("A"), 4));
        assert!(matches!(h.call(Command::Stats), Reply::Stats(None)));
        h.exit();
    }

    #[test]
    fn test_stats_empty_before_first_write() {
        let mut h = Harness::start();
        h.open_memory();
        match h.call(Command::Stats) {
            Reply::Stats(Some(stats)) => assert!(stats.is_empty()),
            other => panic!("expected empty stats, got {:?}", other),
        }
        h.exit();
    }

    #[test]
    fn test_implicit_chapter_name() {
        let mut h = Harness::start();
        h.open_memory();
        h.write(record(None, 4));
        h.settle(1);

        let chapters = h.call(Command::Chapters).unwrap_chapters();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].len(), "20260101_120000".len());
        assert_eq!(&chapters[0][8..9], "_");
        h.exit();
    }

    #[test]
    fn test_dropped_handle_stops_worker() {
        let h = Harness::start();
        let Harness {
            control, thread, ..
        } = h;
        drop(control);
        thread.unwrap().join().unwrap();
    }

    impl Reply {
        fn unwrap_chapters(self) -> Vec<String> {
            match self {
                Reply::Chapters(chapters) => chapters,
                other => panic!("expected chapters, got {:?}", other),
            }
        }
    }
}
