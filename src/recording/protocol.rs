// src/recording/protocol.rs
//! Messages exchanged between the tape handle and the recorder worker
//!
//! Three channels cross the worker boundary:
//!
//! ```text
//! handle ── Request ──────▶ worker   (control, one at a time)
//! handle ◀───── Response ── worker   (replies, tagged with the request seq)
//! handle ── WriteItem ────▶ worker   (records, fire-and-forget)
//! ```

use crate::recording::record::CaptureRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Arguments of the `Open` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Container file; `None` selects the in-memory store
    pub path: Option<PathBuf>,
    pub title: Option<String>,
    /// Write backlog considered healthy
    pub queue_depth: usize,
    pub overwrite: bool,
    pub stats: bool,
}

impl OpenRequest {
    pub fn memory() -> Self {
        Self {
            path: None,
            title: None,
            queue_depth: 1000,
            overwrite: true,
            stats: false,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::memory()
        }
    }
}

/// Control commands
#[derive(Debug, Clone)]
pub enum Command {
    Open(OpenRequest),
    Chapters,
    Next {
        chapter: Option<String>,
        wait: bool,
        purge: bool,
    },
    Last,
    Stats,
    /// Start the worker-side heartbeat; no reply
    Watchdog,
    Exit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Open(_) => "Open",
            Command::Chapters => "Chapters",
            Command::Next { .. } => "Next",
            Command::Last => "Last",
            Command::Stats => "Stats",
            Command::Watchdog => "Watchdog",
            Command::Exit => "Exit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub seq: u64,
    pub command: Command,
}

/// Write statistics of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub write_duration: Duration,
    pub bytes_written: u64,
}

/// Chunk index → stats, for the current write chapter
pub type StatsMap = BTreeMap<u64, ChunkStats>;

/// Replies to control commands
#[derive(Debug, Clone)]
pub enum Reply {
    /// Result of `Open`: `Ok` or the error message
    Status(std::result::Result<(), String>),
    Chapters(Vec<String>),
    Record(Option<Box<CaptureRecord>>),
    /// Consumer parked; the record follows as a second `Record` reply
    Wait,
    Stats(Option<StatsMap>),
    Exited,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub seq: u64,
    pub reply: Reply,
}

/// Item on the write channel
#[derive(Debug, Clone)]
pub enum WriteItem {
    Record(Box<CaptureRecord>),
    /// End of the current stream
    EndOfStream,
}
