// src/recording/mod.rs
//! Streaming capture recording
//!
//! This module provides the tape: record capture, storage and replay.
//!
//! - **Record**: capture window plus metadata, with `side_copy`/`top_up`
//! - **Assembler**: tops driver windows up into full records
//! - **Tape**: client handle used by producers and consumers
//! - **Worker**: store-owning event loop behind the handle
//! - **Watchdog**: heartbeat liveness across the worker boundary
//! - **Storage**: SQLite container file or in-memory table
//! - **Compressor**: zstd codec for sample arrays
//! - **Exporter**: export to JSON and CSV
//!
//! # Architecture
//!
//! ```text
//! driver → WindowAssembler → TapeHandle::record() → write queue ─┐
//!                                                                ▼
//! consumer ← TapeHandle::play_next() ← replies ← RecorderWorker → RecordStore
//!                       │                              ▲
//!                       └────────── control ───────────┘
//! ```

pub mod assembler;
pub mod compressor;
pub mod event_queue;
pub mod exporter;
pub mod protocol;
pub mod record;
pub mod storage;
pub mod tape;
pub mod watchdog;
pub mod worker;

// Re-export commonly used types
pub use assembler::WindowAssembler;
pub use compressor::{CompressionLevel, Compressor};
pub use event_queue::QueueStats;
pub use exporter::{ExportFormat, Exporter};
pub use protocol::{ChunkStats, OpenRequest, StatsMap};
pub use record::{BufferValue, CaptureRecord, LineId, Scalar, TimeUnits, TriggerDirection, TriggerSetup};
pub use storage::{ContainerStore, MemoryStore, RecordStore};
pub use tape::TapeHandle;
pub use watchdog::Watchdog;
pub use worker::RecorderWorker;
