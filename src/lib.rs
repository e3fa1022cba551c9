// src/lib.rs
//! Capture Tape Library
//!
//! Streaming capture recorder: accepts a continuous sequence of
//! fixed-capacity sample windows from a live acquisition loop, persists them
//! append-only by chapter, and replays them in order while recording is
//! still in progress.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **recording**: Records, tape handle, worker, watchdog, stores, export
//! - **runtime**: Isolated execution of the recorder worker
//! - **observability**: Tracing and metrics setup
//! - **utils**: Configuration and error types
//!
//! # Example
//!
//! ```no_run
//! use capture_tape::{CaptureRecord, LineId, TapeConfig, TapeHandle};
//! use std::time::Duration;
//!
//! let tape = TapeHandle::load(&TapeConfig::default())?;
//!
//! let mut window = CaptureRecord::new("run1", 1000);
//! window.add_array(LineId::Channel(0), "raw");
//! window.set_window(0, 1000);
//! tape.record(Some(&window))?;
//! tape.record(None)?;
//!
//! let first = tape.play_next(Some("run1"), true, Duration::from_secs(1), false)?;
//! assert!(first.is_some());
//! tape.close();
//! # Ok::<(), capture_tape::TapeError>(())
//! ```

// Public module exports
pub mod observability;
pub mod recording;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use recording::record::{CaptureRecord, LineId, Scalar};
pub use recording::tape::TapeHandle;
pub use recording::assembler::WindowAssembler;
pub use utils::config::TapeConfig;
pub use utils::errors::{Result, TapeError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Tape build information
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
