// src/runtime/mod.rs
//! Worker execution runtime
//!
//! The recorder worker runs inside an [`Isolate`]: a dedicated OS thread
//! with its own failure domain. The only way in or out is the tape's
//! message channels.
//!
//! ```text
//! ┌──────────────┐   channels   ┌──────────────────────────┐
//! │  TapeHandle  │ ───────────▶ │ Isolate                  │
//! │  (producer,  │ ◀─────────── │   RecorderWorker ─ store │
//! │   consumer)  │  heartbeats  │   (panics stop here)     │
//! └──────────────┘              └──────────────────────────┘
//! ```

pub mod isolate;

pub use isolate::{Isolate, IsolateExit};
