// src/utils/mod.rs
//! Common utilities: configuration and error types

pub mod config;
pub mod errors;

pub use config::TapeConfig;
pub use errors::{Result, TapeError};
