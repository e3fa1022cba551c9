// src/recording/storage/mod.rs
//! Record persistence
//!
//! Two backends share the [`RecordStore`] interface:
//!
//! - **ContainerStore**: one SQLite container file holding the
//!   chapter → chunk → line → array hierarchy, arrays zstd-compressed
//! - **MemoryStore**: ordered in-process table, with drain-on-read support
//!
//! Stores are append-only: a chunk is written once and never rewritten.

pub mod container;
pub mod memory;

pub use container::ContainerStore;
pub use memory::MemoryStore;

use crate::recording::compressor::Compressor;
use crate::recording::protocol::OpenRequest;
use crate::recording::record::CaptureRecord;
use crate::utils::errors::{Result, TapeError};
use std::path::Path;
use tracing::info;

/// Which backend a store is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Container,
}

/// Chapter-scoped, append-only record storage
pub trait RecordStore: Send {
    fn kind(&self) -> StoreKind;

    /// Create the chapter named by `header.chapter` if it does not exist,
    /// taking its header attributes from `header`
    fn begin_chapter(&mut self, header: &CaptureRecord) -> Result<()>;

    /// Persist a record under its chapter and index; returns bytes written
    fn write(&mut self, record: &CaptureRecord) -> Result<u64>;

    fn read(&mut self, chapter: &str, index: u64) -> Result<Option<CaptureRecord>>;

    /// Drop a stored chunk; a no-op for stores that retain everything
    fn purge(&mut self, chapter: &str, index: u64) -> Result<()>;

    /// Read then purge
    fn take(&mut self, chapter: &str, index: u64) -> Result<Option<CaptureRecord>> {
        let record = self.read(chapter, index)?;
        if record.is_some() {
            self.purge(chapter, index)?;
        }
        Ok(record)
    }

    fn has_chapter(&self, chapter: &str) -> Result<bool>;

    /// Chapter names, sorted
    fn list_chapters(&self) -> Result<Vec<String>>;

    fn flush(&mut self) -> Result<()>;
}

/// Chapter tag of a record that reached the store
pub(crate) fn chapter_of(record: &CaptureRecord) -> Result<&str> {
    record
        .chapter
        .as_deref()
        .ok_or_else(|| TapeError::StorageFailed("Record has no chapter".to_string()))
}

/// Open the store selected by `request`
///
/// Without a path the in-memory store is used. A container file fails to
/// open when its directory is missing, or when it already exists and
/// overwriting was not requested.
pub fn open_store(
    request: &OpenRequest,
    title: &str,
    compressor: Compressor,
) -> Result<Box<dyn RecordStore>> {
    let Some(path) = request.path.as_deref() else {
        info!("Opening in-memory tape '{}'", title);
        return Ok(Box::new(MemoryStore::new()));
    };

    check_destination(path, request.overwrite)?;

    info!("Opening tape '{}' at {:?}", title, path);
    Ok(Box::new(ContainerStore::create(path, title, compressor)?))
}

fn check_destination(path: &Path, overwrite: bool) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        if !parent.is_dir() {
            return Err(TapeError::SetupFailed(format!(
                "Path to {} not found",
                path.display()
            )));
        }
    }
    if path.exists() {
        if !overwrite {
            return Err(TapeError::SetupFailed(format!(
                "File {} exists",
                path.display()
            )));
        }
        std::fs::remove_file(path).map_err(|e| {
            TapeError::SetupFailed(format!("Failed to replace {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_without_path() {
        let store = open_store(&OpenRequest::memory(), "t", Compressor::default()).unwrap();
        assert_eq!(store.kind(), StoreKind::Memory);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("run.tape");
        let err = open_store(&OpenRequest::file(&path), "t", Compressor::default())
            .err()
            .unwrap();
        assert!(matches!(err, TapeError::SetupFailed(msg) if msg.contains("not found")));
        assert!(!path.exists());
    }

    #[test]
    fn test_existing_file_without_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.tape");
        std::fs::write(&path, b"keep me").unwrap();

        let mut request = OpenRequest::file(&path);
        request.overwrite = false;
        let err = open_store(&request, "t", Compressor::default()).err().unwrap();
        assert!(matches!(err, TapeError::SetupFailed(msg) if msg.contains("exists")));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn test_existing_file_overwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.tape");
        std::fs::write(&path, b"old").unwrap();

        let store = open_store(&OpenRequest::file(&path), "t", Compressor::default()).unwrap();
        assert_eq!(store.kind(), StoreKind::Container);
        assert!(store.list_chapters().unwrap().is_empty());
    }
}
