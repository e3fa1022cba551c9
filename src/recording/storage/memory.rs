// src/recording/storage/memory.rs
//! In-process record table, used when the tape has no file

use super::{chapter_of, RecordStore, StoreKind};
use crate::recording::record::CaptureRecord;
use crate::utils::errors::{Result, TapeError};
use std::collections::BTreeMap;
use tracing::trace;

/// Ordered `chapter → (index → record)` table
#[derive(Debug, Default)]
pub struct MemoryStore {
    chapters: BTreeMap<String, BTreeMap<u64, CaptureRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records currently retained in `chapter`
    pub fn retained(&self, chapter: &str) -> usize {
        self.chapters.get(chapter).map_or(0, BTreeMap::len)
    }
}

impl RecordStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    fn begin_chapter(&mut self, header: &CaptureRecord) -> Result<()> {
        let chapter = chapter_of(header)?;
        self.chapters.entry(chapter.to_string()).or_default();
        Ok(())
    }

    fn write(&mut self, record: &CaptureRecord) -> Result<u64> {
        let chapter = chapter_of(record)?.to_string();
        let bytes = record.payload_bytes();
        let chunks = self.chapters.entry(chapter.clone()).or_default();
        if chunks.contains_key(&record.index) {
            return Err(TapeError::StorageFailed(format!(
                "Chunk {} of '{}' already written",
                record.index, chapter
            )));
        }
        trace!("Stored chunk {} of '{}' in memory", record.index, chapter);
        chunks.insert(record.index, record.clone());
        Ok(bytes)
    }

    fn read(&mut self, chapter: &str, index: u64) -> Result<Option<CaptureRecord>> {
        Ok(self
            .chapters
            .get(chapter)
            .and_then(|chunks| chunks.get(&index))
            .cloned())
    }

    fn purge(&mut self, chapter: &str, index: u64) -> Result<()> {
        if let Some(chunks) = self.chapters.get_mut(chapter) {
            chunks.remove(&index);
        }
        Ok(())
    }

    fn take(&mut self, chapter: &str, index: u64) -> Result<Option<CaptureRecord>> {
        Ok(self
            .chapters
            .get_mut(chapter)
            .and_then(|chunks| chunks.remove(&index)))
    }

    fn has_chapter(&self, chapter: &str) -> Result<bool> {
        Ok(self.chapters.contains_key(chapter))
    }

    fn list_chapters(&self) -> Result<Vec<String>> {
        Ok(self.chapters.keys().cloned().collect())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
