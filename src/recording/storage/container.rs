// src/recording/storage/container.rs
//! Container file store
//!
//! One SQLite file per recording session. The tables mirror the tape
//! hierarchy:
//!
//! ```text
//! tape                          title
//! chapters   (name)             chapter header attributes
//! chunks     (chapter, idx)     record%08d, chunk attributes
//! lines      (…, line)          channelNN / portNN, scalar attributes
//! arrays     (…, line, name)    zstd-compressed valid window
//! ```
//!
//! Each chunk is inserted in its own transaction; rows are never updated.

use super::{chapter_of, RecordStore, StoreKind};
use crate::recording::compressor::Compressor;
use crate::recording::record::{
    BufferValue, CaptureRecord, LineId, Scalar, TimeUnits, TriggerSetup,
};
use crate::utils::errors::{Result, TapeError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Chunk group name
pub fn chunk_name(index: u64) -> String {
    format!("record{:08}", index)
}

/// Chapter-level attributes, taken from the first chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChapterHeader {
    chapter: String,
    interval: u32,
    units: TimeUnits,
    mode: u32,
    downsample: u32,
    device: String,
    serial: String,
    trigger_set: bool,
    trigger_setup: Option<TriggerSetup>,
}

impl ChapterHeader {
    fn from_record(chapter: &str, rec: &CaptureRecord) -> Self {
        Self {
            chapter: chapter.to_string(),
            interval: rec.interval,
            units: rec.units,
            mode: rec.mode,
            downsample: rec.downsample,
            device: rec.device.clone(),
            serial: rec.serial.clone(),
            trigger_set: rec.trigger_set,
            trigger_setup: rec.trigger_setup.clone(),
        }
    }
}

/// Per-chunk attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkAttrs {
    timestamp: Option<DateTime<Utc>>,
    samples: usize,
    bufflen: usize,
    trigger_at: Option<usize>,
    is_final: bool,
}

/// SQLite-backed container
pub struct ContainerStore {
    path: PathBuf,
    conn: Connection,
    compressor: Compressor,
}

impl ContainerStore {
    /// Create a new container file; the file must not exist yet
    pub fn create(path: &Path, title: &str, compressor: Compressor) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| TapeError::SetupFailed(format!("Failed to create {}: {}", path.display(), e)))?;

        let store = Self {
            path: path.to_path_buf(),
            conn,
            compressor,
        };
        store.init_schema()?;

        store
            .conn
            .execute(
                "INSERT INTO tape (title, created_at) VALUES (?, ?)",
                params![title, Utc::now().timestamp()],
            )
            .map_err(|e| TapeError::SetupFailed(format!("Failed to write tape title: {}", e)))?;

        info!("Tape container created at {:?}", store.path);
        Ok(store)
    }

    /// Open an existing container for replay
    pub fn open_existing(path: &Path, compressor: Compressor) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| TapeError::SetupFailed(format!("Failed to open {}: {}", path.display(), e)))?;

        let store = Self {
            path: path.to_path_buf(),
            conn,
            compressor,
        };
        // Fails on files that are not tape containers
        store.title()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                PRAGMA synchronous = NORMAL;
                CREATE TABLE IF NOT EXISTS tape (
                    title TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS chapters (
                    name TEXT PRIMARY KEY,
                    header TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS chunks (
                    chapter TEXT NOT NULL,
                    idx INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    attrs TEXT NOT NULL,
                    PRIMARY KEY (chapter, idx)
                );
                CREATE TABLE IF NOT EXISTS lines (
                    chapter TEXT NOT NULL,
                    idx INTEGER NOT NULL,
                    line TEXT NOT NULL,
                    attrs TEXT NOT NULL,
                    PRIMARY KEY (chapter, idx, line)
                );
                CREATE TABLE IF NOT EXISTS arrays (
                    chapter TEXT NOT NULL,
                    idx INTEGER NOT NULL,
                    line TEXT NOT NULL,
                    name TEXT NOT NULL,
                    len INTEGER NOT NULL,
                    data BLOB NOT NULL,
                    PRIMARY KEY (chapter, idx, line, name)
                );
                "#,
            )
            .map_err(|e| TapeError::SetupFailed(format!("Schema creation failed: {}", e)))
    }

    pub fn title(&self) -> Result<String> {
        self.conn
            .query_row("SELECT title FROM tape LIMIT 1", [], |row| row.get(0))
            .map_err(|e| TapeError::StorageFailed(format!("Tape title not found: {}", e)))
    }

    /// Number of chunks stored in `chapter`
    pub fn chunk_count(&self, chapter: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE chapter = ?",
            params![chapter],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Every chunk of `chapter`, in index order
    pub fn read_chapter(&mut self, chapter: &str) -> Result<Vec<CaptureRecord>> {
        let indices: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare("SELECT idx FROM chunks WHERE chapter = ? ORDER BY idx")?;
            let rows = stmt.query_map(params![chapter], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut records = Vec::with_capacity(indices.len());
        for idx in indices {
            if let Some(rec) = self.read(chapter, idx as u64)? {
                records.push(rec);
            }
        }
        Ok(records)
    }

    fn header(&self, chapter: &str) -> Result<Option<ChapterHeader>> {
        let header: Option<String> = self
            .conn
            .query_row(
                "SELECT header FROM chapters WHERE name = ?",
                params![chapter],
                |row| row.get(0),
            )
            .optional()?;
        header
            .map(|h| serde_json::from_str(&h).map_err(TapeError::from))
            .transpose()
    }
}

impl RecordStore for ContainerStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Container
    }

    fn begin_chapter(&mut self, header: &CaptureRecord) -> Result<()> {
        let chapter = chapter_of(header)?;
        let attrs = serde_json::to_string(&ChapterHeader::from_record(chapter, header))?;

        let created = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO chapters (name, header, created_at) VALUES (?, ?, ?)",
                params![chapter, attrs, Utc::now().timestamp()],
            )
            .map_err(|e| TapeError::StorageFailed(format!("Failed to create chapter: {}", e)))?;

        if created > 0 {
            debug!("Created chapter '{}'", chapter);
        }
        Ok(())
    }

    fn write(&mut self, record: &CaptureRecord) -> Result<u64> {
        let chapter = chapter_of(record)?.to_string();
        record.validate()?;

        let idx = record.index as i64;
        let window = record.start..record.start + record.samples;
        let attrs = serde_json::to_string(&ChunkAttrs {
            timestamp: record.timestamp,
            samples: record.samples,
            bufflen: record.bufflen,
            trigger_at: record.trigger_at,
            is_final: record.is_final,
        })?;

        // Compress before opening the transaction
        let mut lines = Vec::with_capacity(record.buffers.len());
        let mut bytes_written = 0u64;
        for (line, entries) in &record.buffers {
            let mut scalars: BTreeMap<&str, &Scalar> = BTreeMap::new();
            let mut arrays = Vec::new();
            for (name, value) in entries {
                match value {
                    BufferValue::Scalar(s) => {
                        scalars.insert(name, s);
                    }
                    BufferValue::Array(a) => {
                        let data = self.compressor.compress_samples(&a[window.clone()])?;
                        bytes_written += data.len() as u64;
                        arrays.push((name.as_str(), data));
                    }
                }
            }
            lines.push((line.name(), serde_json::to_string(&scalars)?, arrays));
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|e| TapeError::StorageFailed(format!("Failed to begin chunk: {}", e)))?;

        tx.execute(
            "INSERT INTO chunks (chapter, idx, name, attrs) VALUES (?, ?, ?, ?)",
            params![chapter, idx, chunk_name(record.index), attrs],
        )
        .map_err(|e| {
            TapeError::StorageFailed(format!(
                "Failed to write chunk {} of '{}': {}",
                record.index, chapter, e
            ))
        })?;

        for (line, scalars, arrays) in &lines {
            tx.execute(
                "INSERT INTO lines (chapter, idx, line, attrs) VALUES (?, ?, ?, ?)",
                params![chapter, idx, line, scalars],
            )?;
            for (name, data) in arrays {
                tx.execute(
                    "INSERT INTO arrays (chapter, idx, line, name, len, data) VALUES (?, ?, ?, ?, ?, ?)",
                    params![chapter, idx, line, name, record.samples as i64, data],
                )?;
            }
        }

        tx.commit()
            .map_err(|e| TapeError::StorageFailed(format!("Failed to commit chunk: {}", e)))?;

        debug!(
            "Wrote {}/{} ({} samples, {} bytes)",
            chapter,
            chunk_name(record.index),
            record.samples,
            bytes_written
        );

        Ok(bytes_written)
    }

    fn read(&mut self, chapter: &str, index: u64) -> Result<Option<CaptureRecord>> {
        let idx = index as i64;
        let attrs: Option<String> = self
            .conn
            .query_row(
                "SELECT attrs FROM chunks WHERE chapter = ? AND idx = ?",
                params![chapter, idx],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attrs) = attrs else {
            return Ok(None);
        };
        let attrs: ChunkAttrs = serde_json::from_str(&attrs)?;

        let mut rec = CaptureRecord::new(chapter, attrs.bufflen);
        if let Some(header) = self.header(chapter)? {
            rec.interval = header.interval;
            rec.units = header.units;
            rec.mode = header.mode;
            rec.downsample = header.downsample;
            rec.device = header.device;
            rec.serial = header.serial;
            rec.trigger_set = header.trigger_set;
            rec.trigger_setup = header.trigger_setup;
        }
        rec.index = index;
        rec.samples = attrs.samples;
        rec.timestamp = attrs.timestamp;
        rec.trigger_at = attrs.trigger_at;
        rec.is_final = attrs.is_final;

        {
            let mut stmt = self
                .conn
                .prepare("SELECT line, attrs FROM lines WHERE chapter = ? AND idx = ?")?;
            let rows = stmt.query_map(params![chapter, idx], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (line, scalars) = row?;
                let Some(line) = LineId::parse(&line) else {
                    continue;
                };
                let scalars: BTreeMap<String, Scalar> = serde_json::from_str(&scalars)?;
                let entries = rec.buffers.entry(line).or_default();
                for (name, value) in scalars {
                    entries.insert(name, BufferValue::Scalar(value));
                }
            }
        }

        let mut stmt = self
            .conn
            .prepare("SELECT line, name, len, data FROM arrays WHERE chapter = ? AND idx = ?")?;
        let rows = stmt.query_map(params![chapter, idx], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;
        for row in rows {
            let (line, name, len, data) = row?;
            let Some(line) = LineId::parse(&line) else {
                continue;
            };
            let mut samples = self.compressor.decompress_samples(&data, len as usize)?;
            samples.resize(attrs.bufflen.max(samples.len()), 0);
            rec.set_array(line, &name, samples);
        }

        Ok(Some(rec))
    }

    fn purge(&mut self, _chapter: &str, _index: u64) -> Result<()> {
        Ok(())
    }

    fn has_chapter(&self, chapter: &str) -> Result<bool> {
        Ok(self.header(chapter)?.is_some())
    }

    fn list_chapters(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM chapters ORDER BY name")
            .map_err(|e| TapeError::StorageFailed(format!("Query preparation failed: {}", e)))?;

        let chapters = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| TapeError::StorageFailed(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| TapeError::StorageFailed(format!("Result collection failed: {}", e)))?;

        Ok(chapters)
    }

    fn flush(&mut self) -> Result<()> {
        // Chunks are committed one transaction each; only the page cache is left
        self.conn
            .cache_flush()
            .map_err(|e| TapeError::StorageFailed(format!("Failed to flush container: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::record::TriggerDirection;
    use tempfile::tempdir;

    fn chunk(chapter: &str, index: u64, data: &[i16]) -> CaptureRecord {
        let mut rec = CaptureRecord::new(chapter, 8);
        rec.index = index;
        rec.interval = 250;
        rec.units = TimeUnits::Us;
        rec.device = "5444B".to_string();
        rec.serial = "GR123/0042".to_string();
        rec.trigger_set = true;
        rec.trigger_setup = Some(TriggerSetup {
            source: LineId::Channel(0),
            threshold: 1200,
            direction: TriggerDirection::Rising,
        });
        rec.trigger_at = Some(1);
        rec.timestamp = Some(Utc::now());

        let mut raw = vec![0i16; 8];
        raw[2..2 + data.len()].copy_from_slice(data);
        rec.set_array(LineId::Channel(0), "raw", raw);
        rec.set_scalar(LineId::Channel(0), "range", Scalar::Int(7));
        rec.set_scalar(LineId::Channel(0), "overflow", Scalar::Bool(true));
        rec.set_array(LineId::Port(1), "raw", vec![0x0f; 8]);
        rec.set_window(2, data.len());
        rec
    }

    fn store() -> (tempfile::TempDir, ContainerStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.tape");
        let store = ContainerStore::create(&path, "bench run", Compressor::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_chunk_name() {
        assert_eq!(chunk_name(12), "record00000012");
    }

    #[test]
    fn test_write_read_chunk() {
        let (_dir, mut store) = store();
        let rec = chunk("A", 0, &[5, 6, 7]);
        store.begin_chapter(&rec).unwrap();
        let bytes = store.write(&rec).unwrap();
        assert!(bytes > 0);

        let back = store.read("A", 0).unwrap().unwrap();
        assert_eq!(back.start, 0);
        assert_eq!(back.samples, 3);
        assert_eq!(back.bufflen, 8);
        assert_eq!(back.window(LineId::Channel(0), "raw").unwrap(), &[5, 6, 7]);
        assert_eq!(back.array(LineId::Channel(0), "raw").unwrap().len(), 8);
        assert_eq!(back.window(LineId::Port(1), "raw").unwrap(), &[0x0f; 3]);
        assert_eq!(back.scalar(LineId::Channel(0), "range"), Some(&Scalar::Int(7)));
        assert_eq!(back.scalar(LineId::Channel(0), "overflow"), Some(&Scalar::Bool(true)));
        assert_eq!(back.trigger_at, Some(1));
        assert_eq!(back.units, TimeUnits::Us);
        assert_eq!(back.serial, "GR123/0042");
        assert_eq!(back.trigger_setup, rec.trigger_setup);
        assert_eq!(back.timestamp, rec.timestamp);
    }

    #[test]
    fn test_header_comes_from_first_chunk() {
        let (_dir, mut store) = store();
        let first = chunk("A", 0, &[1]);
        store.begin_chapter(&first).unwrap();
        store.write(&first).unwrap();

        let mut second = chunk("A", 1, &[2]);
        second.interval = 999;
        store.begin_chapter(&second).unwrap();
        store.write(&second).unwrap();

        assert_eq!(store.read("A", 1).unwrap().unwrap().interval, 250);
    }

    #[test]
    fn test_chunks_never_rewritten() {
        let (_dir, mut store) = store();
        let rec = chunk("A", 0, &[1, 2]);
        store.begin_chapter(&rec).unwrap();
        store.write(&rec).unwrap();
        assert!(matches!(store.write(&rec), Err(TapeError::StorageFailed(_))));
        assert_eq!(store.chunk_count("A").unwrap(), 1);
    }

    #[test]
    fn test_missing_chunk_and_chapter() {
        let (_dir, mut store) = store();
        assert!(store.read("A", 0).unwrap().is_none());
        assert!(!store.has_chapter("A").unwrap());
    }

    #[test]
    fn test_reopen_for_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.tape");
        {
            let mut store = ContainerStore::create(&path, "session", Compressor::default()).unwrap();
            for i in 0..3 {
                let rec = chunk("B", i, &[i as i16; 4]);
                store.begin_chapter(&rec).unwrap();
                store.write(&rec).unwrap();
            }
            store.flush().unwrap();
        }

        let mut store = ContainerStore::open_existing(&path, Compressor::default()).unwrap();
        assert_eq!(store.title().unwrap(), "session");
        assert_eq!(store.list_chapters().unwrap(), vec!["B"]);
        let records = store.read_chapter("B").unwrap();
        let indices: Vec<u64> = records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(records[2].window(LineId::Channel(0), "raw").unwrap(), &[2; 4]);
    }

    #[test]
    fn test_open_existing_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert!(ContainerStore::open_existing(&path, Compressor::default()).is_err());
    }
}
