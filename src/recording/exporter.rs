// src/recording/exporter.rs
//! Export replayed records
//!
//! Supports:
//! - JSON (one object per chunk, valid windows only)
//! - CSV (one row per sample, one column per line array)

use crate::recording::record::{BufferValue, CaptureRecord, LineId, Scalar, TimeUnits};
use crate::utils::errors::{Result, TapeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Export formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// JSON format
    #[default]
    Json,

    /// CSV format
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// Exporter for replayed records
pub struct Exporter {
    format: ExportFormat,
}

impl Exporter {
    /// Create a new exporter
    pub fn new(format: ExportFormat) -> Self {
        Self { format }
    }

    /// Export records to string
    pub fn export(&self, records: &[CaptureRecord]) -> Result<String> {
        debug!("Exporting {} records to {:?} format", records.len(), self.format);

        match self.format {
            ExportFormat::Json => self.export_json(records),
            ExportFormat::Csv => self.export_csv(records),
        }
    }

    /// Export to JSON format
    fn export_json(&self, records: &[CaptureRecord]) -> Result<String> {
        let chunks: Vec<ExportedChunk<'_>> = records.iter().map(ExportedChunk::from).collect();
        serde_json::to_string_pretty(&chunks)
            .map_err(|e| TapeError::ExportFailed(format!("JSON serialization error: {}", e)))
    }

    /// Export to CSV format
    fn export_csv(&self, records: &[CaptureRecord]) -> Result<String> {
        let columns: BTreeSet<(String, String)> = records
            .iter()
            .flat_map(|r| {
                r.buffers.iter().flat_map(|(line, entries)| {
                    entries
                        .iter()
                        .filter(|(_, v)| matches!(v, BufferValue::Array(_)))
                        .map(move |(name, _)| (line.name(), name.clone()))
                })
            })
            .collect();

        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = vec!["chapter".to_string(), "chunk".to_string(), "offset".to_string()];
        header.extend(columns.iter().map(|(line, name)| format!("{}.{}", line, name)));
        writer.write_record(&header).map_err(csv_error)?;

        for record in records {
            let chapter = record.chapter.as_deref().unwrap_or_default();
            let windows: Vec<Option<&[i16]>> = columns
                .iter()
                .map(|(line, name)| {
                    LineId::parse(line).and_then(|line| record.window(line, name))
                })
                .collect();

            for offset in 0..record.samples {
                let mut row = vec![chapter.to_string(), record.index.to_string(), offset.to_string()];
                row.extend(windows.iter().map(|w| {
                    w.and_then(|w| w.get(offset))
                        .map(i16::to_string)
                        .unwrap_or_default()
                }));
                writer.write_record(&row).map_err(csv_error)?;
            }
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| TapeError::ExportFailed(format!("CSV flush error: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| TapeError::ExportFailed(format!("CSV encoding error: {}", e)))
    }
}

fn csv_error(e: csv::Error) -> TapeError {
    TapeError::ExportFailed(format!("CSV write error: {}", e))
}

/// One chunk as exported: metadata plus valid windows
#[derive(Serialize)]
struct ExportedChunk<'a> {
    chapter: Option<&'a str>,
    index: u64,
    timestamp: Option<DateTime<Utc>>,
    interval: u32,
    units: TimeUnits,
    samples: usize,
    trigger_at: Option<usize>,
    is_final: bool,
    lines: BTreeMap<String, BTreeMap<&'a str, ExportedValue<'a>>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ExportedValue<'a> {
    Samples(&'a [i16]),
    Scalar(&'a Scalar),
}

impl<'a> From<&'a CaptureRecord> for ExportedChunk<'a> {
    fn from(record: &'a CaptureRecord) -> Self {
        let window = record.start..record.start + record.samples;
        let lines = record
            .buffers
            .iter()
            .map(|(line, entries)| {
                let entries = entries
                    .iter()
                    .map(|(name, value)| {
                        let value = match value {
                            BufferValue::Array(a) => {
                                ExportedValue::Samples(a.get(window.clone()).unwrap_or_default())
                            }
                            BufferValue::Scalar(s) => ExportedValue::Scalar(s),
                        };
                        (name.as_str(), value)
                    })
                    .collect();
                (line.name(), entries)
            })
            .collect();

        Self {
            chapter: record.chapter.as_deref(),
            index: record.index,
            timestamp: record.timestamp,
            interval: record.interval,
            units: record.units,
            samples: record.samples,
            trigger_at: record.trigger_at,
            is_final: record.is_final,
            lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<CaptureRecord> {
        let mut first = CaptureRecord::new("run", 4);
        first.set_array(LineId::Channel(0), "raw", vec![9, 1, 2, 9]);
        first.set_scalar(LineId::Channel(0), "overflow", Scalar::Bool(true));
        first.set_window(1, 2);

        let mut second = CaptureRecord::new("run", 4);
        second.index = 1;
        second.set_array(LineId::Channel(0), "raw", vec![3, 0, 0, 0]);
        second.set_array(LineId::Port(0), "raw", vec![7, 0, 0, 0]);
        second.set_window(0, 1);
        second.is_final = true;

        vec![first, second]
    }

    #[test]
    fn test_json_export_trims_windows() {
        let json = Exporter::new(ExportFormat::Json).export(&records()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value[0]["lines"]["channel00"]["raw"], serde_json::json!([1, 2]));
        assert_eq!(value[0]["lines"]["channel00"]["overflow"], serde_json::json!(true));
        assert_eq!(value[1]["is_final"], serde_json::json!(true));
        assert_eq!(value[1]["lines"]["port00"]["raw"], serde_json::json!([7]));
    }

    #[test]
    fn test_csv_export_rows() {
        let csv = Exporter::new(ExportFormat::Csv).export(&records()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "chapter,chunk,offset,channel00.raw,port00.raw",
                "run,0,0,1,",
                "run,0,1,2,",
                "run,1,0,3,7",
            ]
        );
    }

    #[test]
    fn test_format_serde() {
        let format: ExportFormat = serde_json::from_str("\"csv\"").unwrap();
        assert_eq!(format, ExportFormat::Csv);
        assert_eq!(ExportFormat::default().extension(), "json");
    }
}
