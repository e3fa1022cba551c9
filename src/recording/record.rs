// src/recording/record.rs
//! Capture record: one window of samples plus its stream metadata
//!
//! A record owns fixed-capacity arrays (`bufflen` entries each). Only the
//! window `[start, start + samples)` is valid; everything else is scratch
//! space the producer is about to overwrite.

use crate::utils::errors::{Result, TapeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Acquisition line: an analog channel or a digital port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LineId {
    Channel(u8),
    Port(u8),
}

impl LineId {
    /// Persisted group name (`channel00`, `port01`, ...)
    pub fn name(&self) -> String {
        match self {
            LineId::Channel(n) => format!("channel{:02}", n),
            LineId::Port(n) => format!("port{:02}", n),
        }
    }

    /// Parse a persisted group name
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(n) = name.strip_prefix("channel") {
            n.parse().ok().map(LineId::Channel)
        } else if let Some(n) = name.strip_prefix("port") {
            n.parse().ok().map(LineId::Port)
        } else {
            None
        }
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

// Serialized as the group name so lines can key JSON objects.
impl Serialize for LineId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for LineId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        LineId::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid line name '{}'", name)))
    }
}

/// Scalar line attribute (range, overflow flag, scale, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Named entry under a line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BufferValue {
    Array(Vec<i16>),
    Scalar(Scalar),
}

impl BufferValue {
    pub fn as_array(&self) -> Option<&[i16]> {
        match self {
            BufferValue::Array(a) => Some(a),
            BufferValue::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            BufferValue::Array(_) => None,
            BufferValue::Scalar(s) => Some(s),
        }
    }
}

/// Sample interval units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnits {
    Fs,
    Ps,
    #[default]
    Ns,
    Us,
    Ms,
    S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDirection {
    Above,
    Below,
    Rising,
    Falling,
    RisingOrFalling,
}

/// Simple trigger condition armed for a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSetup {
    pub source: LineId,
    pub threshold: i16,
    pub direction: TriggerDirection,
}

/// One capture window plus its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Session tag; `None` inherits the worker's current write chapter
    pub chapter: Option<String>,

    /// Chunk index within the chapter, assigned by the worker
    pub index: u64,

    // Stream-level parameters, stored as chapter header on chunk 0
    pub interval: u32,
    pub units: TimeUnits,
    pub mode: u32,
    pub downsample: u32,
    pub device: String,
    pub serial: String,
    pub trigger_setup: Option<TriggerSetup>,

    /// Trigger armed for this stream
    pub trigger_set: bool,

    /// Trigger position relative to `start`, if it fired in this window
    pub trigger_at: Option<usize>,

    /// Last chunk of an auto-stopped session
    pub is_final: bool,

    pub buffers: BTreeMap<LineId, BTreeMap<String, BufferValue>>,

    pub bufflen: usize,
    pub samples: usize,
    pub start: usize,

    pub timestamp: Option<DateTime<Utc>>,
}

impl CaptureRecord {
    /// Create an empty window of capacity `bufflen`
    pub fn new(chapter: impl Into<String>, bufflen: usize) -> Self {
        Self {
            chapter: Some(chapter.into()),
            index: 0,
            interval: 0,
            units: TimeUnits::default(),
            mode: 0,
            downsample: 1,
            device: String::new(),
            serial: String::new(),
            trigger_setup: None,
            trigger_set: false,
            trigger_at: None,
            is_final: false,
            buffers: BTreeMap::new(),
            bufflen,
            samples: 0,
            start: 0,
            timestamp: None,
        }
    }

    /// Allocate a zeroed `bufflen` array under `line`
    pub fn add_array(&mut self, line: LineId, name: &str) {
        self.set_array(line, name, vec![0; self.bufflen]);
    }

    pub fn set_array(&mut self, line: LineId, name: &str, data: Vec<i16>) {
        self.buffers
            .entry(line)
            .or_default()
            .insert(name.to_string(), BufferValue::Array(data));
    }

    pub fn set_scalar(&mut self, line: LineId, name: &str, value: Scalar) {
        self.buffers
            .entry(line)
            .or_default()
            .insert(name.to_string(), BufferValue::Scalar(value));
    }

    /// Full backing array, including the invalid region
    pub fn array(&self, line: LineId, name: &str) -> Option<&[i16]> {
        self.buffers.get(&line)?.get(name)?.as_array()
    }

    /// Valid window `[start, start + samples)` of an array
    pub fn window(&self, line: LineId, name: &str) -> Option<&[i16]> {
        let a = self.array(line, name)?;
        a.get(self.start..self.start.checked_add(self.samples)?)
    }

    pub fn scalar(&self, line: LineId, name: &str) -> Option<&Scalar> {
        self.buffers.get(&line)?.get(name)?.as_scalar()
    }

    /// Set the valid window, as the driver does after each acquisition tick
    pub fn set_window(&mut self, start: usize, samples: usize) {
        self.start = start;
        self.samples = samples;
    }

    pub fn triggered(&self) -> bool {
        self.trigger_at.is_some()
    }

    pub fn is_full(&self) -> bool {
        self.samples == self.bufflen
    }

    /// Bytes of valid sample data held by this record
    pub fn payload_bytes(&self) -> u64 {
        let arrays = self
            .buffers
            .values()
            .flat_map(|arrays| arrays.values())
            .filter(|v| matches!(v, BufferValue::Array(_)))
            .count();
        (arrays * self.samples * std::mem::size_of::<i16>()) as u64
    }

    /// Check that every array holds the declared window and capacity
    pub fn validate(&self) -> Result<()> {
        if self.samples > self.bufflen {
            return Err(TapeError::MalformedRecord(format!(
                "{} samples exceed capacity {}",
                self.samples, self.bufflen
            )));
        }
        let end = self.start.checked_add(self.samples).ok_or_else(|| {
            TapeError::MalformedRecord(format!(
                "window {}+{} overflows",
                self.start, self.samples
            ))
        })?;
        for (line, arrays) in &self.buffers {
            for (name, value) in arrays {
                if let BufferValue::Array(a) = value {
                    if a.len() < self.bufflen || end > a.len() {
                        return Err(TapeError::MalformedRecord(format!(
                            "{}/{} holds {} entries, window is {}..{} of {}",
                            line,
                            name,
                            a.len(),
                            self.start,
                            end,
                            self.bufflen
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy of everything but the buffers
    fn header_copy(&self) -> Self {
        Self {
            chapter: self.chapter.clone(),
            index: self.index,
            interval: self.interval,
            units: self.units,
            mode: self.mode,
            downsample: self.downsample,
            device: self.device.clone(),
            serial: self.serial.clone(),
            trigger_setup: self.trigger_setup.clone(),
            trigger_set: self.trigger_set,
            trigger_at: self.trigger_at,
            is_final: self.is_final,
            buffers: BTreeMap::new(),
            bufflen: self.bufflen,
            samples: self.samples,
            start: self.start,
            timestamp: self.timestamp,
        }
    }

    /// Independent duplicate with the valid window rebased to offset 0
    pub fn side_copy(&self) -> Result<Self> {
        self.validate()?;

        let window = self.start..self.start + self.samples;
        let mut clone = self.header_copy();
        clone.start = 0;
        clone.buffers = self
            .buffers
            .iter()
            .map(|(line, arrays)| {
                let arrays = arrays
                    .iter()
                    .map(|(name, value)| {
                        let value = match value {
                            BufferValue::Array(a) => {
                                let mut out = vec![0; self.bufflen];
                                out[..self.samples].copy_from_slice(&a[window.clone()]);
                                BufferValue::Array(out)
                            }
                            BufferValue::Scalar(s) => BufferValue::Scalar(s.clone()),
                        };
                        (name.clone(), value)
                    })
                    .collect();
                (*line, arrays)
            })
            .collect();

        Ok(clone)
    }

    /// Shift the valid window to offset 0 in place
    fn compact(&mut self) {
        let window = self.start..self.start + self.samples;
        for arrays in self.buffers.values_mut() {
            for value in arrays.values_mut() {
                if let BufferValue::Array(a) = value {
                    a.copy_within(window.clone(), 0);
                }
            }
        }
        self.start = 0;
    }

    /// Append `incoming`'s valid samples after this record's window
    ///
    /// Returns the part of `incoming` that did not fit, if any. A full
    /// record absorbs nothing and hands `incoming` back unchanged.
    pub fn top_up(&mut self, incoming: &CaptureRecord) -> Result<Option<CaptureRecord>> {
        self.validate()?;
        incoming.validate()?;

        if self.is_full() {
            return Ok(Some(incoming.clone()));
        }
        if self.start != 0 {
            self.compact();
        }

        let filled = self.samples;
        let room = self.bufflen - filled;
        let copied = incoming.samples.min(room);

        let mut leftover = if incoming.samples > room {
            let mut left = incoming.side_copy()?;
            left.start = copied;
            left.samples = incoming.samples - copied;
            left.trigger_at = None;
            Some(left)
        } else {
            None
        };

        if incoming.trigger_set {
            if let Some(t) = incoming.trigger_at {
                if t < copied {
                    if self.trigger_set && !self.triggered() {
                        self.trigger_at = Some(filled + t);
                    }
                } else if let Some(left) = leftover.as_mut() {
                    left.trigger_at = Some(t - copied);
                }
            }
        }

        let src_window = incoming.start..incoming.start + copied;
        for (line, arrays) in self.buffers.iter_mut() {
            let Some(src) = incoming.buffers.get(line) else {
                continue;
            };
            for (name, value) in arrays.iter_mut() {
                match (value, src.get(name)) {
                    (BufferValue::Array(dst), Some(BufferValue::Array(s))) => {
                        dst[filled..filled + copied].copy_from_slice(&s[src_window.clone()]);
                    }
                    (
                        BufferValue::Scalar(Scalar::Bool(flag)),
                        Some(BufferValue::Scalar(Scalar::Bool(other))),
                    ) => *flag |= *other,
                    (BufferValue::Scalar(s), Some(BufferValue::Scalar(other))) => {
                        *s = other.clone();
                    }
                    _ => {}
                }
            }
        }

        self.samples = filled + copied;
        if incoming.timestamp.is_some() {
            self.timestamp = incoming.timestamp;
        }

        Ok(leftover)
    }
}
