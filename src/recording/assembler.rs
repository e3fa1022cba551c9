// src/recording/assembler.rs
//! Producer-side window assembly
//!
//! A streaming driver reports data in windows of arbitrary size. The
//! assembler tops partial windows up into full-capacity records so the
//! tape receives `bufflen`-sample chunks, carrying any overflow into the
//! next record.

use crate::recording::record::CaptureRecord;
use crate::utils::errors::Result;
use tracing::trace;

/// Accumulates driver windows into full records
#[derive(Debug, Default)]
pub struct WindowAssembler {
    pending: Option<CaptureRecord>,
}

impl WindowAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples held back waiting for more data
    pub fn pending_samples(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.samples)
    }

    /// Add one driver window; returns the records that became full
    ///
    /// The window is copied; the caller may overwrite it right away. A
    /// malformed window is rejected and the pending record left untouched.
    pub fn push(&mut self, window: &CaptureRecord) -> Result<Vec<CaptureRecord>> {
        let mut ready = Vec::new();

        match self.pending.take() {
            Some(mut pending) => {
                let left = match pending.top_up(window) {
                    Ok(left) => left,
                    Err(e) => {
                        self.pending = Some(pending);
                        return Err(e);
                    }
                };
                if pending.is_full() {
                    ready.push(pending);
                    self.pending = left;
                } else {
                    self.pending = Some(pending);
                }
            }
            None if window.is_full() => ready.push(window.side_copy()?),
            None => self.pending = Some(window.side_copy()?),
        }

        // A leftover can fill a whole record on its own
        if self.pending.as_ref().is_some_and(CaptureRecord::is_full) {
            if let Some(full) = self.pending.take() {
                ready.push(full);
            }
        }

        trace!(
            "Window of {} samples: {} records ready, {} pending",
            window.samples,
            ready.len(),
            self.pending_samples()
        );
        Ok(ready)
    }

    /// Take the partial record left at the end of a stream, marked final
    pub fn finish(&mut self) -> Option<CaptureRecord> {
        self.pending
            .take()
            .filter(|p| p.samples > 0)
            .map(|mut p| {
                p.is_final = true;
                p
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::record::LineId;

    const RAW: LineId = LineId::Channel(0);

    fn window(data: &[i16], start: usize) -> CaptureRecord {
        let mut rec = CaptureRecord::new("S", 4);
        let mut raw = vec![0; 4];
        raw[start..start + data.len()].copy_from_slice(data);
        rec.set_array(RAW, "raw", raw);
        rec.set_window(start, data.len());
        rec
    }

    fn flat(records: &[CaptureRecord]) -> Vec<i16> {
        records
            .iter()
            .flat_map(|r| r.window(RAW, "raw").unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_full_window_passes_through() {
        let mut asm = WindowAssembler::new();
        let ready = asm.push(&window(&[1, 2, 3, 4], 0)).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(asm.pending_samples(), 0);
        assert!(asm.finish().is_none());
    }

    #[test]
    fn test_partial_windows_assemble() {
        let mut asm = WindowAssembler::new();
        let mut out = Vec::new();
        out.extend(asm.push(&window(&[1, 2, 3], 1)).unwrap());
        assert!(out.is_empty());
        out.extend(asm.push(&window(&[4, 5, 6], 0)).unwrap());
        out.extend(asm.push(&window(&[7, 8, 9], 1)).unwrap());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(CaptureRecord::is_full));
        assert_eq!(asm.pending_samples(), 1);

        let last = asm.finish().unwrap();
        assert!(last.is_final);
        out.push(last);
        assert_eq!(flat(&out), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_malformed_window_keeps_pending() {
        let mut asm = WindowAssembler::new();
        asm.push(&window(&[1, 2], 0)).unwrap();

        let mut bad = window(&[3], 0);
        bad.set_window(3, 2);
        assert!(asm.push(&bad).is_err());
        assert_eq!(asm.pending_samples(), 2);
    }

    #[test]
    fn test_trigger_rebased_into_record() {
        let mut asm = WindowAssembler::new();
        let mut first = window(&[1, 2], 0);
        first.trigger_set = true;
        let mut second = window(&[3, 4, 5], 0);
        second.trigger_set = true;
        second.trigger_at = Some(1);

        asm.push(&first).unwrap();
        let ready = asm.push(&second).unwrap();
        assert_eq!(ready[0].trigger_at, Some(3));
    }
}
