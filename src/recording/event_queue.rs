// src/recording/event_queue.rs
//! Bounded write queue between the producer and the recorder worker
//!
//! A crossbeam bounded channel carries [`WriteItem`]s. Both ends share a set
//! of counters so either side can report backlog and drops without asking
//! the other.

use crate::recording::protocol::WriteItem;
use crate::utils::errors::{Result, TapeError};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    push_count: AtomicU64,
    pop_count: AtomicU64,
    drop_count: AtomicU64,
}

/// Create a write queue holding at most `capacity` items
pub fn write_queue(capacity: usize) -> (QueueWriter, QueueReader) {
    let (tx, rx) = bounded(capacity.max(1));
    let counters = Arc::new(Counters::default());
    (
        QueueWriter {
            tx,
            counters: Arc::clone(&counters),
        },
        QueueReader { rx, counters },
    )
}

/// Producer end
#[derive(Debug, Clone)]
pub struct QueueWriter {
    tx: Sender<WriteItem>,
    counters: Arc<Counters>,
}

impl QueueWriter {
    /// Push an item, blocking up to `timeout` while the queue is full
    ///
    /// A full queue past the timeout drops the item and yields `Busy`; a
    /// queue whose reader is gone yields `Cancelled`.
    pub fn push(&self, item: WriteItem, timeout: Duration) -> Result<()> {
        match self.tx.send_timeout(item, timeout) {
            Ok(()) => {
                self.counters.push_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.counters.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(TapeError::Busy(format!(
                    "write queue full ({} items)",
                    self.tx.len()
                )))
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(TapeError::Cancelled),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats::collect(&self.counters, self.tx.len(), self.tx.capacity())
    }
}

/// Worker end
#[derive(Debug)]
pub struct QueueReader {
    rx: Receiver<WriteItem>,
    counters: Arc<Counters>,
}

impl QueueReader {
    /// Pop an item without blocking; `Err(Cancelled)` once every writer is gone
    /// and the backlog is drained
    pub fn try_pop(&self) -> Result<Option<WriteItem>> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.counters.pop_count.fetch_add(1, Ordering::Relaxed);
                Ok(Some(item))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TapeError::Cancelled),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats::collect(&self.counters, self.rx.len(), self.rx.capacity())
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Items accepted
    pub push_count: u64,

    /// Items taken by the worker
    pub pop_count: u64,

    /// Items rejected because the queue stayed full
    pub drop_count: u64,

    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    fn collect(counters: &Counters, current_size: usize, capacity: Option<usize>) -> Self {
        Self {
            push_count: counters.push_count.load(Ordering::Relaxed),
            pop_count: counters.pop_count.load(Ordering::Relaxed),
            drop_count: counters.drop_count.load(Ordering::Relaxed),
            current_size,
            capacity: capacity.unwrap_or(0),
        }
    }

    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }

    /// Calculate drop rate
    pub fn drop_rate(&self) -> f64 {
        let offered = self.push_count + self.drop_count;
        if offered == 0 {
            0.0
        } else {
            (self.drop_count as f64 / offered as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::record::CaptureRecord;

    const SHORT: Duration = Duration::from_millis(10);

    fn item(chapter: &str) -> WriteItem {
        WriteItem::Record(Box::new(CaptureRecord::new(chapter, 4)))
    }

    #[test]
    fn test_push_pop() {
        let (writer, reader) = write_queue(10);
        writer.push(item("A"), SHORT).unwrap();
        assert_eq!(writer.len(), 1);

        match reader.try_pop().unwrap() {
            Some(WriteItem::Record(rec)) => assert_eq!(rec.chapter.as_deref(), Some("A")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(reader.try_pop().unwrap().is_none());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_full_queue_is_busy() {
        let (writer, _reader) = write_queue(2);
        writer.push(item("A"), SHORT).unwrap();
        writer.push(WriteItem::EndOfStream, SHORT).unwrap();

        let err = writer.push(item("A"), SHORT).unwrap_err();
        assert!(matches!(err, TapeError::Busy(_)));

        let stats = writer.stats();
        assert_eq!(stats.push_count, 2);
        assert_eq!(stats.drop_count, 1);
        assert_eq!(stats.capacity, 2);
        assert!((stats.fill_percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_dropped_reader_cancels() {
        let (writer, reader) = write_queue(2);
        drop(reader);
        assert_eq!(writer.push(item("A"), SHORT).unwrap_err(), TapeError::Cancelled);
    }

    #[test]
    fn test_dropped_writer_drains_then_cancels() {
        let (writer, reader) = write_queue(2);
        writer.push(item("A"), SHORT).unwrap();
        drop(writer);
        assert!(reader.try_pop().unwrap().is_some());
        assert_eq!(reader.try_pop().unwrap_err(), TapeError::Cancelled);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::thread;

        let (writer, reader) = write_queue(1000);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let w = writer.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        w.push(WriteItem::EndOfStream, SHORT).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = reader.stats();
        assert_eq!(stats.push_count, 1000);
        assert_eq!(stats.current_size, 1000);
        assert_eq!(stats.drop_rate(), 0.0);
    }
}
