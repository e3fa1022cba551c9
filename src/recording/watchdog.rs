// src/recording/watchdog.rs
//! Heartbeat watchdog
//!
//! Both sides of the worker boundary run one watchdog. Each sends a token to
//! its peer every `interval` and expects one back within `patience`. When
//! the peer goes quiet, or its end of the link disappears, the watchdog
//! marks the peer dead, stops sending and drops its cancel sender, which
//! unblocks anything selecting on the matching [`CancelToken`].
//!
//! ```text
//! handle watchdog ── token ──▶ worker watchdog
//!                 ◀── token ──
//! ```

use crate::utils::errors::{Result, TapeError};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Heartbeat token
#[derive(Debug, Clone, Copy)]
pub struct Beat;

/// One side's ends of the heartbeat link
#[derive(Debug)]
pub struct HeartbeatLink {
    tx: Sender<Beat>,
    rx: Receiver<Beat>,
}

/// Create the two crossed ends of a heartbeat link
pub fn heartbeat_link() -> (HeartbeatLink, HeartbeatLink) {
    let (a_tx, b_rx) = bounded(4);
    let (b_tx, a_rx) = bounded(4);
    (
        HeartbeatLink { tx: a_tx, rx: a_rx },
        HeartbeatLink { tx: b_tx, rx: b_rx },
    )
}

/// Receiving side of a watchdog's cancel signal; disconnects on trip
pub type CancelToken = Receiver<()>;

/// Timing of one watchdog side
#[derive(Debug, Clone, Copy)]
pub struct WatchdogTiming {
    pub interval: Duration,
    pub patience: Duration,
}

/// Running watchdog thread
pub struct Watchdog {
    name: &'static str,
    peer_dead: Arc<AtomicBool>,
    cancel: CancelToken,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start a watchdog on `link`
    pub fn start(name: &'static str, link: HeartbeatLink, timing: WatchdogTiming) -> Result<Self> {
        let peer_dead = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (cancel_tx, cancel) = bounded::<()>(1);

        let flag = Arc::clone(&peer_dead);
        let thread = thread::Builder::new()
            .name(format!("{}-watchdog", name))
            .spawn(move || run(name, link, timing, flag, stop_rx, cancel_tx))
            .map_err(|e| {
                TapeError::WorkerSpawnFailed(format!("Failed to start {} watchdog: {}", name, e))
            })?;

        debug!(
            "{} watchdog started (interval {:?}, patience {:?})",
            name, timing.interval, timing.patience
        );

        Ok(Self {
            name,
            peer_dead,
            cancel,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Whether the peer has been declared dead
    pub fn peer_dead(&self) -> bool {
        self.peer_dead.load(Ordering::Acquire)
    }

    /// Receiver that disconnects when this watchdog trips or stops
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop the heartbeat and join the thread; idempotent
    pub fn stop(&mut self) {
        // Dropping the sender wakes the select loop
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("{} watchdog thread panicked", self.name);
            }
            debug!("{} watchdog stopped", self.name);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    name: &'static str,
    link: HeartbeatLink,
    timing: WatchdogTiming,
    peer_dead: Arc<AtomicBool>,
    stop_rx: Receiver<()>,
    cancel_tx: Sender<()>,
) {
    let ticker = tick(timing.interval);
    let mut last_seen = Instant::now();

    let trip = |silent: bool| {
        peer_dead.store(true, Ordering::Release);
        if silent {
            warn!("{} watchdog tripped: no heartbeat for {:?}", name, timing.patience);
        } else {
            // Also the normal path when the peer shuts down first
            debug!("{} watchdog: peer link closed", name);
        }
    };

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(link.rx) -> beat => match beat {
                Ok(Beat) => {
                    trace!("{} watchdog: beat", name);
                    last_seen = Instant::now();
                }
                Err(_) => {
                    trip(false);
                    break;
                }
            },
            recv(ticker) -> _ => {
                if last_seen.elapsed() > timing.patience {
                    trip(true);
                    break;
                }
                match link.tx.try_send(Beat) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => {
                        trip(false);
                        break;
                    }
                }
            }
        }
    }

    // Receivers of the cancel token observe a disconnect from here on
    drop(cancel_tx);
    drop(link);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(interval_ms: u64, patience_ms: u64) -> WatchdogTiming {
        WatchdogTiming {
            interval: Duration::from_millis(interval_ms),
            patience: Duration::from_millis(patience_ms),
        }
    }

    #[test]
    fn test_peers_keep_each_other_alive() {
        let (a, b) = heartbeat_link();
        let mut left = Watchdog::start("left", a, timing(10, 100)).unwrap();
        let mut right = Watchdog::start("right", b, timing(10, 100)).unwrap();

        thread::sleep(Duration::from_millis(300));
        assert!(!left.peer_dead());
        assert!(!right.peer_dead());

        left.stop();
        right.stop();
    }

    #[test]
    fn test_silent_peer_trips() {
        let (a, b) = heartbeat_link();
        let dog = Watchdog::start("lonely", a, timing(10, 50)).unwrap();
        let cancel = dog.cancel_token();

        // Peer end alive but never answering
        let started = Instant::now();
        assert!(cancel.recv_timeout(Duration::from_secs(2)).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(dog.peer_dead());
        drop(b);
    }

    #[test]
    fn test_dropped_peer_trips() {
        let (a, b) = heartbeat_link();
        let dog = Watchdog::start("orphan", a, timing(10, 1000)).unwrap();
        drop(b);

        let _ = dog.cancel_token().recv_timeout(Duration::from_millis(500));
        assert!(dog.peer_dead());
    }

    #[test]
    fn test_stop_is_not_a_trip() {
        let (a, _b) = heartbeat_link();
        let mut dog = Watchdog::start("quiet", a, timing(10, 1000)).unwrap();
        dog.stop();
        dog.stop();
        assert!(!dog.peer_dead());
    }
}
