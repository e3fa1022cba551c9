// src/runtime/isolate.rs
//! Isolated execution unit for the recorder worker
//!
//! The worker runs on its own OS thread. A panic inside it is caught at the
//! thread boundary and reported as an [`IsolateExit::Panicked`] instead of
//! unwinding into the host. Everything the worker owns, including its
//! channel ends, is dropped on the way out, so the handle side observes a
//! disconnect.

use crate::utils::errors::{Result, TapeError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// How an isolate ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolateExit {
    Clean,
    Panicked(String),
}

/// Handle to a running isolate
pub struct Isolate {
    name: String,
    started_at: Instant,
    finished: Arc<AtomicBool>,
    thread: JoinHandle<IsolateExit>,
}

impl Isolate {
    /// Run `body` on a dedicated thread named `name`
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let thread_name = name.to_string();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let exit = match panic::catch_unwind(AssertUnwindSafe(body)) {
                    Ok(()) => IsolateExit::Clean,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!("Isolate '{}' panicked: {}", thread_name, message);
                        IsolateExit::Panicked(message)
                    }
                };
                flag.store(true, Ordering::Release);
                exit
            })
            .map_err(|e| {
                TapeError::WorkerSpawnFailed(format!("Failed to spawn isolate '{}': {}", name, e))
            })?;

        debug!("Isolate '{}' spawned", name);

        Ok(Self {
            name: name.to_string(),
            started_at: Instant::now(),
            finished,
            thread,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Poll until the isolate finishes or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Join the thread
    pub fn join(self) -> IsolateExit {
        let exit = self.thread.join().unwrap_or_else(|payload| {
            IsolateExit::Panicked(panic_message(payload.as_ref()))
        });
        info!(
            "Isolate '{}' finished after {:?}: {:?}",
            self.name,
            self.started_at.elapsed(),
            exit
        );
        exit
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
