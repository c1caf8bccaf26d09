//! Background drain of the worker's stderr.
//!
//! The worker writes diagnostics (tracing output, panics, watchdog dumps) to stderr.
//! If nobody reads that pipe it fills up and the worker blocks mid-write, which looks
//! exactly like a hang. The drain reads continuously, keeps the most recent lines for
//! error messages, and re-emits every line as a tracing event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Lines retained for failure context.
pub const STDERR_RING_CAPACITY: usize = 50;

/// Fixed-capacity FIFO of the most recent diagnostic lines.
///
/// Cloning shares the same buffer. A supervisor keeps one ring for its whole
/// lifetime, so lines from a crashed worker are still visible after a restart.
#[derive(Clone)]
pub struct StderrRing {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for StderrRing {
    fn default() -> Self {
        Self::new(STDERR_RING_CAPACITY)
    }
}

impl StderrRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lines.iter().cloned().collect()
    }

    /// Retained lines joined with `\n`, oldest first.
    pub fn tail(&self) -> String {
        self.snapshot().join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Task reading one worker's stderr into a [`StderrRing`].
pub struct StderrDrain {
    task: JoinHandle<()>,
}

impl StderrDrain {
    /// Start draining. Must be called from within a tokio runtime.
    pub fn spawn<R>(stderr: R, ring: StderrRing) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::with_capacity(256);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        // Lossy: a worker printing garbage must not stop the drain.
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']);
                        tracing::debug!(target: "socketless::worker", "{}", line);
                        ring.push(line);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Worker stderr read failed");
                        break;
                    }
                }
            }
            tracing::trace!("Stderr drain exiting");
        });
        Self { task }
    }

    /// Wait up to `timeout` for the worker to close its stderr.
    ///
    /// Used after the worker died so its final lines land in the ring before the
    /// tail is read.
    pub async fn settle(&mut self, timeout: Duration) {
        if self.task.is_finished() {
            return;
        }
        let _ = tokio::time::timeout(timeout, &mut self.task).await;
    }

    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
