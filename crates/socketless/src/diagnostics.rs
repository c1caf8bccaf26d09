//! Hang diagnostics for the worker.
//!
//! Async tasks have no inspectable call stack, so the worker keeps an
//! [`ActivityRegistry`]: every in-flight request and every long-lived task records
//! what it is doing and since when. The watchdog and the SIGUSR2 handler dump that
//! registry to stderr. Neither touches the work being reported on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;

/// Delay after which a still-running request gets reported.
pub const DEFAULT_WATCHDOG_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Serving loop waiting for the next line.
    ReadingInput,
    /// Serving loop handling a message.
    Dispatching,
    /// Request received, checks running.
    Received,
    /// Awaiting an async application.
    AwaitingApplication,
    /// Blocking application running on the pool.
    OffloadedToPool,
    /// Application returned; building the reply.
    Encoding,
    /// Signal listener parked.
    ListeningForSignals,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadingInput => "reading_input",
            Self::Dispatching => "dispatching",
            Self::Received => "received",
            Self::AwaitingApplication => "awaiting_application",
            Self::OffloadedToPool => "offloaded_to_pool",
            Self::Encoding => "encoding",
            Self::ListeningForSignals => "listening_for_signals",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Activity {
    pub label: String,
    pub phase: Phase,
    pub started: Instant,
}

/// Concurrent map of everything the worker is currently doing.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    entries: Arc<DashMap<u64, Activity>>,
    next_id: Arc<AtomicU64>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new activity. It is removed when the guard drops.
    pub fn begin(&self, label: impl Into<String>, phase: Phase) -> ActivityGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.insert(
            id,
            Activity {
                label: label.into(),
                phase,
                started: Instant::now(),
            },
        );
        ActivityGuard {
            id,
            registry: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<Activity> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    /// All activities ordered by id (oldest first).
    pub fn snapshot(&self) -> Vec<(u64, Activity)> {
        let mut all: Vec<(u64, Activity)> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// One line per activity, `focus` first when given.
    pub fn render(&self, focus: Option<u64>) -> Vec<String> {
        let mut all = self.snapshot();
        if let Some(focus) = focus {
            all.sort_by_key(|(id, _)| (*id != focus, *id));
        }
        all.into_iter()
            .map(|(id, activity)| {
                let marker = if Some(id) == focus { " <- stalled" } else { "" };
                format!(
                    "#{id} {} phase={} elapsed={:.3}s{marker}",
                    activity.label,
                    activity.phase.as_str(),
                    activity.started.elapsed().as_secs_f64(),
                )
            })
            .collect()
    }

    fn set_phase(&self, id: u64, phase: Phase) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.phase = phase;
        }
    }
}

pub struct ActivityGuard {
    id: u64,
    registry: ActivityRegistry,
}

impl ActivityGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_phase(&self, phase: Phase) {
        self.registry.set_phase(self.id, phase);
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.registry.entries.remove(&self.id);
    }
}

/// Write the registry to stderr through tracing, one event per line.
pub fn dump_activities(registry: &ActivityRegistry, reason: &str, focus: Option<u64>) {
    let lines = registry.render(focus);
    let alive_tasks = tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks())
        .ok();
    tracing::warn!(
        target: "socketless::diagnostics",
        activities = lines.len(),
        ?alive_tasks,
        "{reason}; dumping activity"
    );
    for line in lines {
        tracing::warn!(target: "socketless::diagnostics", "  {line}");
    }
}

/// Deferred, observational timer. Fires `on_fire` once after `after` unless dropped
/// first. Dropping always disarms it.
pub struct Watchdog {
    task: JoinHandle<()>,
}

impl Watchdog {
    pub fn arm<F>(after: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire();
        });
        Self { task }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Dump every activity whenever the process receives SIGUSR2.
#[cfg(unix)]
pub fn spawn_signal_dump(registry: ActivityRegistry) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut stream = signal(SignalKind::user_defined2())?;
    Ok(tokio::spawn(async move {
        let activity = registry.begin("signal listener (SIGUSR2)", Phase::ListeningForSignals);
        while stream.recv().await.is_some() {
            dump_activities(&registry, "SIGUSR2 received", None);
        }
        drop(activity);
    }))
}
