//! Periodic, self-exclusive maintenance cycles

use crate::error::{panic_message, root_cause, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Default interval between cycles
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Future returned by [`Maintainable::run_cycle`]
pub type CycleFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Work performed on every maintenance tick
pub trait Maintainable: Send + Sync + 'static {
    /// Run one cycle
    fn run_cycle(&self) -> CycleFuture<'_>;
}

/// What happened on a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A cycle ran to completion
    Completed,
    /// The previous cycle was still running
    Skipped,
    /// The cycle returned an error or panicked; carries the root cause
    Failed(String),
}

/// Cycle counters
#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    /// Cycles that completed
    pub completed: u64,
    /// Ticks skipped because a cycle was running
    pub skipped: u64,
    /// Cycles that failed or panicked
    pub failed: u64,
}

/// Runs a [`Maintainable`] at a fixed interval, never two cycles at once
///
/// A tick that arrives while a cycle is still running is skipped, not queued.
#[derive(Clone)]
pub struct MaintenanceScheduler {
    target: Arc<dyn Maintainable>,
    guard: Arc<Mutex<()>>,
    interval: Duration,
    counters: Arc<Counters>,
}

impl MaintenanceScheduler {
    /// Scheduler for `target` ticking every `interval`
    pub fn new(target: Arc<dyn Maintainable>, interval: Duration) -> Self {
        Self {
            target,
            guard: Arc::new(Mutex::new(())),
            interval,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Tick interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Counter snapshot
    pub fn stats(&self) -> MaintenanceStats {
        MaintenanceStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Run one cycle now, or skip if one is in progress
    pub async fn tick(&self) -> TickOutcome {
        match self.try_begin() {
            Some(guard) => self.run_guarded(guard).await,
            None => TickOutcome::Skipped,
        }
    }

    fn try_begin(&self) -> Option<OwnedMutexGuard<()>> {
        match Arc::clone(&self.guard).try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                warn!("Maintenance cycle still running, skipping tick");
                None
            },
        }
    }

    async fn run_guarded(&self, guard: OwnedMutexGuard<()>) -> TickOutcome {
        let target = Arc::clone(&self.target);
        // a separate task so a panicking cycle surfaces as a JoinError
        let cycle = tokio::spawn(async move { target.run_cycle().await });

        let outcome = match cycle.await {
            Ok(Ok(())) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!("Maintenance cycle completed");
                TickOutcome::Completed
            },
            Ok(Err(e)) => {
                let cause = root_cause(&e).to_string();
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(cause = %cause, "Maintenance cycle failed");
                TickOutcome::Failed(cause)
            },
            Err(join_error) => {
                let cause = match join_error.try_into_panic() {
                    Ok(panic) => panic_message(panic.as_ref()).to_string(),
                    Err(e) => e.to_string(),
                };
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(cause = %cause, "Maintenance cycle panicked");
                TickOutcome::Failed(cause)
            },
        };

        drop(guard);
        outcome
    }

    /// Start ticking in the background
    ///
    /// The first tick fires immediately. Each cycle runs in its own task so
    /// the loop keeps ticking (and skipping) while a slow cycle runs.
    pub fn start(self) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        if let Some(guard) = self.try_begin() {
                            let scheduler = self.clone();
                            tokio::spawn(async move {
                                scheduler.run_guarded(guard).await;
                            });
                        }
                    },
                }
            }
            debug!("Maintenance loop stopped");
        });

        MaintenanceHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("interval", &self.interval)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Controls a running maintenance loop
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) aborts the loop.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop the loop and wait for it to exit
    ///
    /// A cycle already in flight finishes on its own.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance loop ended abnormally");
            }
        }
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
