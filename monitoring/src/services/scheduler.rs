//! Named periodic tasks with per-tick error boundaries.
//!
//! Each registered task gets its own tokio task driven by
//! `tokio::time::interval`. A tick is awaited to completion before the next
//! one is scheduled, so one task never overlaps itself; different tasks run
//! independently. Failures and panics inside a tick are logged and the loop
//! carries on.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::errors::MonitoringError;

#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn tick(&self) -> anyhow::Result<()>;
}

/// Result of one guarded tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    Failed(String),
    Panicked,
}

pub struct Scheduler {
    tasks: Vec<Arc<dyn PeriodicTask>>,
    running: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, task: Arc<dyn PeriodicTask>) {
        self.tasks.push(task);
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Spawn every registered task that is not already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock();

        for task in &self.tasks {
            if running.contains_key(task.name()) {
                continue;
            }

            let task = task.clone();
            let name = task.name();
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(task.interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    interval.tick().await;
                    run_guarded(task.as_ref()).await;
                }
            });

            tracing::debug!(task = name, "Periodic task started");
            running.insert(name, handle);
        }
    }

    /// Cancel all running tasks. Registered tasks can be started again.
    pub fn stop(&self) {
        let mut running = self.running.lock();
        for (name, handle) in running.drain() {
            handle.abort();
            tracing::debug!(task = name, "Periodic task stopped");
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running
            .lock()
            .get(name)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Run exactly one tick of the named task, inside the same error
    /// boundary the timer uses.
    pub async fn run_once(&self, name: &str) -> Result<TickOutcome, MonitoringError> {
        let task = self
            .tasks
            .iter()
            .find(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| MonitoringError::UnknownTask(name.to_string()))?;

        Ok(run_guarded(task.as_ref()).await)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, handle) in self.running.get_mut().drain() {
            handle.abort();
        }
    }
}

async fn run_guarded(task: &dyn PeriodicTask) -> TickOutcome {
    let started = Instant::now();

    match AssertUnwindSafe(task.tick()).catch_unwind().await {
        Ok(Ok(())) => {
            tracing::trace!(
                task = task.name(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Periodic task tick completed"
            );
            TickOutcome::Completed
        }
        Ok(Err(e)) => {
            tracing::warn!(task = task.name(), error = %e, "Periodic task tick failed; skipping");
            TickOutcome::Failed(e.to_string())
        }
        Err(_) => {
            tracing::error!(task = task.name(), "Periodic task tick panicked; skipping");
            TickOutcome::Panicked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        ticks: AtomicUsize,
        fail_every_other: bool,
    }

    #[async_trait]
    impl PeriodicTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(30)
        }

        async fn tick(&self) -> anyhow::Result<()> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail_every_other && n % 2 == 0 {
                anyhow::bail!("disk read failed");
            }
            Ok(())
        }
    }

    struct PanickingTask;

    #[async_trait]
    impl PeriodicTask for PanickingTask {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn tick(&self) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_run_once_executes_single_tick() {
        let task = Arc::new(CountingTask {
            ticks: AtomicUsize::new(0),
            fail_every_other: false,
        });
        let mut scheduler = Scheduler::new();
        scheduler.register(task.clone());

        let outcome = scheduler.run_once("counting").await.unwrap();
        assert_eq!(outcome, TickOutcome::Completed);
        assert_eq!(task.ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_is_an_error() {
        let scheduler = Scheduler::new();
        let err = scheduler.run_once("nope").await.unwrap_err();
        assert!(matches!(err, MonitoringError::UnknownTask(ref n) if n == "nope"));
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_contained() {
        let mut scheduler = Scheduler::new();
        scheduler.register(Arc::new(PanickingTask));

        let outcome = scheduler.run_once("panicking").await.unwrap();
        assert_eq!(outcome, TickOutcome::Panicked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_keeps_running_after_failed_tick() {
        let task = Arc::new(CountingTask {
            ticks: AtomicUsize::new(0),
            fail_every_other: true,
        });
        let mut scheduler = Scheduler::new();
        scheduler.register(task.clone());
        scheduler.start();
        assert!(scheduler.is_running("counting"));

        // First tick fires immediately, then one every 30s
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), 4);

        scheduler.stop();
        assert!(!scheduler.is_running("counting"));
    }
}
