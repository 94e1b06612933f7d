//! Cancellable periodic loops.
//!
//! Each loop ticks on a tokio interval until cancelled through a watch
//! channel. Missed ticks are skipped rather than bursted, so a slow tick never
//! overlaps the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// A named loop calling `tick` every `period`.
pub struct PeriodicTask {
    name: &'static str,
    active: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn the loop on `handle`. The first tick fires after one period.
    pub fn spawn<F>(
        handle: &tokio::runtime::Handle,
        name: &'static str,
        period: Duration,
        tick: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let period = period.max(Duration::from_millis(1));
        let join = handle.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        trace!(task = name, "periodic tick");
                        tick();
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            flag.store(false, Ordering::Release);
            debug!(task = name, "periodic task stopped");
        });
        Self {
            name,
            active,
            cancel_tx,
            join,
        }
    }

    /// Loop name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Ask the loop to stop after the current tick.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel();
        let _ = self.join.await;
    }
}

/// A group of periodic loops stopped together.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Vec<PeriodicTask>,
}

impl BackgroundTasks {
    /// Empty group.
    #[must_use]
    pub const fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Add a loop.
    pub fn push(&mut self, task: PeriodicTask) {
        self.tasks.push(task);
    }

    /// Names of the loops.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(PeriodicTask::name).collect()
    }

    /// Number of loops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the group is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every loop to stop.
    pub fn cancel(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }

    /// Cancel every loop and wait for all of them.
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task = PeriodicTask::spawn(
            &tokio::runtime::Handle::current(),
            "counter",
            Duration::from_millis(5),
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.is_active());
        task.shutdown().await;
        let after = count.load(Ordering::SeqCst);
        assert!(after >= 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), after);
    }
}
