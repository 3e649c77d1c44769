//! Tracked background tasks.
//!
//! Reapers and in-process workers finish their command records after the
//! call that started them has returned. Their handles are kept here so a
//! process can wait for every pending finalize before it exits.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::task::{JoinError, JoinSet};

/// A set of detached tasks that can be drained with [`BackgroundTasks::join_all`].
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns `task` on the current runtime and tracks it.
    ///
    /// Tasks that already finished are collected first, so a long-lived
    /// owner does not accumulate completed handles.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        while let Some(result) = set.try_join_next() {
            log_join_error(result);
        }
        set.spawn(task);
    }

    /// Number of tasks not yet collected.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no task is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for every tracked task, including ones spawned while waiting.
    pub async fn join_all(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.lock());
            if set.is_empty() {
                return;
            }
            tracing::debug!(pending = set.len(), "waiting for background tasks");
            while let Some(result) = set.join_next().await {
                log_join_error(result);
            }
        }
    }
}

fn log_join_error(result: Result<(), JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "background task panicked or was cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn join_all_waits_for_slow_tasks() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for delay in [30, 10, 20] {
            let done = Arc::clone(&done);
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(tasks.len(), 3);

        tasks.join_all().await;

        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn spawn_collects_finished_tasks() {
        let tasks = BackgroundTasks::new();
        tasks.spawn(async {});
        tokio::time::sleep(Duration::from_millis(10)).await;

        tasks.spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        assert_eq!(tasks.len(), 1);
        tasks.join_all().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_join() {
        let tasks = BackgroundTasks::new();
        tasks.spawn(async { panic!("reaper blew up") });
        tasks.spawn(async {});

        tasks.join_all().await;

        assert!(tasks.is_empty());
    }
}
