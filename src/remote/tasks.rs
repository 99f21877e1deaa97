use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;

/// Owner of fire-and-forget remote mutations.
///
/// Callers never wait on an individual task. Finished tasks are reaped on
/// every spawn; [`BackgroundTasks::shutdown`] waits for the rest so the
/// process exits only after pending mutations had their chance.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        match self.set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs `future` detached. Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        while let Some(result) = set.try_join_next() {
            log_join_error(result);
        }
        set.spawn(future);
    }

    /// Number of tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Waits for every outstanding task.
    pub async fn shutdown(&self) {
        let mut set = std::mem::take(&mut *self.lock());
        let count = set.len();
        if count > 0 {
            tracing::debug!(tasks = count, "Waiting for background remote updates");
        }
        while let Some(result) = set.join_next().await {
            log_join_error(result);
        }
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Background remote update panicked or was cancelled");
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_shutdown_waits_for_all_tasks() {
        let tasks = BackgroundTasks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            tasks.spawn(async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_poison_shutdown() {
        let tasks = BackgroundTasks::new();
        tasks.spawn(async { panic!("boom") });
        tasks.spawn(async {});
        tasks.shutdown().await;
        assert_eq!(tasks.pending(), 0);
    }
}
