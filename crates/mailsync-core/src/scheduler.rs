//! Background task scheduling

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Body of a periodic task, called once per tick
pub type PeriodicTask = Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>;

/// Handle to a spawned task; dropping it does not cancel the task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    abort: AbortHandle,
}

impl TaskHandle {
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Runs the engine's background work
pub trait Scheduler: Send + Sync {
    /// Run `task` once in the background
    fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle;

    /// Run `task` after `initial_delay` and then every `period`. A run never
    /// starts before the previous one has finished.
    fn schedule_periodic(
        &self,
        task: PeriodicTask,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskHandle;

    fn cancel(&self, handle: &TaskHandle) {
        handle.cancel();
    }
}

/// [`Scheduler`] on the ambient tokio runtime
#[derive(Debug, Default, Clone)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        TaskHandle::new(tokio::spawn(task).abort_handle())
    }

    fn schedule_periodic(
        &self,
        mut task: PeriodicTask,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskHandle {
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + initial_delay, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                task().await;
            }
        });
        TaskHandle::new(handle.abort_handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_runs_and_cancels() {
        let scheduler = TokioScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = scheduler.schedule_periodic(
            Box::new(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
            Duration::ZERO,
            Duration::from_secs(15),
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        scheduler.cancel(&handle);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_spawn() {
        let scheduler = TokioScheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.spawn(
            async move {
                let _ = tx.send(42);
            }
            .boxed(),
        );
        assert_eq!(rx.await.unwrap(), 42);
    }
}
