// Background job scheduling
// Recurring jobs run on the Tokio runtime and are cancelled through their handle

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Future produced by one run of a job
pub type JobFuture = BoxFuture<'static, ()>;

/// Job body, invoked once per run
pub type JobFn = Box<dyn Fn() -> JobFuture + Send + Sync>;

/// Handle to a scheduled job; dropping it cancels the job
pub struct JobHandle {
    name: String,
    handle: JoinHandle<()>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.handle.abort();
        debug!(job = %self.name, "Cancelled background job");
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Scheduler of recurring background jobs
pub trait JobScheduler: Send + Sync {
    /// Run `job` every `interval`; runs never overlap and a late run delays the next one
    fn schedule_recurring(&self, name: &str, interval: Duration, job: JobFn) -> JobHandle;

    /// Run `job` repeatedly, waiting `delay` after each run completes
    fn schedule_with_fixed_delay(&self, name: &str, delay: Duration, job: JobFn) -> JobHandle;
}

/// Scheduler spawning jobs on the current Tokio runtime
///
/// Must be used from within a Tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioJobScheduler;

impl JobScheduler for TokioJobScheduler {
    fn schedule_recurring(&self, name: &str, interval: Duration, job: JobFn) -> JobHandle {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                job().await;
            }
        });

        debug!(job = %name, ?interval, "Scheduled recurring job");

        JobHandle {
            name: name.to_string(),
            handle,
        }
    }

    fn schedule_with_fixed_delay(&self, name: &str, delay: Duration, job: JobFn) -> JobHandle {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                job().await;
            }
        });

        debug!(job = %name, ?delay, "Scheduled fixed-delay job");

        JobHandle {
            name: name.to_string(),
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    fn counting_job(counter: Arc<AtomicUsize>) -> JobFn {
        Box::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_job_runs_every_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = TokioJobScheduler.schedule_recurring(
            "counter",
            Duration::from_millis(100),
            counting_job(counter.clone()),
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(handle.name(), "counter");

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_job_and_drop_cancels() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = TokioJobScheduler.schedule_with_fixed_delay(
            "delayed",
            Duration::from_millis(100),
            counting_job(counter.clone()),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
