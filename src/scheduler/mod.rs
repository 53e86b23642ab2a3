//! Periodic maintenance of the engine: flush checks, compactions, garbage
//! collection and checkpoints all run as [`BackgroundTask`]s on one
//! runtime.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::Result;
use crate::Error;

/// Handed to a task for each run.
pub struct Context {
    pub task_name: &'static str,
    /// Starts at 1 for the first run.
    pub run_id: u64,
    shutdown: watch::Receiver<bool>,
}

impl Context {
    /// Long runs should check this between units of work and stop early.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pause between the end of one run and the start of the next.
    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Run counters of one registered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStats {
    pub name: &'static str,
    pub runs: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    runs: AtomicU64,
    failures: AtomicU64,
}

struct Registered {
    name: &'static str,
    counters: Arc<Counters>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    runtime: Handle,
    tasks: Mutex<Vec<Registered>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(runtime: Handle) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runtime,
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Starts running `task` periodically. The first run happens one
    /// interval after registration. A failed run is logged and the task
    /// keeps its schedule.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let name = task.name();
        let interval = task.interval().max(Duration::from_millis(1));
        tracing::debug!(task = name, interval_ms = interval.as_millis() as u64, "Registering background task");

        let counters = Arc::new(Counters::default());
        let handle = self
            .runtime
            .spawn(run_periodically(task, interval, counters.clone(), self.shutdown.subscribe()));
        self.tasks.lock().push(Registered { name, counters, handle });
        self
    }

    pub fn stats(&self) -> Vec<TaskStats> {
        self.tasks
            .lock()
            .iter()
            .map(|task| TaskStats {
                name: task.name,
                runs: task.counters.runs.load(Ordering::Relaxed),
                failures: task.counters.failures.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Tells every task to stop after its current run, without waiting.
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stops every task and waits until their current runs are over.
    pub async fn shutdown(self) -> Result<()> {
        self.signal_shutdown();
        let tasks: Vec<Registered> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.handle
                .await
                .map_err(|e| Error::InvalidState(format!("Background task {} join error: {}", task.name, e)))?;
        }
        Ok(())
    }
}

async fn run_periodically<T: BackgroundTask>(
    task: Arc<T>,
    interval: Duration,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *shutdown.borrow() {
                    break;
                }
                let run_id = counters.runs.fetch_add(1, Ordering::Relaxed) + 1;
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                    shutdown: shutdown.clone(),
                };
                if let Err(e) = task.execute(ctx).await {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(task = task.name(), run_id, error = %e, "Background task failed");
                }
            }
            // Also fires when the scheduler is dropped.
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!(task = task.name(), "Background task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        interval: Duration,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl Counting {
        fn new(interval: Duration, fail: bool) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let task = Arc::new(Self {
                interval,
                fail,
                calls: calls.clone(),
            });
            (task, calls)
        }
    }

    #[async_trait::async_trait]
    impl BackgroundTask for Counting {
        fn name(&self) -> &'static str {
            if self.fail {
                "failing"
            } else {
                "counting"
            }
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, ctx: Context) -> Result<()> {
            assert!(!ctx.is_shutting_down());
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::InvalidState(format!("run {} failed", ctx.run_id)));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runs_periodically() -> Result<()> {
        let scheduler = Scheduler::new(Handle::current());
        let (task, calls) = Counting::new(Duration::from_millis(10), false);
        scheduler.register(task);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);

        let stats = scheduler.stats();
        assert_eq!(stats[0].name, "counting");
        assert_eq!(stats[0].failures, 0);
        scheduler.shutdown().await
    }

    #[tokio::test]
    async fn test_first_run_waits_one_interval() -> Result<()> {
        let scheduler = Scheduler::new(Handle::current());
        let (task, calls) = Counting::new(Duration::from_secs(60), false);
        scheduler.register(task);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        scheduler.shutdown().await
    }

    #[tokio::test]
    async fn test_failing_task_keeps_its_schedule() -> Result<()> {
        let scheduler = Scheduler::new(Handle::current());
        let (task, calls) = Counting::new(Duration::from_millis(5), true);
        scheduler.register(task);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let stats = scheduler.stats();
        assert!(stats[0].failures >= 2);
        assert_eq!(stats[0].failures as usize, calls.load(Ordering::SeqCst));
        scheduler.shutdown().await
    }

    #[tokio::test]
    async fn test_no_runs_after_shutdown() -> Result<()> {
        let scheduler = Scheduler::new(Handle::current());
        let (task, calls) = Counting::new(Duration::from_millis(10), false);
        scheduler.register(task);
        tokio::time::sleep(Duration::from_millis(25)).await;

        let started = std::time::Instant::now();
        scheduler.shutdown().await?;
        assert!(started.elapsed() < Duration::from_millis(100));

        let after_shutdown = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_shutdown);
        Ok(())
    }
}
