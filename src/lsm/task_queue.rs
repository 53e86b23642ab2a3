//! Per-tree task queues executed on shared worker pools.
//!
//! A [`TaskQueue`] runs at most one task at a time; everything else waits in
//! FIFO order. Requesting a task while a task of the same kind is still
//! waiting attaches the new request to the waiting task instead of queueing
//! a second one.

use crate::error::Result;
use crate::Error;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Flush,
    MinorCompaction,
    MajorCompaction,
}

type Outcome<T> = std::result::Result<T, Arc<Error>>;
type Job<T> = Box<dyn FnOnce() -> Result<T> + Send>;

/// Completion of a scheduled task.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> TaskHandle<T> {
    fn unpack(outcome: std::result::Result<Outcome<T>, oneshot::error::RecvError>) -> Result<T> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Arc::try_unwrap(err).unwrap_or_else(Error::Shared)),
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Blocks until the task finished. Must not be called from async code.
    pub fn wait(self) -> Result<T> {
        Self::unpack(self.rx.blocking_recv())
    }

    pub async fn wait_async(self) -> Result<T> {
        Self::unpack(self.rx.await)
    }
}

struct QueuedTask<T> {
    kind: TaskKind,
    job: Job<T>,
    waiters: Vec<oneshot::Sender<Outcome<T>>>,
}

fn complete<T: Clone>(waiters: Vec<oneshot::Sender<Outcome<T>>>, outcome: Outcome<T>) {
    for waiter in waiters {
        // A dropped handle just means nobody waits for the result.
        let _ = waiter.send(outcome.clone());
    }
}

struct QueueState<T> {
    running: bool,
    waiting: VecDeque<QueuedTask<T>>,
}

pub struct TaskQueue<T> {
    name: String,
    runtime: Handle,
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T: Clone + Send + 'static> TaskQueue<T> {
    pub fn new(name: impl Into<String>, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            runtime,
            state: Arc::new(Mutex::new(QueueState {
                running: false,
                waiting: VecDeque::new(),
            })),
        }
    }

    pub fn schedule<F>(&self, kind: TaskKind, job: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();

        if let Some(waiting) = state.waiting.iter_mut().find(|task| task.kind == kind) {
            tracing::debug!(queue = %self.name, ?kind, "Coalesced with waiting task");
            waiting.waiters.push(tx);
            return TaskHandle { rx };
        }

        state.waiting.push_back(QueuedTask {
            kind,
            job: Box::new(job),
            waiters: vec![tx],
        });
        tracing::debug!(queue = %self.name, ?kind, waiting = state.waiting.len(), "Task scheduled");

        if !state.running {
            state.running = true;
            drop(state);
            self.start_worker();
        }
        TaskHandle { rx }
    }

    fn start_worker(&self) {
        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        self.runtime.spawn_blocking(move || loop {
            let next = {
                let mut state = state.lock();
                match state.waiting.pop_front() {
                    Some(task) => task,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };

            let QueuedTask { kind, job, waiters } = next;
            let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => {
                    tracing::error!(queue = %name, ?kind, error = %err, "Task failed");
                    Err(Arc::new(err))
                }
                Err(_) => {
                    tracing::error!(queue = %name, ?kind, "Task panicked");
                    Err(Arc::new(Error::InvalidState(format!(
                        "{:?} task of {} panicked",
                        kind, name
                    ))))
                }
            };
            complete(waiters, outcome);
        });
    }

    /// Completes every waiting task matching `predicate` with
    /// [`Error::Cancelled`] and returns how many were removed.
    pub fn cancel_waiting_tasks_if(&self, predicate: impl Fn(TaskKind) -> bool) -> usize {
        let cancelled: Vec<QueuedTask<T>> = {
            let mut state = self.state.lock();
            let (cancelled, kept): (Vec<_>, Vec<_>) =
                state.waiting.drain(..).partition(|task| predicate(task.kind));
            state.waiting = kept.into();
            cancelled
        };
        let count = cancelled.len();
        for task in cancelled {
            tracing::warn!(queue = %self.name, kind = ?task.kind, "Waiting task cancelled");
            complete(task.waiters, Err(Arc::new(Error::Cancelled)));
        }
        count
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

/// A dedicated runtime whose blocking threads execute queued tasks.
pub struct WorkerPool {
    name: String,
    runtime: Option<Runtime>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name(format!("stratadb-{}", name))
            .enable_all()
            .build()?;
        Ok(Self {
            name: name.to_string(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> Result<Handle> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.handle().clone())
            .ok_or(Error::Closed)
    }

    /// Waits up to `timeout` for running tasks, then stops the pool.
    pub fn shutdown(&mut self, timeout: Duration) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(timeout);
            tracing::debug!(pool = %self.name, "Worker pool stopped");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_runs_one_task_at_a_time() -> Result<()> {
        let pool = WorkerPool::new("test", 4)?;
        let queue: TaskQueue<usize> = TaskQueue::new("test", pool.handle()?);
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let kinds = [TaskKind::Flush, TaskKind::MinorCompaction, TaskKind::MajorCompaction];
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let running = running.clone();
                let max_running = max_running.clone();
                queue.schedule(kinds[i], move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
            })
            .collect();

        let results: Vec<usize> = handles
            .into_iter()
            .map(|handle| handle.wait())
            .collect::<Result<_>>()?;
        assert_eq!(results, vec![0, 1, 2]);
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_coalesce_and_cancel() -> Result<()> {
        let pool = WorkerPool::new("test", 2)?;
        let queue: TaskQueue<&'static str> = TaskQueue::new("test", pool.handle()?);
        let (release_tx, release_rx) = mpsc::channel::<()>();

        // Occupies the queue until released.
        let blocker = queue.schedule(TaskKind::Flush, move || {
            let _ = release_rx.recv();
            Ok("blocker")
        });
        // Give the worker time to take the blocker off the waiting list.
        while queue.waiting() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let runs = Arc::new(AtomicUsize::new(0));
        let counted = |runs: Arc<AtomicUsize>| {
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok("minor")
            }
        };
        let first = queue.schedule(TaskKind::MinorCompaction, counted(runs.clone()));
        let second = queue.schedule(TaskKind::MinorCompaction, counted(runs.clone()));
        let major = queue.schedule(TaskKind::MajorCompaction, || Ok("major"));
        assert_eq!(queue.waiting(), 2);

        assert_eq!(queue.cancel_waiting_tasks_if(|kind| kind == TaskKind::MajorCompaction), 1);
        assert!(matches!(major.wait(), Err(Error::Cancelled)));

        release_tx.send(()).ok();
        assert_eq!(blocker.wait()?, "blocker");
        assert_eq!(first.wait()?, "minor");
        assert_eq!(second.wait()?, "minor");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_failures_reach_every_waiter() -> Result<()> {
        let pool = WorkerPool::new("test", 1)?;
        let queue: TaskQueue<()> = TaskQueue::new("test", pool.handle()?);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = queue.schedule(TaskKind::Flush, move || {
            let _ = release_rx.recv();
            Ok(())
        });
        while queue.waiting() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let first = queue.schedule(TaskKind::MinorCompaction, || {
            Err(Error::InvalidState("broken".to_string()))
        });
        let second = queue.schedule(TaskKind::MinorCompaction, || Ok(()));
        release_tx.send(()).ok();
        blocker.wait()?;

        // Exactly one waiter can own the original error.
        let errors = [first.wait(), second.wait()];
        assert!(errors.iter().all(|r| r.is_err()));
        assert!(errors
            .iter()
            .any(|r| matches!(r, Err(Error::Shared(_)))));

        let panicking = queue.schedule(TaskKind::Flush, || panic!("boom"));
        assert!(matches!(panicking.wait(), Err(Error::InvalidState(_))));
        assert!(queue.schedule(TaskKind::Flush, || Ok(())).wait().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_async() -> Result<()> {
        let pool = WorkerPool::new("test", 1)?;
        let queue: TaskQueue<u32> = TaskQueue::new("test", pool.handle()?);
        let value = queue.schedule(TaskKind::Flush, || Ok(7)).wait_async().await?;
        assert_eq!(value, 7);
        Ok(())
    }
}
