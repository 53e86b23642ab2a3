use std::{sync::Arc, time::Duration};

use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context},
    store::StoreManager,
    wal::WriteAheadLog,
    Error,
};

/// Runs blocking store work off the scheduler's async threads.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::InvalidState(format!("Background task join error: {}", e)))?
}

pub struct FlushTask {
    stores: Arc<StoreManager>,
    interval: Duration,
}

impl FlushTask {
    pub fn new(stores: Arc<StoreManager>, interval: Duration) -> Self {
        Self { stores, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "flush-check"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.stores.flush_if_over_threshold();
        Ok(())
    }
}

pub struct MinorCompactionTask {
    stores: Arc<StoreManager>,
    interval: Duration,
}

impl MinorCompactionTask {
    pub fn new(stores: Arc<StoreManager>, interval: Duration) -> Self {
        Self { stores, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MinorCompactionTask {
    fn name(&self) -> &'static str {
        "minor-compaction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let handles = self.stores.schedule_minor_compactions();
        tracing::debug!(run_id = ctx.run_id, stores = handles.len(), "Minor compactions requested");
        for handle in handles {
            // Failures are logged by the task queue.
            let _ = handle.wait_async().await;
        }
        Ok(())
    }
}

pub struct GarbageCollectionTask {
    stores: Arc<StoreManager>,
    interval: Duration,
}

impl GarbageCollectionTask {
    pub fn new(stores: Arc<StoreManager>, interval: Duration) -> Self {
        Self { stores, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for GarbageCollectionTask {
    fn name(&self) -> &'static str {
        "garbage-collection"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let stores = self.stores.clone();
        blocking(move || Ok(stores.perform_garbage_collection())).await?;
        Ok(())
    }
}

pub struct CheckpointTask {
    stores: Arc<StoreManager>,
    wal: Arc<WriteAheadLog>,
    interval: Duration,
}

impl CheckpointTask {
    pub fn new(stores: Arc<StoreManager>, wal: Arc<WriteAheadLog>, interval: Duration) -> Self {
        Self {
            stores,
            wal,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CheckpointTask {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let stores = self.stores.clone();
        let wal = self.wal.clone();
        blocking(move || stores.checkpoint(&wal)).await?;
        Ok(())
    }
}
