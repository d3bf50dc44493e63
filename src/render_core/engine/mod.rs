use std::sync::atomic::Ordering;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

use super::domain::{EngineEvent, JobStatus, NewJob, QueueStats, RenderJob};
use super::error::EngineError;
use super::settings::EngineSettings;
use super::store::{JobStore, JsonJobStore};

mod control;
mod events;
mod recovery;
mod state;
mod worker;

use state::Inner;

/// The public operations surface over the render queue: enqueue, lifecycle
/// control, queries and event subscription. Cloning is cheap and every clone
/// drives the same queue.
///
/// The queue starts paused; call [`RenderEngine::start_queue`] to begin
/// dequeuing. Crash recovery runs during construction, before any worker can
/// observe the store.
#[derive(Clone)]
pub struct RenderEngine {
    inner: Arc<Inner>,
}

impl RenderEngine {
    /// Engine with the default file-backed store under the configured paths.
    pub fn new(settings: EngineSettings) -> Result<Self, EngineError> {
        let store = Arc::new(JsonJobStore::open(
            settings.state_path(),
            Duration::from_millis(settings.progress_persist_floor_ms),
        )?);
        let max_id = store.max_numeric_id();
        let engine = Self::with_store(settings, store)?;
        engine
            .inner
            .next_job_id
            .store(max_id + 1, Ordering::SeqCst);
        Ok(engine)
    }

    /// Engine over a caller-provided store implementation.
    pub fn with_store(
        settings: EngineSettings,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&settings.temp_root).map_err(|err| {
            EngineError::Store(format!(
                "create temp root {}: {err}",
                settings.temp_root.display()
            ))
        })?;

        let inner = Arc::new(Inner::new(settings, store));
        let engine = Self { inner };
        recovery::recover_orphans(&engine.inner);
        worker::spawn_workers(&engine.inner);
        Ok(engine)
    }

    /// Create a job record as `Pending` and queue it. The queue must still
    /// be started for execution to begin.
    pub fn add(&self, new_job: NewJob) -> Result<RenderJob, EngineError> {
        control::add_job(&self.inner, new_job)
    }

    pub fn get(&self, job_id: &str) -> Result<RenderJob, EngineError> {
        self.inner.store.get(job_id)
    }

    /// Pending, Running and Paused jobs, oldest first.
    pub fn list_active(&self) -> Vec<RenderJob> {
        self.inner.store.list_active()
    }

    pub fn list_completed(&self) -> Vec<RenderJob> {
        self.inner.store.list_by_status(&[JobStatus::Completed])
    }

    /// Failed and dead-lettered jobs merged, newest first.
    pub fn list_failed(&self) -> Vec<RenderJob> {
        control::list_failed(&self.inner)
    }

    /// Valid only while `Running`: stops the in-flight stage and parks the
    /// job as `Paused` with its progress preserved.
    pub fn pause(&self, job_id: &str) -> Result<(), EngineError> {
        control::pause_job(&self.inner, job_id)
    }

    /// Valid only while `Paused`: back to `Pending` with a fresh token.
    pub fn resume(&self, job_id: &str) -> Result<(), EngineError> {
        control::resume_job(&self.inner, job_id)
    }

    /// Valid from `Pending`, `Running` and `Paused`; idempotent on an
    /// already-cancelled job.
    pub fn cancel(&self, job_id: &str) -> Result<(), EngineError> {
        control::cancel_job(&self.inner, job_id)
    }

    /// Valid from `Failed` and `DeadLetter`: resets the retry budget and
    /// progress, clears errors and re-queues.
    pub fn retry(&self, job_id: &str) -> Result<(), EngineError> {
        control::retry_job(&self.inner, job_id)
    }

    /// Valid only in terminal states. Intermediate artifacts are removed
    /// before the record.
    pub fn delete(&self, job_id: &str) -> Result<(), EngineError> {
        control::delete_job(&self.inner, job_id)
    }

    /// Open the pause gate. Emits a queue-status event.
    pub fn start_queue(&self) {
        control::start_queue(&self.inner);
    }

    /// Close the pause gate. Running jobs continue; only the next dequeue
    /// is held back.
    pub fn stop_queue(&self) {
        control::stop_queue(&self.inner);
    }

    pub fn stats(&self) -> QueueStats {
        control::stats(&self.inner)
    }

    /// Register an inline listener for progress and status events. Listeners
    /// must not block or call back into the engine; events for one job
    /// arrive in emission order. Slow consumers should use
    /// [`RenderEngine::subscribe_channel`] instead.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.inner.events.register(listener);
    }

    /// Register a bounded-channel subscriber. Delivery is best-effort: when
    /// the channel is full the event is dropped rather than blocking the
    /// scheduler.
    pub fn subscribe_channel(&self, tx: SyncSender<EngineEvent>) {
        self.inner.events.register_channel(tx);
    }

    /// Stop dequeuing, fire every per-job cancel handle and wait up to the
    /// configured grace window for in-flight work to drain. Jobs that do not
    /// drain stay `Running` in the store and are reconciled by crash
    /// recovery on the next start.
    pub fn shutdown(&self) {
        worker::shutdown(&self.inner);
    }
}
