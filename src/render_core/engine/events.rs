use std::collections::HashMap;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use crate::render_core::domain::{EngineEvent, ProgressEvent, QueueStateEvent, RenderJob};
use crate::sync_ext::MutexExt;

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync + 'static>;

/// Fan-out point for progress and status events. Listeners are called
/// inline and must not block; slow consumers should subscribe through a
/// bounded channel, where delivery degrades to send-or-drop instead of
/// stalling the scheduler.
pub(crate) struct EventHub {
    event_floor: Duration,
    listeners: Mutex<Vec<Listener>>,
    /// Per-job timestamp of the last delivered progress event.
    last_progress_emit: Mutex<HashMap<String, Instant>>,
    /// Held across a fan-out so every subscriber observes one job's events
    /// in the same order they were emitted.
    fan_out: Mutex<()>,
}

impl EventHub {
    pub fn new(event_floor: Duration) -> Self {
        Self {
            event_floor,
            listeners: Mutex::new(Vec::new()),
            last_progress_emit: Mutex::new(HashMap::new()),
            fan_out: Mutex::new(()),
        }
    }

    pub fn register<F>(&self, listener: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.listeners.lock_unpoisoned().push(Arc::new(listener));
    }

    /// Channel subscription with best-effort delivery: a full buffer drops
    /// the event rather than blocking the emitter.
    pub fn register_channel(&self, tx: SyncSender<EngineEvent>) {
        self.register(move |event| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        });
    }

    /// Progress tick. Bursts inside the per-job floor are dropped, not
    /// queued; `force` marks stage boundaries and bypasses the floor.
    pub fn emit_progress(&self, event: ProgressEvent, force: bool) {
        if !force {
            let mut last = self.last_progress_emit.lock_unpoisoned();
            match last.get(&event.job_id) {
                Some(at) if at.elapsed() < self.event_floor => return,
                _ => {
                    last.insert(event.job_id.clone(), Instant::now());
                }
            }
        } else {
            self.last_progress_emit
                .lock_unpoisoned()
                .insert(event.job_id.clone(), Instant::now());
        }
        self.fan(EngineEvent::Job(event));
    }

    /// Status changes are never throttled.
    pub fn emit_status(&self, event: ProgressEvent) {
        debug!(job = %event.job_id, status = ?event.status, "status change");
        self.fan(EngineEvent::Job(event));
    }

    pub fn emit_queue(&self, running: bool) {
        self.fan(EngineEvent::Queue(QueueStateEvent { running }));
    }

    pub fn forget_job(&self, job_id: &str) {
        self.last_progress_emit.lock_unpoisoned().remove(job_id);
    }

    fn fan(&self, event: EngineEvent) {
        let listeners = self.listeners.lock_unpoisoned().clone();
        let _ordered = self.fan_out.lock_unpoisoned();
        for listener in &listeners {
            listener(&event);
        }
    }
}

/// Snapshot a job into the immutable event shape, deriving elapsed and
/// estimated-remaining from the running attempt's start time.
pub(crate) fn progress_event_from(job: &RenderJob, error_message: Option<String>) -> ProgressEvent {
    let elapsed_ms = job.started_at.map(|started| {
        (Utc::now() - started).num_milliseconds().max(0) as u64
    });
    let estimated_remaining_ms = match (elapsed_ms, job.progress) {
        (Some(elapsed), percent) if percent > 0.5 && percent < 100.0 => {
            Some((elapsed as f64 * (100.0 - percent) / percent) as u64)
        }
        _ => None,
    };

    ProgressEvent {
        job_id: job.id.clone(),
        status: job.status,
        progress: job.progress,
        current_frame: job.current_frame,
        total_frames: job.total_frames,
        elapsed_ms,
        estimated_remaining_ms,
        stage_label: job.stage_label.clone(),
        error_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_core::domain::JobStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(job_id: &str) -> ProgressEvent {
        ProgressEvent {
            job_id: job_id.to_string(),
            status: JobStatus::Running,
            progress: 10.0,
            current_frame: 3,
            total_frames: None,
            elapsed_ms: None,
            estimated_remaining_ms: None,
            stage_label: None,
            error_message: None,
        }
    }

    #[test]
    fn progress_bursts_inside_the_floor_are_dropped() {
        let hub = EventHub::new(Duration::from_secs(60));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        hub.register(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..50 {
            hub.emit_progress(event("job-1"), false);
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forced_progress_bypasses_the_floor() {
        let hub = EventHub::new(Duration::from_secs(60));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        hub.register(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit_progress(event("job-1"), false);
        hub.emit_progress(event("job-1"), true);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn throttling_is_per_job_not_global() {
        let hub = EventHub::new(Duration::from_secs(60));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        hub.register(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit_progress(event("job-1"), false);
        hub.emit_progress(event("job-2"), false);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn slow_channel_subscribers_drop_events_instead_of_blocking() {
        let hub = EventHub::new(Duration::from_millis(0));
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        hub.register_channel(tx);

        hub.emit_status(event("job-1"));
        hub.emit_status(event("job-1"));
        hub.emit_status(event("job-1"));

        // Exactly one event fit in the buffer; the rest were dropped and the
        // emitter never stalled.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remaining_estimate_extrapolates_from_elapsed() {
        use chrono::Utc;
        let mut job = crate::render_core::domain::RenderJob {
            id: "job-1".to_string(),
            source_kind: crate::render_core::domain::SourceKind::VideoFile,
            source_path: String::new(),
            output_path: String::new(),
            intermediate1_path: None,
            intermediate2_path: None,
            stage_flags: Default::default(),
            status: JobStatus::Running,
            progress: 50.0,
            current_frame: 0,
            total_frames: None,
            stage_label: None,
            frame_rate: 30.0,
            in_frame: None,
            out_frame: None,
            track_selection: None,
            stage_settings: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            last_error_detail: None,
            owner_pid: None,
            owner_host: None,
            created_at: Utc::now(),
            enqueued_at: None,
            started_at: Some(Utc::now() - chrono::Duration::seconds(10)),
            completed_at: None,
            updated_at: Utc::now(),
            output_size_bytes: None,
            intermediate1_size_bytes: None,
            intermediate2_size_bytes: None,
            logs: Vec::new(),
            log_tail: None,
        };
        let event = progress_event_from(&job, None);
        let elapsed = event.elapsed_ms.unwrap();
        assert!(elapsed >= 9_000);
        let remaining = event.estimated_remaining_ms.unwrap();
        // At 50% the remaining estimate is close to the elapsed time.
        assert!(remaining >= elapsed / 2 && remaining <= elapsed * 2);

        job.progress = 0.0;
        let event = progress_event_from(&job, None);
        assert!(event.estimated_remaining_ms.is_none());
    }
}
