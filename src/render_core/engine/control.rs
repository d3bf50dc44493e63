use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::events::progress_event_from;
use super::state::Inner;
use crate::render_core::domain::{JobStatus, NewJob, QueueStats, RenderJob, UpscaleVariant};
use crate::render_core::error::EngineError;
use crate::render_core::pipeline::compose_stages;
use crate::sync_ext::MutexExt;

/// Validate and persist a new job as `Pending`, then hand the scheduler an
/// activation token. Nothing is recorded when validation fails.
pub(crate) fn add_job(inner: &Arc<Inner>, new_job: NewJob) -> Result<RenderJob, EngineError> {
    validate_new_job(&new_job)?;

    let id = {
        let next = inner.next_job_id.fetch_add(1, Ordering::SeqCst);
        format!("job-{next}")
    };
    let now = Utc::now();

    let total_frames = match (new_job.in_frame, new_job.out_frame) {
        (Some(start), Some(end)) if end >= start => Some(end - start + 1),
        _ => new_job.total_frames,
    };

    let mut job = RenderJob {
        id: id.clone(),
        source_kind: new_job.source_kind,
        source_path: new_job.source_path,
        output_path: new_job.output_path,
        intermediate1_path: None,
        intermediate2_path: None,
        stage_flags: new_job.stage_flags,
        status: JobStatus::Pending,
        progress: 0.0,
        current_frame: 0,
        total_frames,
        stage_label: None,
        frame_rate: new_job.frame_rate,
        in_frame: new_job.in_frame,
        out_frame: new_job.out_frame,
        track_selection: new_job.track_selection,
        stage_settings: new_job.stage_settings,
        retry_count: 0,
        max_retries: new_job
            .max_retries
            .unwrap_or(inner.settings.default_max_retries),
        last_error: None,
        last_error_detail: None,
        owner_pid: None,
        owner_host: None,
        created_at: now,
        enqueued_at: Some(now),
        started_at: None,
        completed_at: None,
        updated_at: now,
        output_size_bytes: None,
        intermediate1_size_bytes: None,
        intermediate2_size_bytes: None,
        logs: Vec::new(),
        log_tail: None,
    };
    job.append_log_line(format!(
        "Enqueued with stages {:?}",
        compose_stages(&job)
    ));

    inner.store.create(&job)?;

    {
        let mut state = inner.state.lock_unpoisoned();
        state.push_token(&id);
    }
    inner.cv.notify_one();
    inner.events.emit_status(progress_event_from(&job, None));
    info!(job = %id, "job enqueued");
    Ok(job)
}

fn validate_new_job(new_job: &NewJob) -> Result<(), EngineError> {
    if new_job.source_path.trim().is_empty() || new_job.output_path.trim().is_empty() {
        return Err(EngineError::InvalidJob(
            "source and output paths are required".to_string(),
        ));
    }
    if !Path::new(&new_job.source_path).is_absolute()
        || !Path::new(&new_job.output_path).is_absolute()
    {
        return Err(EngineError::InvalidJob(
            "source and output paths must be absolute".to_string(),
        ));
    }
    if !Path::new(&new_job.source_path).exists() {
        return Err(EngineError::InvalidJob(format!(
            "source does not exist: {}",
            new_job.source_path
        )));
    }
    if new_job.stage_flags.upscale && new_job.stage_flags.upscale_variant == UpscaleVariant::None {
        return Err(EngineError::InvalidJob(
            "upscale requested without a variant".to_string(),
        ));
    }
    if let (Some(start), Some(end)) = (new_job.in_frame, new_job.out_frame) {
        if end < start {
            return Err(EngineError::InvalidJob(format!(
                "out frame {end} precedes in frame {start}"
            )));
        }
    }

    let wants_render = new_job.stage_flags.timeline_render
        || new_job.source_kind == crate::render_core::domain::SourceKind::TimelineProject;
    if !wants_render && !new_job.stage_flags.upscale && !new_job.stage_flags.interpolate {
        return Err(EngineError::InvalidJob(
            "job requests no processing stages".to_string(),
        ));
    }
    Ok(())
}

/// Pause a running job: fire its cancel handle so the worker tears the
/// current stage down, then record `Paused`. Progress is preserved.
pub(crate) fn pause_job(inner: &Arc<Inner>, job_id: &str) -> Result<(), EngineError> {
    let job = inner.store.get(job_id)?;
    if job.status != JobStatus::Running {
        return Err(EngineError::WrongStatus { status: job.status });
    }

    {
        let state = inner.state.lock_unpoisoned();
        if let Some(handle) = state.cancel_handles.get(job_id) {
            handle.cancel();
        }
    }

    let mut job = inner.store.get(job_id)?;
    job.status = JobStatus::Paused;
    job.owner_pid = None;
    job.owner_host = None;
    job.append_log_line("Paused by request");
    inner.store.update(&job)?;
    inner.events.emit_status(progress_event_from(&job, None));
    Ok(())
}

/// Return a paused job to the queue. Progress survives the round trip.
pub(crate) fn resume_job(inner: &Arc<Inner>, job_id: &str) -> Result<(), EngineError> {
    let mut job = inner.store.get(job_id)?;
    if job.status != JobStatus::Paused {
        return Err(EngineError::WrongStatus { status: job.status });
    }

    job.status = JobStatus::Pending;
    job.enqueued_at = Some(Utc::now());
    job.append_log_line("Resumed by request");
    inner.store.update(&job)?;

    {
        let mut state = inner.state.lock_unpoisoned();
        state.push_token(job_id);
    }
    inner.cv.notify_one();
    inner.events.emit_status(progress_event_from(&job, None));
    Ok(())
}

/// Cancel from Pending, Running or Paused. Idempotent: cancelling an
/// already-cancelled job is a no-op that leaves the record untouched.
pub(crate) fn cancel_job(inner: &Arc<Inner>, job_id: &str) -> Result<(), EngineError> {
    let job = inner.store.get(job_id)?;
    match job.status {
        JobStatus::Cancelled => return Ok(()),
        JobStatus::Pending | JobStatus::Running | JobStatus::Paused => {}
        status => return Err(EngineError::WrongStatus { status }),
    }

    {
        let mut state = inner.state.lock_unpoisoned();
        // A pending job's token must not activate it later.
        state.queue.retain(|id| id != job_id);
        if let Some(handle) = state.cancel_handles.get(job_id) {
            handle.cancel();
        }
    }

    let mut job = inner.store.get(job_id)?;
    if job.status == JobStatus::Cancelled {
        return Ok(());
    }
    job.status = JobStatus::Cancelled;
    job.completed_at = Some(Utc::now());
    job.owner_pid = None;
    job.owner_host = None;
    job.append_log_line("Cancelled by request");
    inner.store.update(&job)?;

    // Intermediates are job-owned; a cancelled attempt leaves none behind.
    remove_job_scratch(inner, job_id);

    inner.events.emit_status(progress_event_from(&job, None));
    inner.events.forget_job(job_id);
    info!(job = %job_id, "job cancelled");
    Ok(())
}

/// Re-arm a failed or dead-lettered job: retry budget and progress reset,
/// errors cleared, back to `Pending` with a fresh token.
pub(crate) fn retry_job(inner: &Arc<Inner>, job_id: &str) -> Result<(), EngineError> {
    let mut job = inner.store.get(job_id)?;
    if !matches!(job.status, JobStatus::Failed | JobStatus::DeadLetter) {
        return Err(EngineError::WrongStatus { status: job.status });
    }

    job.status = JobStatus::Pending;
    job.retry_count = 0;
    job.progress = 0.0;
    job.current_frame = 0;
    job.stage_label = None;
    job.last_error = None;
    job.last_error_detail = None;
    job.owner_pid = None;
    job.owner_host = None;
    job.started_at = None;
    job.completed_at = None;
    job.enqueued_at = Some(Utc::now());
    job.append_log_line("Retry requested; counters reset");
    inner.store.update(&job)?;

    {
        let mut state = inner.state.lock_unpoisoned();
        state.push_token(job_id);
    }
    inner.cv.notify_one();
    inner.events.emit_status(progress_event_from(&job, None));
    Ok(())
}

/// Remove a terminal job: intermediates first, then the record.
pub(crate) fn delete_job(inner: &Arc<Inner>, job_id: &str) -> Result<(), EngineError> {
    let job = inner.store.get(job_id)?;
    if !job.status.is_terminal() {
        return Err(EngineError::WrongStatus { status: job.status });
    }

    remove_job_scratch(inner, job_id);
    inner.store.delete(job_id)?;
    inner.events.forget_job(job_id);
    info!(job = %job_id, "job deleted");
    Ok(())
}

fn remove_job_scratch(inner: &Arc<Inner>, job_id: &str) {
    let dir = inner.settings.job_temp_dir(job_id);
    if dir.exists() {
        drop(std::fs::remove_dir_all(dir));
    }
}

/// Open the pause gate. Parked workers wake and begin dequeuing.
pub(crate) fn start_queue(inner: &Arc<Inner>) {
    {
        let mut state = inner.state.lock_unpoisoned();
        state.queue_running = true;
    }
    inner.cv.notify_all();
    inner.events.emit_queue(true);
    info!("queue started");
}

/// Close the pause gate. Jobs already running continue; only the next
/// dequeue is held back.
pub(crate) fn stop_queue(inner: &Arc<Inner>) {
    {
        let mut state = inner.state.lock_unpoisoned();
        state.queue_running = false;
    }
    inner.events.emit_queue(false);
    info!("queue stopped");
}

pub(crate) fn stats(inner: &Arc<Inner>) -> QueueStats {
    let mut stats = QueueStats::default();
    for job in inner.store.list_all() {
        match job.status {
            JobStatus::Pending => stats.pending += 1,
            JobStatus::Running => stats.running += 1,
            JobStatus::Paused => stats.paused += 1,
            JobStatus::Completed => stats.completed += 1,
            JobStatus::Failed => stats.failed += 1,
            JobStatus::DeadLetter => stats.dead_letter += 1,
            JobStatus::Cancelled => stats.cancelled += 1,
        }
    }
    stats.is_queue_paused = !inner.state.lock_unpoisoned().queue_running;
    stats
}

pub(crate) fn list_failed(inner: &Arc<Inner>) -> Vec<RenderJob> {
    let mut jobs = inner
        .store
        .list_by_status(&[JobStatus::Failed, JobStatus::DeadLetter]);
    jobs.sort_by(|a, b| {
        let a_at = a.completed_at.unwrap_or(a.updated_at);
        let b_at = b.completed_at.unwrap_or(b.updated_at);
        b_at.cmp(&a_at).then(b.id.cmp(&a.id))
    });
    jobs
}
