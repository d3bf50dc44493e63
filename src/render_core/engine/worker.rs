use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use super::events::progress_event_from;
use super::state::Inner;
use crate::render_core::domain::{JobStatus, ProgressEvent};
use crate::render_core::error::EngineError;
use crate::render_core::pipeline::{PipelineExecutor, ProgressSignal};
use crate::render_core::retry::backoff_delay;
use crate::render_core::supervisor::CancelToken;
use crate::sync_ext::{CondvarExt, MutexExt};

/// Spawn worker threads up to the concurrency ceiling. Exactly this many
/// jobs can execute simultaneously; everything else parks at the pause gate.
pub(crate) fn spawn_workers(inner: &Arc<Inner>) {
    let desired = inner.settings.max_concurrent_jobs.max(1) as usize;
    let start_index = {
        let state = inner.state.lock_unpoisoned();
        state.spawned_workers
    };

    let mut spawned = 0usize;
    for index in start_index..desired {
        let inner_clone = inner.clone();
        let result = thread::Builder::new()
            .name(format!("rendermill-worker-{index}"))
            .spawn(move || worker_loop(&inner_clone));
        if let Err(err) = result {
            error!("failed to spawn render worker thread: {err}");
            break;
        }
        spawned += 1;
    }

    if spawned > 0 {
        let mut state = inner.state.lock_unpoisoned();
        state.spawned_workers = state.spawned_workers.max(start_index + spawned);
    }
}

/// Worker loop: park at the pause gate, take one activation token, run the
/// job, release the slot. Stale tokens (jobs no longer Pending) are dropped
/// silently.
fn worker_loop(inner: &Arc<Inner>) {
    loop {
        let job_id = {
            let mut state = inner.state.lock_unpoisoned();
            loop {
                if state.shutting_down {
                    return;
                }
                if state.queue_running {
                    if let Some(id) = state.queue.pop_front() {
                        state.active_jobs.insert(id.clone());
                        break id;
                    }
                }
                state = inner.cv.wait_unpoisoned(state);
            }
        };

        execute_job(inner, &job_id);

        {
            let mut state = inner.state.lock_unpoisoned();
            state.active_jobs.remove(&job_id);
            state.cancel_handles.remove(&job_id);
        }
        // Wake siblings: a slot freed and the queue may hold more tokens.
        inner.cv.notify_all();
    }
}

fn execute_job(inner: &Arc<Inner>, job_id: &str) {
    let mut job = match inner.store.get(job_id) {
        Ok(job) => job,
        Err(_) => return,
    };
    if job.status != JobStatus::Pending {
        return;
    }

    let cancel = CancelToken::new();
    {
        let mut state = inner.state.lock_unpoisoned();
        if state.shutting_down {
            return;
        }
        state
            .cancel_handles
            .insert(job_id.to_string(), cancel.clone());
    }

    // Claim the attempt: Running, ownership stamps, fresh counters. Progress
    // restarts from zero; a paused job's preserved percentage only describes
    // the abandoned attempt.
    let started_at = Utc::now();
    job.status = JobStatus::Running;
    job.started_at = Some(started_at);
    job.completed_at = None;
    job.owner_pid = Some(inner.pid);
    job.owner_host = Some(inner.host.clone());
    job.progress = 0.0;
    job.current_frame = 0;
    job.stage_label = Some("Preparing pipeline".to_string());
    if let Err(err) = inner.store.update(&job) {
        // Either the store write failed (record stays Pending, durable) or
        // a controller transitioned the job first; both mean this worker
        // does not own the attempt.
        warn!(job = %job_id, "could not claim job: {err}");
        return;
    }
    inner.events.emit_status(progress_event_from(&job, None));
    info!(job = %job_id, "job started");

    let result = catch_unwind(AssertUnwindSafe(|| {
        let executor = PipelineExecutor {
            settings: &inner.settings,
            store: inner.store.as_ref(),
        };
        let inner_for_progress = inner.clone();
        let job_id_owned = job_id.to_string();
        let total_hint = job.total_frames;
        executor.run(&job, &cancel, &mut |signal: ProgressSignal| {
            if let Err(err) =
                inner_for_progress
                    .store
                    .update_progress(&job_id_owned, signal.percent, signal.frame)
            {
                warn!(job = %job_id_owned, "progress persist failed: {err}");
            }
            let elapsed_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
            let estimated_remaining_ms = if signal.percent > 0.5 && signal.percent < 100.0 {
                Some((elapsed_ms as f64 * (100.0 - signal.percent) / signal.percent) as u64)
            } else {
                None
            };
            inner_for_progress.events.emit_progress(
                ProgressEvent {
                    job_id: job_id_owned.clone(),
                    status: JobStatus::Running,
                    progress: signal.percent,
                    current_frame: signal.frame,
                    total_frames: signal.total_frames.or(total_hint),
                    elapsed_ms: Some(elapsed_ms),
                    estimated_remaining_ms,
                    stage_label: Some(signal.stage_label.clone()),
                    error_message: None,
                },
                signal.force,
            );
        })
    }));

    match result {
        Ok(Ok(())) => finalize_success(inner, job_id),
        Ok(Err(err)) if err.is_cancelled() => {
            // Whoever fired the cancel handle (pause, cancel, shutdown)
            // already owns the status; writing here would race it. Jobs
            // still marked Running after a shutdown are crash-recovery input.
            info!(job = %job_id, "attempt ended by cancellation");
        }
        Ok(Err(err)) => handle_failure(inner, job_id, &err),
        Err(payload) => {
            let err = EngineError::Process(format!(
                "pipeline panicked: {}",
                panic_payload_to_string(&*payload)
            ));
            handle_failure(inner, job_id, &err);
        }
    }
}

fn finalize_success(inner: &Arc<Inner>, job_id: &str) {
    let mut job = match inner.store.get(job_id) {
        Ok(job) => job,
        Err(err) => {
            warn!(job = %job_id, "finished job vanished from store: {err}");
            return;
        }
    };
    if job.status != JobStatus::Running {
        // Terminal state already written elsewhere (e.g. cancel racing the
        // final stage); keep it.
        return;
    }

    job.status = JobStatus::Completed;
    job.progress = 100.0;
    job.completed_at = Some(Utc::now());
    job.owner_pid = None;
    job.owner_host = None;
    if job.output_size_bytes.is_none() {
        job.output_size_bytes = std::fs::metadata(&job.output_path).ok().map(|m| m.len());
    }
    job.append_log_line("Completed");
    if let Err(err) = inner.store.update(&job) {
        warn!(job = %job_id, "could not record completion: {err}");
        return;
    }
    inner.events.emit_status(progress_event_from(&job, None));
    inner.events.forget_job(job_id);
    info!(job = %job_id, "job completed");
}

/// Retry-or-dead-letter for any non-cancellation failure. The failed
/// attempt becomes durable immediately; the delayed re-enqueue happens on a
/// detached timer thread so this worker's slot frees for other jobs.
fn handle_failure(inner: &Arc<Inner>, job_id: &str, err: &EngineError) {
    if inner.state.lock_unpoisoned().shutting_down {
        // No records are written past shutdown; the Running row becomes
        // crash-recovery input on the next start.
        return;
    }

    let mut job = match inner.store.get(job_id) {
        Ok(job) => job,
        Err(store_err) => {
            warn!(job = %job_id, "failed job vanished from store: {store_err}");
            return;
        }
    };
    if job.status != JobStatus::Running {
        return;
    }

    // Budget check before incrementing: a job dead-letters once its retry
    // counter has reached the budget, so the counter never exceeds it.
    let budget_exhausted = job.retry_count >= job.max_retries;
    if !budget_exhausted {
        job.retry_count += 1;
    }
    job.last_error = Some(format!("{} error: {err}", err.kind()));
    job.last_error_detail = Some(err.to_string());
    job.status = JobStatus::Failed;
    job.completed_at = Some(Utc::now());
    job.owner_pid = None;
    job.owner_host = None;
    job.append_log_line(format!(
        "Attempt failed ({} of {} retries used): {err}",
        job.retry_count, job.max_retries
    ));
    if let Err(store_err) = inner.store.update(&job) {
        warn!(job = %job_id, "could not record failure: {store_err}");
        return;
    }
    inner.events.emit_status(progress_event_from(
        &job,
        Some(format!("{err} (retry {} of {})", job.retry_count, job.max_retries)),
    ));

    if budget_exhausted {
        job.status = JobStatus::DeadLetter;
        job.append_log_line("Retry budget exhausted; dead-lettered");
        if let Err(store_err) = inner.store.update(&job) {
            warn!(job = %job_id, "could not dead-letter job: {store_err}");
            return;
        }
        inner.events.emit_status(progress_event_from(
            &job,
            Some(format!("{err} (retries exhausted)")),
        ));
        warn!(job = %job_id, retries = job.retry_count, "job dead-lettered");
        return;
    }

    // Back to Pending now so observers see the retry coming; the token
    // arrives after the backoff window.
    job.status = JobStatus::Pending;
    job.completed_at = None;
    job.enqueued_at = Some(Utc::now());
    if let Err(store_err) = inner.store.update(&job) {
        warn!(job = %job_id, "could not requeue failed job: {store_err}");
        return;
    }
    inner.events.emit_status(progress_event_from(
        &job,
        Some(format!("retrying ({} of {})", job.retry_count, job.max_retries)),
    ));

    let delay = backoff_delay(job.retry_count);
    info!(job = %job_id, retry = job.retry_count, ?delay, "scheduling retry");
    let inner_clone = inner.clone();
    let job_id_owned = job_id.to_string();
    thread::spawn(move || {
        thread::sleep(delay);
        // Only still-pending jobs get their token; a cancel during the
        // backoff window wins.
        match inner_clone.store.get(&job_id_owned) {
            Ok(job) if job.status == JobStatus::Pending => {
                let mut state = inner_clone.state.lock_unpoisoned();
                if state.shutting_down {
                    return;
                }
                state.push_token(&job_id_owned);
                drop(state);
                inner_clone.cv.notify_one();
            }
            _ => {}
        }
    });
}

/// Fire every registered cancel handle, stop dequeuing, and wait for
/// in-flight jobs to drain. Jobs that do not drain in time stay `Running`
/// in the store and are reconciled by crash recovery on the next start.
pub(crate) fn shutdown(inner: &Arc<Inner>) {
    let handles: Vec<CancelToken> = {
        let mut state = inner.state.lock_unpoisoned();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        state.cancel_handles.values().cloned().collect()
    };
    inner.cv.notify_all();
    info!(in_flight = handles.len(), "engine shutting down");
    for handle in handles {
        handle.cancel();
    }

    let deadline = Instant::now() + Duration::from_millis(inner.settings.shutdown_grace_ms);
    let mut state = inner.state.lock_unpoisoned();
    while !state.active_jobs.is_empty() {
        let now = Instant::now();
        if now >= deadline {
            warn!(
                remaining = state.active_jobs.len(),
                "shutdown grace expired with jobs still draining; they will be recovered on next start"
            );
            break;
        }
        let (guard, _timeout) = inner.cv.wait_timeout_unpoisoned(state, deadline - now);
        state = guard;
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_render_as_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(&*payload), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_payload_to_string(&*payload), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(17u32);
        assert_eq!(panic_payload_to_string(&*payload), "unknown panic payload");
    }
}
