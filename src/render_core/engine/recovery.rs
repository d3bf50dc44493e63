use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::events::progress_event_from;
use super::state::Inner;
use crate::render_core::domain::JobStatus;
use crate::render_core::error::EngineError;
use crate::sync_ext::MutexExt;

/// Startup-time reconciliation, run exactly once before the worker loop
/// begins: jobs left `Running` by a dead process either go back to the
/// queue or, when their retry budget is spent, to the dead-letter state.
/// Failures here are logged and non-fatal; an unreconciled job simply stays
/// `Running` until the next start.
pub(crate) fn recover_orphans(inner: &Arc<Inner>) {
    let orphans = inner.store.claim_orphaned(inner.pid, &inner.host);
    if orphans.is_empty() {
        return;
    }
    info!(count = orphans.len(), "reconciling jobs left running by a previous process");

    for mut job in orphans {
        job.owner_pid = None;
        job.owner_host = None;
        job.last_error = Some("recovered after crash".to_string());
        job.last_error_detail = None;

        // Same budget rule as the failure path: the counter caps at the
        // budget and reaching it dead-letters the job.
        if job.retry_count >= job.max_retries {
            job.status = JobStatus::DeadLetter;
            job.completed_at = Some(Utc::now());
            job.append_log_line("Recovered after crash with retry budget exhausted; dead-lettered");
        } else {
            job.retry_count += 1;
            job.status = JobStatus::Pending;
            job.enqueued_at = Some(Utc::now());
            job.append_log_line(format!(
                "Recovered after crash; {} of {} retries used",
                job.retry_count, job.max_retries
            ));
        }

        if let Err(err) = inner.store.update(&job) {
            // Non-fatal: the job stays Running in the store and is picked
            // up again on the next start.
            let err = EngineError::Recovery(format!(
                "could not reconcile {}: {err}",
                job.id
            ));
            warn!(job = %job.id, kind = err.kind(), "{err}");
            continue;
        }

        if job.status == JobStatus::Pending {
            let mut state = inner.state.lock_unpoisoned();
            state.push_token(&job.id);
        }
        inner
            .events
            .emit_status(progress_event_from(&job, job.last_error.clone()));
    }
    inner.cv.notify_all();
}
