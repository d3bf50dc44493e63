use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::domain::{JobStatus, RenderJob};
use super::error::EngineError;
use crate::sync_ext::MutexExt;

/// Durable persistence for job records. The store is the queue of record:
/// the in-memory work channel only carries activation tokens, so anything
/// that must survive a crash lives here.
///
/// Implementations must make every mutating call atomic with respect to
/// readers, and a successful return from `create`/`update` must mean the
/// record survives a process crash. `update_progress` is the hot path and is
/// allowed to coalesce disk writes as long as the record is flushed at least
/// once per second while a job is running.
pub trait JobStore: Send + Sync {
    fn create(&self, job: &RenderJob) -> Result<(), EngineError>;
    fn get(&self, id: &str) -> Result<RenderJob, EngineError>;
    fn list_all(&self) -> Vec<RenderJob>;
    fn list_by_status(&self, statuses: &[JobStatus]) -> Vec<RenderJob>;
    /// Pending, Running and Paused jobs.
    fn list_active(&self) -> Vec<RenderJob>;
    /// Full-record update. Status changes are validated against the
    /// lifecycle graph; an illegal transition fails with `Conflict` and
    /// leaves the record untouched.
    fn update(&self, job: &RenderJob) -> Result<(), EngineError>;
    /// Progress-only hot path: updates percent and current frame.
    fn update_progress(&self, id: &str, percent: f64, frame: u64) -> Result<(), EngineError>;
    /// Removes the record. Only terminal jobs may be deleted.
    fn delete(&self, id: &str) -> Result<(), EngineError>;
    /// Jobs left `Running` by a process other than the caller. Input to
    /// crash recovery; the caller reconciles each returned record.
    fn claim_orphaned(&self, pid: u32, host: &str) -> Vec<RenderJob>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreSnapshot {
    jobs: Vec<RenderJob>,
}

struct StoreState {
    jobs: HashMap<String, RenderJob>,
    /// Per-job timestamp of the last progress flush, used to coalesce the
    /// hot path to one disk write per persist floor.
    last_progress_flush: HashMap<String, Instant>,
}

/// File-backed store: one JSON document holding every record, written with
/// a temp-file-then-rename so readers never observe a torn file. Unknown
/// fields in persisted records are tolerated on load.
pub struct JsonJobStore {
    path: PathBuf,
    progress_persist_floor: Duration,
    state: Mutex<StoreState>,
}

impl JsonJobStore {
    pub fn open(path: PathBuf, progress_persist_floor: Duration) -> Result<Self, EngineError> {
        let jobs = match load_snapshot(&path) {
            Some(snapshot) => snapshot
                .jobs
                .into_iter()
                .map(|job| (job.id.clone(), job))
                .collect(),
            None => HashMap::new(),
        };
        Ok(Self {
            path,
            progress_persist_floor,
            state: Mutex::new(StoreState {
                jobs,
                last_progress_flush: HashMap::new(),
            }),
        })
    }

    /// Highest numeric suffix among `job-N` ids, used to reseed the id
    /// counter after a restart.
    pub fn max_numeric_id(&self) -> u64 {
        let state = self.state.lock_unpoisoned();
        state
            .jobs
            .keys()
            .filter_map(|id| id.strip_prefix("job-"))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
    }

    fn flush_locked(&self, state: &StoreState) -> Result<(), EngineError> {
        let mut jobs: Vec<RenderJob> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        write_snapshot(&self.path, &StoreSnapshot { jobs })
    }
}

fn load_snapshot(path: &PathBuf) -> Option<StoreSnapshot> {
    if !path.exists() {
        return None;
    }
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(err) => {
            warn!(path = %path.display(), "failed to open persisted job store: {err:#}");
            return None;
        }
    };
    match serde_json::from_reader::<_, StoreSnapshot>(BufReader::new(file)) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(path = %path.display(), "failed to parse persisted job store: {err:#}");
            None
        }
    }
}

fn write_snapshot(path: &PathBuf, snapshot: &StoreSnapshot) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| EngineError::Store(format!("create {}: {err}", parent.display())))?;
    }

    let tmp_path = path.with_extension("tmp");
    let file = fs::File::create(&tmp_path)
        .map_err(|err| EngineError::Store(format!("create {}: {err}", tmp_path.display())))?;
    if let Err(err) = serde_json::to_writer(&file, snapshot) {
        let _ = fs::remove_file(&tmp_path);
        return Err(EngineError::Store(format!(
            "write {}: {err}",
            tmp_path.display()
        )));
    }
    drop(file);
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(EngineError::Store(format!(
            "rename {} -> {}: {err}",
            tmp_path.display(),
            path.display()
        )));
    }
    Ok(())
}

impl JobStore for JsonJobStore {
    fn create(&self, job: &RenderJob) -> Result<(), EngineError> {
        let mut state = self.state.lock_unpoisoned();
        if state.jobs.contains_key(&job.id) {
            return Err(EngineError::Conflict {
                from: state.jobs[&job.id].status,
                to: job.status,
            });
        }
        state.jobs.insert(job.id.clone(), job.clone());
        if let Err(err) = self.flush_locked(&state) {
            state.jobs.remove(&job.id);
            return Err(err);
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<RenderJob, EngineError> {
        let state = self.state.lock_unpoisoned();
        state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn list_all(&self) -> Vec<RenderJob> {
        let state = self.state.lock_unpoisoned();
        let mut jobs: Vec<RenderJob> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    fn list_by_status(&self, statuses: &[JobStatus]) -> Vec<RenderJob> {
        self.list_all()
            .into_iter()
            .filter(|job| statuses.contains(&job.status))
            .collect()
    }

    fn list_active(&self) -> Vec<RenderJob> {
        self.list_by_status(&[JobStatus::Pending, JobStatus::Running, JobStatus::Paused])
    }

    fn update(&self, job: &RenderJob) -> Result<(), EngineError> {
        let mut state = self.state.lock_unpoisoned();
        let previous = state
            .jobs
            .get(&job.id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(job.id.clone()))?;

        if previous.status != job.status && !previous.status.can_transition_to(job.status) {
            return Err(EngineError::Conflict {
                from: previous.status,
                to: job.status,
            });
        }

        let mut updated = job.clone();
        updated.updated_at = Utc::now();
        state.jobs.insert(job.id.clone(), updated);
        if let Err(err) = self.flush_locked(&state) {
            state.jobs.insert(previous.id.clone(), previous);
            return Err(err);
        }
        Ok(())
    }

    fn update_progress(&self, id: &str, percent: f64, frame: u64) -> Result<(), EngineError> {
        let mut state = self.state.lock_unpoisoned();
        let Some(job) = state.jobs.get_mut(id) else {
            return Err(EngineError::NotFound(id.to_string()));
        };
        job.progress = percent.clamp(0.0, 100.0);
        job.current_frame = frame;
        job.updated_at = Utc::now();

        let due = state
            .last_progress_flush
            .get(id)
            .is_none_or(|last| last.elapsed() >= self.progress_persist_floor);
        if due {
            state.last_progress_flush.insert(id.to_string(), Instant::now());
            self.flush_locked(&state)?;
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock_unpoisoned();
        let Some(job) = state.jobs.get(id) else {
            return Err(EngineError::NotFound(id.to_string()));
        };
        if !job.status.is_terminal() {
            return Err(EngineError::WrongStatus { status: job.status });
        }
        let removed = state.jobs.remove(id);
        state.last_progress_flush.remove(id);
        if let Err(err) = self.flush_locked(&state) {
            if let Some(job) = removed {
                state.jobs.insert(id.to_string(), job);
            }
            return Err(err);
        }
        Ok(())
    }

    fn claim_orphaned(&self, pid: u32, host: &str) -> Vec<RenderJob> {
        let state = self.state.lock_unpoisoned();
        let mut orphans: Vec<RenderJob> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Running
                    && (job.owner_pid != Some(pid) || job.owner_host.as_deref() != Some(host))
            })
            .cloned()
            .collect();
        orphans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        orphans
    }
}
