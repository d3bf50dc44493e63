use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::events::EventHub;
use crate::render_core::settings::EngineSettings;
use crate::render_core::store::JobStore;
use crate::render_core::supervisor::CancelToken;

/// Mutable scheduler state guarded by `Inner.state`. The store remains the
/// queue of record; `queue` only carries activation tokens.
pub(crate) struct EngineState {
    pub queue: VecDeque<String>,
    /// The pause gate. Deliberately false at startup: rendering begins only
    /// when the operator starts the queue explicitly.
    pub queue_running: bool,
    pub shutting_down: bool,
    pub active_jobs: HashSet<String>,
    /// Per-job cancellation handles, registered while a worker owns the job
    /// and fired by pause, cancel and shutdown.
    pub cancel_handles: HashMap<String, CancelToken>,
    pub spawned_workers: usize,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queue_running: false,
            shutting_down: false,
            active_jobs: HashSet::new(),
            cancel_handles: HashMap::new(),
            spawned_workers: 0,
        }
    }

    /// Push an activation token unless one is already queued for this job.
    pub fn push_token(&mut self, job_id: &str) {
        if !self.queue.iter().any(|id| id == job_id) {
            self.queue.push_back(job_id.to_string());
        }
    }
}

pub(crate) struct Inner {
    pub state: Mutex<EngineState>,
    pub cv: Condvar,
    pub next_job_id: AtomicU64,
    pub settings: EngineSettings,
    pub store: Arc<dyn JobStore>,
    pub events: EventHub,
    pub pid: u32,
    pub host: String,
}

impl Inner {
    pub fn new(settings: EngineSettings, store: Arc<dyn JobStore>) -> Self {
        let event_floor = Duration::from_millis(settings.progress_event_floor_ms);
        Self {
            state: Mutex::new(EngineState::new()),
            cv: Condvar::new(),
            next_job_id: AtomicU64::new(1),
            settings,
            store,
            events: EventHub::new(event_floor),
            pid: std::process::id(),
            host: host_id(),
        }
    }
}

/// Stable identifier for this host, paired with the pid for crash-recovery
/// ownership checks.
fn host_id() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            if end > 0 {
                return String::from_utf8_lossy(&buf[..end]).into_owned();
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
