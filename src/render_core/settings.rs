use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Explicit binary locations for the external stage tools. When a field is
/// None the tool is resolved from `PATH` by its conventional name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPaths {
    #[serde(default)]
    pub timeline_renderer: Option<String>,
    #[serde(default)]
    pub encoder: Option<String>,
    #[serde(default)]
    pub frame_backend: Option<String>,
}

/// Engine configuration. Every field has a serde default so partially
/// specified JSON configs keep working as new knobs are added.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Concurrency ceiling: at most this many jobs execute simultaneously.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Retry budget applied to jobs that do not specify their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Root under which per-job intermediate artifact directories live.
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    /// Durable job-store file. Defaults to `jobs.json` under the temp root.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub tools: ToolPaths,
    /// Floor between progress events per job; bursts are dropped.
    #[serde(default = "default_progress_event_floor_ms")]
    pub progress_event_floor_ms: u64,
    /// Floor between progress flushes to the store per job.
    #[serde(default = "default_progress_persist_floor_ms")]
    pub progress_persist_floor_ms: u64,
    /// Grace window between the graceful stop and the kill of a heavy tool.
    #[serde(default = "default_heavy_stop_grace_ms")]
    pub heavy_stop_grace_ms: u64,
    /// Grace window for the members of a piped pair.
    #[serde(default = "default_piped_stop_grace_ms")]
    pub piped_stop_grace_ms: u64,
    /// Total drain window for in-flight jobs during shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_preflight_timeout_ms")]
    pub preflight_timeout_ms: u64,
    /// Script validation / model warmup budget. First runs may download
    /// models or JIT-compile, so this is deliberately generous.
    #[serde(default = "default_warmup_timeout_ms")]
    pub warmup_timeout_ms: u64,
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_temp_root() -> PathBuf {
    std::env::temp_dir().join("rendermill")
}

fn default_progress_event_floor_ms() -> u64 {
    100
}

fn default_progress_persist_floor_ms() -> u64 {
    1_000
}

fn default_heavy_stop_grace_ms() -> u64 {
    3_000
}

fn default_piped_stop_grace_ms() -> u64 {
    2_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_preflight_timeout_ms() -> u64 {
    2_000
}

fn default_warmup_timeout_ms() -> u64 {
    600_000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            default_max_retries: default_max_retries(),
            temp_root: default_temp_root(),
            state_path: None,
            tools: ToolPaths::default(),
            progress_event_floor_ms: default_progress_event_floor_ms(),
            progress_persist_floor_ms: default_progress_persist_floor_ms(),
            heavy_stop_grace_ms: default_heavy_stop_grace_ms(),
            piped_stop_grace_ms: default_piped_stop_grace_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            preflight_timeout_ms: default_preflight_timeout_ms(),
            warmup_timeout_ms: default_warmup_timeout_ms(),
        }
    }
}

impl EngineSettings {
    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.temp_root.join("jobs.json"))
    }

    /// Per-job intermediate directory, keyed by job id to prevent collisions.
    pub fn job_temp_dir(&self, job_id: &str) -> PathBuf {
        self.temp_root.join(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = EngineSettings::default();
        assert_eq!(settings.max_concurrent_jobs, 1);
        assert_eq!(settings.default_max_retries, 3);
        assert_eq!(settings.progress_event_floor_ms, 100);
        assert_eq!(settings.progress_persist_floor_ms, 1_000);
        assert_eq!(settings.heavy_stop_grace_ms, 3_000);
        assert_eq!(settings.piped_stop_grace_ms, 2_000);
        assert_eq!(settings.shutdown_grace_ms, 5_000);
    }

    #[test]
    fn partial_json_config_fills_in_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{ "maxConcurrentJobs": 4 }"#).expect("partial config");
        assert_eq!(settings.max_concurrent_jobs, 4);
        assert_eq!(settings.default_max_retries, 3);
    }

    #[test]
    fn job_temp_dir_is_keyed_by_job_id() {
        let settings = EngineSettings::default();
        let dir = settings.job_temp_dir("job-7");
        assert!(dir.ends_with("job-7"));
        assert!(dir.starts_with(&settings.temp_root));
    }
}
