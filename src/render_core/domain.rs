use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    TimelineProject,
    VideoFile,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UpscaleVariant {
    None,
    AiAnime,
    AiPhoto,
    Classic,
}

impl Default for UpscaleVariant {
    fn default() -> Self {
        UpscaleVariant::None
    }
}

/// Which heavy processing stages a job requests. `timeline_render` is implied
/// when the source is a timeline project regardless of the stored flag.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StageFlags {
    #[serde(default)]
    pub timeline_render: bool,
    #[serde(default)]
    pub upscale: bool,
    #[serde(default)]
    pub interpolate: bool,
    #[serde(default)]
    pub upscale_variant: UpscaleVariant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    #[serde(rename = "deadletter")]
    DeadLetter,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::DeadLetter | JobStatus::Cancelled
        )
    }

    /// Legality of a status transition. The `Running -> Pending` and
    /// `Running -> DeadLetter` edges exist only for crash recovery, which
    /// reconciles records left behind by a dead process before any worker
    /// observes them.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Running, DeadLetter)
                | (Paused, Pending)
                | (Paused, Cancelled)
                | (Failed, Pending)
                | (Failed, DeadLetter)
                | (DeadLetter, Pending)
        )
    }
}

/// Caller-supplied description of a job to enqueue. Everything else on the
/// durable record is stamped by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub source_kind: SourceKind,
    pub source_path: String,
    pub output_path: String,
    #[serde(default)]
    pub stage_flags: StageFlags,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    #[serde(default)]
    pub in_frame: Option<u64>,
    #[serde(default)]
    pub out_frame: Option<u64>,
    #[serde(default)]
    pub total_frames: Option<u64>,
    /// Opaque description of which source tracks to include; interpreted by
    /// the timeline-render stage only.
    #[serde(default)]
    pub track_selection: Option<String>,
    /// Opaque structured payload handed to the stage runners.
    #[serde(default)]
    pub stage_settings: Option<serde_json::Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_frame_rate() -> f64 {
    30.0
}

/// The canonical durable job record. Serialized camelCase; unknown fields in
/// persisted JSON are tolerated so older engines can read newer records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    pub id: String,
    pub source_kind: SourceKind,
    pub source_path: String,
    pub output_path: String,
    #[serde(default)]
    pub intermediate1_path: Option<String>,
    #[serde(default)]
    pub intermediate2_path: Option<String>,
    pub stage_flags: StageFlags,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(default)]
    pub current_frame: u64,
    #[serde(default)]
    pub total_frames: Option<u64>,
    #[serde(default)]
    pub stage_label: Option<String>,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    #[serde(default)]
    pub in_frame: Option<u64>,
    #[serde(default)]
    pub out_frame: Option<u64>,
    #[serde(default)]
    pub track_selection: Option<String>,
    #[serde(default)]
    pub stage_settings: Option<serde_json::Value>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_detail: Option<String>,
    /// Set only while a worker owns this job; crash recovery keys off these.
    #[serde(default)]
    pub owner_pid: Option<u32>,
    #[serde(default)]
    pub owner_host: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub output_size_bytes: Option<u64>,
    #[serde(default)]
    pub intermediate1_size_bytes: Option<u64>,
    #[serde(default)]
    pub intermediate2_size_bytes: Option<u64>,
    /// Rolling window of recent log lines for this job, bounded so long runs
    /// do not grow without limit.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Bounded textual tail of the log window, suitable for display without
    /// re-joining the full vector.
    #[serde(default)]
    pub log_tail: Option<String>,
}

// Keep only a small rolling window of logs to avoid unbounded growth.
const MAX_LOG_LINES: usize = 200;
const MAX_LOG_TAIL_BYTES: usize = 16 * 1024;

impl RenderJob {
    /// Whether the timeline-render stage applies, honoring the implication
    /// from the source kind.
    pub fn wants_timeline_render(&self) -> bool {
        self.stage_flags.timeline_render || self.source_kind == SourceKind::TimelineProject
    }

    pub fn append_log_line(&mut self, line: impl Into<String>) {
        let line = line.into();
        if line.trim().is_empty() {
            return;
        }
        if self.logs.len() >= MAX_LOG_LINES {
            let excess = self.logs.len() + 1 - MAX_LOG_LINES;
            self.logs.drain(0..excess);
        }
        self.logs.push(line);
        self.recompute_log_tail();
    }

    fn recompute_log_tail(&mut self) {
        if self.logs.is_empty() {
            self.log_tail = None;
            return;
        }
        let joined = self.logs.join("\n");
        if joined.len() > MAX_LOG_TAIL_BYTES {
            let mut start = joined.len() - MAX_LOG_TAIL_BYTES;
            while !joined.is_char_boundary(start) {
                start += 1;
            }
            self.log_tail = Some(joined[start..].to_string());
        } else {
            self.log_tail = Some(joined);
        }
    }
}

/// Immutable snapshot describing one moment of a job's execution, fanned out
/// to subscribers for both progress ticks and status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub current_frame: u64,
    #[serde(default)]
    pub total_frames: Option<u64>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
    #[serde(default)]
    pub estimated_remaining_ms: Option<u64>,
    #[serde(default)]
    pub stage_label: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStateEvent {
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum EngineEvent {
    Job(ProgressEvent),
    Queue(QueueStateEvent),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub cancelled: usize,
    pub is_queue_paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn sample_job() -> RenderJob {
        RenderJob {
            id: "job-1".to_string(),
            source_kind: SourceKind::VideoFile,
            source_path: "/videos/input.mp4".to_string(),
            output_path: "/videos/output.mp4".to_string(),
            intermediate1_path: None,
            intermediate2_path: None,
            stage_flags: StageFlags {
                timeline_render: false,
                upscale: true,
                interpolate: false,
                upscale_variant: UpscaleVariant::Classic,
            },
            status: JobStatus::Pending,
            progress: 0.0,
            current_frame: 0,
            total_frames: Some(300),
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
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
            output_size_bytes: None,
            intermediate1_size_bytes: None,
            intermediate2_size_bytes: None,
            logs: Vec::new(),
            log_tail: None,
        }
    }

    #[test]
    fn render_job_uses_stable_camel_case_field_names() {
        let value = serde_json::to_value(sample_job()).expect("serialize RenderJob");
        assert_eq!(
            value.get("sourceKind").and_then(Value::as_str).unwrap(),
            "videoFile"
        );
        assert_eq!(
            value.get("sourcePath").and_then(Value::as_str).unwrap(),
            "/videos/input.mp4"
        );
        assert_eq!(value.get("status").and_then(Value::as_str).unwrap(), "pending");
        assert_eq!(
            value.get("maxRetries").and_then(Value::as_u64).unwrap(),
            3u64
        );
        let flags = value
            .get("stageFlags")
            .and_then(Value::as_object)
            .expect("stageFlags object");
        assert_eq!(
            flags.get("upscaleVariant").and_then(Value::as_str).unwrap(),
            "classic"
        );
    }

    #[test]
    fn render_job_tolerates_unknown_and_missing_optional_fields() {
        let legacy_json = json!({
            "id": "job-9",
            "sourceKind": "timelineProject",
            "sourcePath": "/projects/cut.mlt",
            "outputPath": "/videos/final.mp4",
            "stageFlags": { "timelineRender": true },
            "status": "pending",
            "progress": 0.0,
            "maxRetries": 3,
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z",
            "someFutureField": { "nested": true },
        });
        let decoded: RenderJob =
            serde_json::from_value(legacy_json).expect("deserialize forward-compatible RenderJob");
        assert_eq!(decoded.retry_count, 0);
        assert!(decoded.wants_timeline_render());
        assert_eq!(decoded.frame_rate, 30.0);
    }

    #[test]
    fn dead_letter_status_uses_single_word_rename() {
        let value = serde_json::to_value(JobStatus::DeadLetter).unwrap();
        assert_eq!(value, json!("deadletter"));
        let decoded: JobStatus = serde_json::from_value(json!("deadletter")).unwrap();
        assert_eq!(decoded, JobStatus::DeadLetter);
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(DeadLetter));
        assert!(DeadLetter.can_transition_to(Pending));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Running));
    }

    #[test]
    fn log_window_stays_bounded() {
        let mut job = sample_job();
        for i in 0..500 {
            job.append_log_line(format!("line {i}"));
        }
        assert_eq!(job.logs.len(), 200);
        assert_eq!(job.logs.first().unwrap(), "line 300");
        assert!(job.log_tail.as_ref().unwrap().ends_with("line 499"));
    }

    #[test]
    fn blank_log_lines_are_ignored() {
        let mut job = sample_job();
        job.append_log_line("   ");
        job.append_log_line("");
        assert!(job.logs.is_empty());
        assert!(job.log_tail.is_none());
    }
}
