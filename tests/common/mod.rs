#![cfg(unix)]
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use rendermill::{EngineEvent, EngineSettings, JobStatus, NewJob, SourceKind, StageFlags};

static TRACING: Once = Once::new();

/// Route engine tracing into the test harness so `cargo test` failures show
/// what the scheduler and supervisor were doing. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Write an executable mock tool script. Every mock answers `-version`
/// immediately so preflight probes never touch the behavior under test.
pub fn write_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    init_tracing();
    let path = dir.join(name);
    let script = format!("#!/bin/sh\nif [ \"$1\" = \"-version\" ]; then echo mock; exit 0; fi\n{body}");
    std::fs::write(&path, script).expect("write mock tool");
    let mut perms = std::fs::metadata(&path).expect("stat mock tool").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod mock tool");
    path
}

/// Encoder that accepts both the classic form (`-i <file> ... <out>`) and
/// the piped form (`-i pipe:0 ... <out>`), emits `frame=` progress, and
/// writes a non-empty output artifact.
pub const ENCODER_OK: &str = r#"
in=""
prev=""
out=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then in="$arg"; fi
  prev="$arg"
  out="$arg"
done
if [ "$in" = "pipe:0" ]; then
  cat > /dev/null
else
  [ -f "$in" ] || { echo "input missing: $in" >&2; exit 1; }
fi
echo "frame=  100 fps=30" >&2
echo "frame=  300 fps=30" >&2
echo "encoded video data" > "$out"
exit 0
"#;

/// Frame backend honoring the `--check` validation call, emitting
/// `Frame: n/total` progress and raw frames on stdout.
pub const BACKEND_OK: &str = r#"
if [ "$1" = "--check" ]; then [ -f "$2" ] || exit 1; exit 0; fi
script="$1"
[ -f "$script" ] || { echo "script missing" >&2; exit 2; }
echo "Frame: 100/300" >&2
echo "Frame: 200/300" >&2
echo "Frame: 300/300" >&2
printf 'raw-frame-bytes'
exit 0
"#;

/// Timeline renderer: project path first, then key=value options; progress
/// on stderr in the renderer's `Current Frame` format.
pub const RENDERER_OK: &str = r#"
project="$1"
shift
target=""
for arg in "$@"; do
  case "$arg" in
    target=*) target="${arg#target=}" ;;
  esac
done
[ -f "$project" ] || { echo "project missing" >&2; exit 1; }
[ -n "$target" ] || { echo "no target given" >&2; exit 1; }
echo "Current Frame: 100, percentage: 33" >&2
echo "Current Frame: 200, percentage: 66" >&2
echo "Current Frame: 300, percentage: 100" >&2
echo "rendered timeline data" > "$target"
exit 0
"#;

/// One recorded event plus when it arrived, for ordering and timing asserts.
#[derive(Clone)]
pub struct RecordedEvent {
    pub at: Instant,
    pub event: EngineEvent,
}

#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> impl Fn(&EngineEvent) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event| {
            events.lock().unwrap().push(RecordedEvent {
                at: Instant::now(),
                event: event.clone(),
            });
        }
    }

    pub fn snapshot(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Status values observed for one job, consecutive duplicates collapsed.
    pub fn status_path(&self, job_id: &str) -> Vec<JobStatus> {
        let mut path: Vec<JobStatus> = Vec::new();
        for recorded in self.snapshot() {
            if let EngineEvent::Job(event) = &recorded.event {
                if event.job_id == job_id && path.last() != Some(&event.status) {
                    path.push(event.status);
                }
            }
        }
        path
    }

    pub fn job_events(&self, job_id: &str) -> Vec<RecordedEvent> {
        self.snapshot()
            .into_iter()
            .filter(|recorded| {
                matches!(&recorded.event, EngineEvent::Job(event) if event.job_id == job_id)
            })
            .collect()
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

pub fn settings_in(dir: &Path) -> EngineSettings {
    init_tracing();
    let mut settings = EngineSettings::default();
    settings.temp_root = dir.join("work");
    settings.state_path = Some(dir.join("jobs.json"));
    settings
}

pub fn video_job(source: &Path, output: &Path) -> NewJob {
    NewJob {
        source_kind: SourceKind::VideoFile,
        source_path: source.to_string_lossy().into_owned(),
        output_path: output.to_string_lossy().into_owned(),
        stage_flags: StageFlags {
            timeline_render: false,
            upscale: true,
            interpolate: false,
            upscale_variant: rendermill::UpscaleVariant::Classic,
        },
        frame_rate: 30.0,
        in_frame: None,
        out_frame: None,
        total_frames: Some(300),
        track_selection: None,
        stage_settings: None,
        max_retries: None,
    }
}
