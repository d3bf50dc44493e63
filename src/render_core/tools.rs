use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::warn;

use super::error::EngineError;
use super::settings::EngineSettings;

/// External tools the stage runners depend on. The orchestrator only knows
/// their process contracts; any binary honoring the contract is
/// substitutable via `ToolPaths`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// Renders a timeline project file; progress on stderr as
    /// `Current Frame: <n>, percentage: <p>`.
    TimelineRenderer,
    /// Encodes video, optionally reading raw frames from stdin; progress on
    /// stderr as `frame= <n>` counters.
    Encoder,
    /// Reads a script file and emits raw frames on stdout; progress on
    /// stderr as `Frame: <n>/<total>`.
    FrameBackend,
}

impl ToolKind {
    pub fn binary_name(self) -> &'static str {
        match self {
            ToolKind::TimelineRenderer => "melt",
            ToolKind::Encoder => "ffmpeg",
            ToolKind::FrameBackend => "vspipe",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ToolKind::TimelineRenderer => "timeline renderer",
            ToolKind::Encoder => "video encoder",
            ToolKind::FrameBackend => "frame-processing backend",
        }
    }
}

/// Resolve a tool to a concrete path: explicit setting first, then a `PATH`
/// search by conventional name. Fails with a preflight error when neither
/// yields an existing file.
pub(crate) fn resolve_tool(
    kind: ToolKind,
    settings: &EngineSettings,
) -> Result<PathBuf, EngineError> {
    let override_path = match kind {
        ToolKind::TimelineRenderer => settings.tools.timeline_renderer.as_deref(),
        ToolKind::Encoder => settings.tools.encoder.as_deref(),
        ToolKind::FrameBackend => settings.tools.frame_backend.as_deref(),
    };

    if let Some(raw) = override_path {
        let path = PathBuf::from(raw);
        if path.is_file() {
            return Ok(path);
        }
        return Err(EngineError::Preflight(format!(
            "{} configured at {} but no file exists there",
            kind.display_name(),
            path.display()
        )));
    }

    search_path(kind.binary_name()).ok_or_else(|| {
        EngineError::Preflight(format!(
            "{} ({}) not found on PATH",
            kind.display_name(),
            kind.binary_name()
        ))
    })
}

fn search_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{binary}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

// A misbehaving tool can write far more stderr than any diagnostic needs;
// probes keep only the most recent bytes.
const PROBE_STDERR_TAIL: usize = 8 * 1024;

/// Outcome of a short-lived probe invocation. A non-zero exit is data for
/// the caller to judge, not an error; only a failure to spawn is.
pub(crate) struct ProbeReport {
    pub success: bool,
    pub timed_out: bool,
    pub stderr_tail: String,
}

/// Run a short-lived check command to completion with a hard timeout,
/// keeping a bounded tail of its stderr. Long-lived stage processes go
/// through the supervisor instead; this path is for preflight and
/// validation calls only.
pub(crate) fn run_probe(
    label: &str,
    mut cmd: Command,
    timeout: Duration,
) -> Result<ProbeReport, EngineError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|err| EngineError::Preflight(format!("failed to launch {label}: {err}")))?;

    let mut stderr = child.stderr.take();
    let tail_reader = std::thread::spawn(move || {
        let Some(mut stderr) = stderr.take() else {
            return String::new();
        };
        let mut tail: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > PROBE_STDERR_TAIL {
                        let cut = tail.len() - PROBE_STDERR_TAIL;
                        tail.drain(0..cut);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    });

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                drop(child.kill());
                drop(child.wait());
                return Err(EngineError::Preflight(format!(
                    "lost track of {label} probe: {err}"
                )));
            }
        }
        if Instant::now() >= deadline {
            timed_out = true;
            drop(child.kill());
            match child.wait() {
                Ok(status) => break status,
                Err(err) => {
                    return Err(EngineError::Preflight(format!(
                        "could not reap timed-out {label} probe: {err}"
                    )));
                }
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let stderr_tail = tail_reader.join().unwrap_or_default();
    Ok(ProbeReport {
        success: status.success(),
        timed_out,
        stderr_tail,
    })
}

/// Cheap liveness probe run before spawning a tool for real: `-version` with
/// a short timeout. A non-zero exit or garbage output is tolerated (some
/// builds do not implement the flag); only a failure to spawn means the tool
/// is unusable.
pub(crate) fn probe_tool(path: &Path, timeout: Duration) -> Result<(), EngineError> {
    let mut cmd = Command::new(path);
    cmd.arg("-version");
    let report = run_probe(&path.display().to_string(), cmd, timeout)?;
    if report.timed_out {
        warn!(tool = %path.display(), "tool version probe timed out; proceeding anyway");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_core::settings::EngineSettings;

    #[test]
    fn explicit_override_must_exist() {
        let mut settings = EngineSettings::default();
        settings.tools.encoder = Some("/definitely/not/here/ffmpeg".to_string());
        let err = resolve_tool(ToolKind::Encoder, &settings).unwrap_err();
        assert!(matches!(err, EngineError::Preflight(_)));
    }

    #[cfg(unix)]
    #[test]
    fn explicit_override_resolves_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("encoder");
        std::fs::write(&tool, "#!/bin/sh\nexit 0\n").unwrap();
        let mut settings = EngineSettings::default();
        settings.tools.encoder = Some(tool.to_string_lossy().into_owned());
        let resolved = resolve_tool(ToolKind::Encoder, &settings).unwrap();
        assert_eq!(resolved, tool);
    }

    #[test]
    fn probing_a_missing_binary_is_a_preflight_error() {
        let err = probe_tool(Path::new("/definitely/not/here"), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, EngineError::Preflight(_)));
    }

    #[cfg(unix)]
    #[test]
    fn probes_are_killed_at_the_deadline() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let report = run_probe("sleep", cmd, Duration::from_millis(100)).unwrap();
        assert!(report.timed_out);
        assert!(!report.success);
    }

    #[cfg(unix)]
    #[test]
    fn probe_stderr_keeps_the_tail_not_the_head() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(
            "i=0; while [ $i -lt 400 ]; do echo aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa >&2; i=$((i+1)); done; echo THE-END >&2",
        );
        let report = run_probe("sh", cmd, Duration::from_secs(10)).unwrap();
        assert!(report.success);
        assert!(!report.timed_out);
        assert!(report.stderr_tail.len() <= PROBE_STDERR_TAIL);
        assert!(report.stderr_tail.trim_end().ends_with("THE-END"));
    }

    #[cfg(unix)]
    #[test]
    fn probe_reports_non_zero_exits_as_data() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo broken >&2; exit 9");
        let report = run_probe("sh", cmd, Duration::from_secs(5)).unwrap();
        assert!(!report.success);
        assert!(!report.timed_out);
        assert!(report.stderr_tail.contains("broken"));
    }
}
