use std::path::Path;

use serde::{Deserialize, Serialize};

use super::domain::RenderJob;
use super::error::EngineError;
use super::settings::EngineSettings;
use super::supervisor::{CancelToken, ExitReport, RunError};

mod interpolate;
mod parse;
mod timeline_render;
mod upscale;

pub(crate) use interpolate::InterpolateStage;
pub(crate) use timeline_render::TimelineRenderStage;
pub(crate) use upscale::UpscaleStage;

/// The three heavy processing steps a job can chain. Each wraps exactly one
/// external tool invocation (or one piped pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    TimelineRender,
    Upscale,
    Interpolate,
}

impl StageKind {
    pub fn label(self) -> &'static str {
        match self {
            StageKind::TimelineRender => "Timeline render",
            StageKind::Upscale => "Upscale",
            StageKind::Interpolate => "Interpolate",
        }
    }
}

/// A single progress observation from a running stage, expressed in the
/// stage's own 0-100 range. `percent` is None when the tool emitted a frame
/// counter but the total is unknown.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageProgress {
    pub percent: Option<f64>,
    pub frame: u64,
    pub total_frames: Option<u64>,
}

/// Everything a stage runner needs for one invocation. The job record is
/// read-only here; all persistence goes through the executor.
pub(crate) struct StageRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub job: &'a RenderJob,
    pub settings: &'a EngineSettings,
}

/// Uniform contract the orchestrator drives every stage through.
pub(crate) trait StageRunner: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Cheap checks before any process is spawned: the input must exist and
    /// the required tools must be resolvable.
    fn preflight(&self, req: &StageRequest<'_>) -> Result<(), EngineError>;

    fn run(
        &self,
        req: &StageRequest<'_>,
        on_progress: &mut dyn FnMut(StageProgress),
        cancel: &CancelToken,
    ) -> Result<(), EngineError>;
}

pub(crate) fn require_input_file(path: &Path) -> Result<(), EngineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(EngineError::Preflight(format!(
            "input file missing: {}",
            path.display()
        )))
    }
}

pub(crate) fn map_run_error(err: RunError) -> EngineError {
    match err {
        RunError::Cancelled => EngineError::Cancelled,
        RunError::NotFound(path) => {
            EngineError::Preflight(format!("executable vanished: {}", path.display()))
        }
        RunError::Launch { program, message } => EngineError::Process(format!(
            "failed to launch {}: {message}",
            program.display()
        )),
        RunError::TimedOut(after) => {
            EngineError::Process(format!("process exceeded deadline of {after:?}"))
        }
    }
}

pub(crate) fn expect_success(
    report: ExitReport,
    tool: &str,
    last_line: Option<&str>,
) -> Result<(), EngineError> {
    if report.success() {
        return Ok(());
    }
    let code_desc = report
        .code
        .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}"));
    let detail = last_line
        .map(|line| format!("; last output: {line}"))
        .unwrap_or_default();
    Err(EngineError::Process(format!(
        "{tool} exited with non-zero status ({code_desc}){detail}"
    )))
}
