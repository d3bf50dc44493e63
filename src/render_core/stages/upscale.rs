use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::parse::{parse_backend_progress, parse_encoder_frame};
use super::{
    expect_success, map_run_error, require_input_file, StageKind, StageProgress, StageRequest,
    StageRunner,
};
use crate::render_core::domain::UpscaleVariant;
use crate::render_core::error::EngineError;
use crate::render_core::settings::EngineSettings;
use crate::render_core::supervisor::{self, CancelToken, ExecSpec, RunOptions, StreamKind};
use crate::render_core::tools::{probe_tool, resolve_tool, run_probe, ToolKind};

const DEFAULT_CLASSIC_FILTER: &str = "scale=iw*2:ih*2:flags=lanczos";

/// Upscales a video. The AI variants script the frame-processing backend and
/// pipe its raw frames into the encoder; the classic variant is a single
/// encoder invocation with a scaling filter.
pub(crate) struct UpscaleStage;

impl StageRunner for UpscaleStage {
    fn kind(&self) -> StageKind {
        StageKind::Upscale
    }

    fn preflight(&self, req: &StageRequest<'_>) -> Result<(), EngineError> {
        require_input_file(req.input)?;
        let timeout = Duration::from_millis(req.settings.preflight_timeout_ms);
        let encoder = resolve_tool(ToolKind::Encoder, req.settings)?;
        probe_tool(&encoder, timeout)?;
        if is_ai_variant(req.job.stage_flags.upscale_variant) {
            let backend = resolve_tool(ToolKind::FrameBackend, req.settings)?;
            probe_tool(&backend, timeout)?;
        }
        Ok(())
    }

    fn run(
        &self,
        req: &StageRequest<'_>,
        on_progress: &mut dyn FnMut(StageProgress),
        cancel: &CancelToken,
    ) -> Result<(), EngineError> {
        match req.job.stage_flags.upscale_variant {
            UpscaleVariant::AiAnime => run_ai(req, "anime", on_progress, cancel),
            UpscaleVariant::AiPhoto => run_ai(req, "photo", on_progress, cancel),
            UpscaleVariant::Classic | UpscaleVariant::None => run_classic(req, on_progress, cancel),
        }
    }
}

fn is_ai_variant(variant: UpscaleVariant) -> bool {
    matches!(variant, UpscaleVariant::AiAnime | UpscaleVariant::AiPhoto)
}

fn run_classic(
    req: &StageRequest<'_>,
    on_progress: &mut dyn FnMut(StageProgress),
    cancel: &CancelToken,
) -> Result<(), EngineError> {
    let encoder = resolve_tool(ToolKind::Encoder, req.settings)?;
    let filter = classic_scale_filter(req.job.stage_settings.as_ref());

    let spec = ExecSpec::new(encoder)
        .arg("-y")
        .arg("-i")
        .arg(req.input.to_string_lossy().into_owned())
        .arg("-vf")
        .arg(filter)
        .arg(req.output.to_string_lossy().into_owned());

    let total = req.job.total_frames;
    let mut last_line: Option<String> = None;
    let report = supervisor::run(
        &spec,
        RunOptions {
            stop_grace: Duration::from_millis(req.settings.heavy_stop_grace_ms),
            deadline: None,
        },
        &mut |kind, line| {
            if kind == StreamKind::Stderr {
                if let Some(frame) = parse_encoder_frame(line) {
                    on_progress(StageProgress {
                        percent: percent_of(frame, total),
                        frame,
                        total_frames: total,
                    });
                }
                last_line = Some(line.to_string());
            }
        },
        cancel,
    )
    .map_err(map_run_error)?;

    expect_success(report, "video encoder", last_line.as_deref())
}

fn run_ai(
    req: &StageRequest<'_>,
    model: &str,
    on_progress: &mut dyn FnMut(StageProgress),
    cancel: &CancelToken,
) -> Result<(), EngineError> {
    let backend = resolve_tool(ToolKind::FrameBackend, req.settings)?;
    let encoder = resolve_tool(ToolKind::Encoder, req.settings)?;

    let script = write_backend_script(req, "upscale", &[("model", model)])?;
    validate_backend_script(&backend, &script, req.settings)?;

    let producer = ExecSpec::new(backend).arg(script.to_string_lossy().into_owned());
    let consumer = ExecSpec::new(encoder)
        .arg("-y")
        .arg("-r")
        .arg(format!("{}", req.job.frame_rate))
        .arg("-i")
        .arg("pipe:0")
        .arg(req.output.to_string_lossy().into_owned());

    let mut last_line: Option<String> = None;
    let report = supervisor::run_piped(
        &producer,
        &consumer,
        RunOptions {
            stop_grace: Duration::from_millis(req.settings.piped_stop_grace_ms),
            deadline: None,
        },
        &mut |kind, line| {
            if kind == StreamKind::Stderr {
                if let Some((frame, total)) = parse_backend_progress(line) {
                    on_progress(StageProgress {
                        percent: percent_of(frame, Some(total)),
                        frame,
                        total_frames: Some(total),
                    });
                }
                last_line = Some(line.to_string());
            }
        },
        cancel,
    )
    .map_err(map_run_error)?;

    expect_success(report, "frame-processing pipeline", last_line.as_deref())
}

pub(super) fn percent_of(frame: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(total) if total > 0 => Some(((frame as f64 / total as f64) * 100.0).clamp(0.0, 100.0)),
        _ => None,
    }
}

fn classic_scale_filter(settings: Option<&serde_json::Value>) -> String {
    settings
        .and_then(|s| s.get("scaleFilter"))
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_CLASSIC_FILTER)
        .to_string()
}

/// Write the backend script for this stage under the job's temp directory.
/// The script format belongs to the backend; the orchestrator only threads
/// the input path, task parameters and the opaque settings payload through.
pub(super) fn write_backend_script(
    req: &StageRequest<'_>,
    task: &str,
    params: &[(&str, &str)],
) -> Result<PathBuf, EngineError> {
    let dir = req.settings.job_temp_dir(&req.job.id);
    fs::create_dir_all(&dir)
        .map_err(|err| EngineError::Process(format!("create {}: {err}", dir.display())))?;
    let script = dir.join(format!("{task}.script"));

    let mut contents = String::new();
    contents.push_str(&format!("task={task}\n"));
    contents.push_str(&format!("source={}\n", req.input.display()));
    for (key, value) in params {
        contents.push_str(&format!("{key}={value}\n"));
    }
    if let Some(settings) = req.job.stage_settings.as_ref() {
        contents.push_str(&format!("settings={settings}\n"));
    }

    fs::write(&script, contents)
        .map_err(|err| EngineError::Process(format!("write {}: {err}", script.display())))?;
    Ok(script)
}

/// Validation pass before the real run. First invocations may download
/// models or JIT-compile, so the timeout is the generous warmup window.
pub(super) fn validate_backend_script(
    backend: &Path,
    script: &Path,
    settings: &EngineSettings,
) -> Result<(), EngineError> {
    let mut cmd = Command::new(backend);
    cmd.arg("--check").arg(script);
    let report = run_probe(
        &backend.display().to_string(),
        cmd,
        Duration::from_millis(settings.warmup_timeout_ms),
    )?;

    if report.timed_out {
        return Err(EngineError::Preflight(format!(
            "script validation timed out after {}ms",
            settings.warmup_timeout_ms
        )));
    }
    if !report.success {
        return Err(EngineError::Preflight(format!(
            "script validation failed: {}",
            report.stderr_tail.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_needs_a_positive_total() {
        assert_eq!(percent_of(50, Some(200)), Some(25.0));
        assert_eq!(percent_of(10, Some(0)), None);
        assert_eq!(percent_of(10, None), None);
    }

    #[test]
    fn percent_is_clamped_at_one_hundred() {
        assert_eq!(percent_of(400, Some(300)), Some(100.0));
    }

    #[test]
    fn classic_filter_prefers_the_settings_blob() {
        let blob = serde_json::json!({ "scaleFilter": "scale=3840:-2" });
        assert_eq!(classic_scale_filter(Some(&blob)), "scale=3840:-2");
        assert_eq!(classic_scale_filter(None), DEFAULT_CLASSIC_FILTER);
    }
}
