use std::time::Duration;

use super::parse::parse_backend_progress;
use super::upscale::{percent_of, validate_backend_script, write_backend_script};
use super::{
    expect_success, map_run_error, require_input_file, StageKind, StageProgress, StageRequest,
    StageRunner,
};
use crate::render_core::error::EngineError;
use crate::render_core::supervisor::{self, CancelToken, ExecSpec, RunOptions, StreamKind};
use crate::render_core::tools::{probe_tool, resolve_tool, ToolKind};

const DEFAULT_FPS_MULTIPLIER: u64 = 2;

/// Frame interpolation: the same piped-pair architecture as the AI upscale
/// variants, with a backend script that applies a frame-rate multiplier.
pub(crate) struct InterpolateStage;

impl StageRunner for InterpolateStage {
    fn kind(&self) -> StageKind {
        StageKind::Interpolate
    }

    fn preflight(&self, req: &StageRequest<'_>) -> Result<(), EngineError> {
        require_input_file(req.input)?;
        let timeout = Duration::from_millis(req.settings.preflight_timeout_ms);
        let backend = resolve_tool(ToolKind::FrameBackend, req.settings)?;
        probe_tool(&backend, timeout)?;
        let encoder = resolve_tool(ToolKind::Encoder, req.settings)?;
        probe_tool(&encoder, timeout)
    }

    fn run(
        &self,
        req: &StageRequest<'_>,
        on_progress: &mut dyn FnMut(StageProgress),
        cancel: &CancelToken,
    ) -> Result<(), EngineError> {
        let backend = resolve_tool(ToolKind::FrameBackend, req.settings)?;
        let encoder = resolve_tool(ToolKind::Encoder, req.settings)?;

        let multiplier = fps_multiplier(req.job.stage_settings.as_ref());
        let target_fps = req.job.frame_rate * multiplier as f64;
        let script = write_backend_script(
            req,
            "interpolate",
            &[("fpsMultiplier", &multiplier.to_string())],
        )?;
        validate_backend_script(&backend, &script, req.settings)?;

        let producer = ExecSpec::new(backend).arg(script.to_string_lossy().into_owned());
        let consumer = ExecSpec::new(encoder)
            .arg("-y")
            .arg("-r")
            .arg(format!("{target_fps}"))
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

        expect_success(report, "interpolation pipeline", last_line.as_deref())
    }
}

fn fps_multiplier(settings: Option<&serde_json::Value>) -> u64 {
    settings
        .and_then(|s| s.get("fpsMultiplier"))
        .and_then(|v| v.as_u64())
        .filter(|m| *m >= 2)
        .unwrap_or(DEFAULT_FPS_MULTIPLIER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_defaults_and_rejects_degenerate_values() {
        assert_eq!(fps_multiplier(None), 2);
        assert_eq!(
            fps_multiplier(Some(&serde_json::json!({ "fpsMultiplier": 4 }))),
            4
        );
        assert_eq!(
            fps_multiplier(Some(&serde_json::json!({ "fpsMultiplier": 1 }))),
            2
        );
        assert_eq!(
            fps_multiplier(Some(&serde_json::json!({ "fpsMultiplier": 0 }))),
            2
        );
    }
}
