use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use super::parse::parse_timeline_progress;
use super::{
    expect_success, map_run_error, require_input_file, StageKind, StageProgress, StageRequest,
    StageRunner,
};
use crate::render_core::error::EngineError;
use crate::render_core::supervisor::{self, CancelToken, ExecSpec, RunOptions, StreamKind};
use crate::render_core::tools::{probe_tool, resolve_tool, ToolKind};

/// Renders a timeline project into a flat video via the timeline renderer
/// binary. Track selection is applied by pointing the renderer at a private
/// copy of the project file; the copy is removed whether the stage succeeds
/// or fails. The renderer is always driven down its CPU codec path.
pub(crate) struct TimelineRenderStage;

impl TimelineRenderStage {
    fn build_spec(
        req: &StageRequest<'_>,
        renderer: PathBuf,
        project_path: &std::path::Path,
    ) -> ExecSpec {
        let mut spec = ExecSpec::new(renderer)
            .arg(project_path.to_string_lossy().into_owned())
            .arg(format!("target={}", req.output.display()));
        if let Some(in_frame) = req.job.in_frame {
            spec = spec.arg(format!("in={in_frame}"));
        }
        if let Some(out_frame) = req.job.out_frame {
            spec = spec.arg(format!("out={out_frame}"));
        }
        if let Some(selection) = req.job.track_selection.as_deref() {
            spec = spec.arg(format!("tracks={selection}"));
        }
        spec
    }
}

impl StageRunner for TimelineRenderStage {
    fn kind(&self) -> StageKind {
        StageKind::TimelineRender
    }

    fn preflight(&self, req: &StageRequest<'_>) -> Result<(), EngineError> {
        require_input_file(req.input)?;
        let renderer = resolve_tool(ToolKind::TimelineRenderer, req.settings)?;
        probe_tool(
            &renderer,
            Duration::from_millis(req.settings.preflight_timeout_ms),
        )
    }

    fn run(
        &self,
        req: &StageRequest<'_>,
        on_progress: &mut dyn FnMut(StageProgress),
        cancel: &CancelToken,
    ) -> Result<(), EngineError> {
        let renderer = resolve_tool(ToolKind::TimelineRenderer, req.settings)?;

        if wants_hardware_codec(req.job.stage_settings.as_ref()) {
            warn!(
                job = %req.job.id,
                "hardware codec requested for timeline render; using the CPU path instead"
            );
        }

        // A track selection means the renderer must not see the original
        // project file; materialize a job-owned copy and point it there.
        let project_copy: Option<PathBuf> = if req.job.track_selection.is_some() {
            let dir = req.settings.job_temp_dir(&req.job.id);
            fs::create_dir_all(&dir)
                .map_err(|err| EngineError::Process(format!("create {}: {err}", dir.display())))?;
            let copy = dir.join("project-selection");
            fs::copy(req.input, &copy).map_err(|err| {
                EngineError::Process(format!(
                    "copy project {} -> {}: {err}",
                    req.input.display(),
                    copy.display()
                ))
            })?;
            Some(copy)
        } else {
            None
        };

        let project_path = project_copy.as_deref().unwrap_or(req.input);
        let spec = Self::build_spec(req, renderer, project_path);

        let mut last_line: Option<String> = None;
        let result = supervisor::run(
            &spec,
            RunOptions {
                stop_grace: Duration::from_millis(req.settings.heavy_stop_grace_ms),
                deadline: None,
            },
            &mut |kind, line| {
                if kind == StreamKind::Stderr {
                    if let Some((frame, percent)) = parse_timeline_progress(line) {
                        on_progress(StageProgress {
                            percent: Some(percent),
                            frame,
                            total_frames: req.job.total_frames,
                        });
                    }
                    last_line = Some(line.to_string());
                }
            },
            cancel,
        );

        // The copy is job-owned scratch: gone on success, failure and
        // cancellation alike.
        if let Some(copy) = project_copy {
            drop(fs::remove_file(copy));
        }

        let report = result.map_err(map_run_error)?;
        expect_success(report, "timeline renderer", last_line.as_deref())
    }
}

fn wants_hardware_codec(settings: Option<&serde_json::Value>) -> bool {
    let Some(settings) = settings else {
        return false;
    };
    ["hardwareEncoder", "hwaccel", "useHardware"]
        .iter()
        .any(|key| {
            settings
                .get(key)
                .is_some_and(|v| v.as_bool() == Some(true) || v.is_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_hints_are_detected_in_settings_blobs() {
        assert!(wants_hardware_codec(Some(&serde_json::json!({
            "hardwareEncoder": true
        }))));
        assert!(wants_hardware_codec(Some(&serde_json::json!({
            "hwaccel": "cuda"
        }))));
        assert!(!wants_hardware_codec(Some(&serde_json::json!({
            "hardwareEncoder": false
        }))));
        assert!(!wants_hardware_codec(None));
    }
}
