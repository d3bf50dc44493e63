use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::domain::RenderJob;
use super::error::EngineError;
use super::settings::EngineSettings;
use super::stages::{
    InterpolateStage, StageKind, StageRequest, StageRunner, TimelineRenderStage, UpscaleStage,
};
use super::store::JobStore;
use super::supervisor::CancelToken;

/// Compose the ordered stage list for a job from its flags. The canonical
/// order is timeline render, then upscale, then interpolate: upscaling first
/// keeps the frame count the far more expensive interpolator sees as small
/// as possible.
pub fn compose_stages(job: &RenderJob) -> Vec<StageKind> {
    let mut stages = Vec::new();
    if job.wants_timeline_render() {
        stages.push(StageKind::TimelineRender);
    }
    if job.stage_flags.upscale {
        stages.push(StageKind::Upscale);
    }
    if job.stage_flags.interpolate {
        stages.push(StageKind::Interpolate);
    }
    stages
}

fn runner_for(kind: StageKind) -> &'static dyn StageRunner {
    match kind {
        StageKind::TimelineRender => &TimelineRenderStage,
        StageKind::Upscale => &UpscaleStage,
        StageKind::Interpolate => &InterpolateStage,
    }
}

/// Each stage owns an equal slice of the whole-job 0-100 range; a stage's
/// own percentage is interpolated linearly inside its slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StageSlice {
    pub base: f64,
    pub span: f64,
}

pub(crate) fn stage_slices(count: usize) -> Vec<StageSlice> {
    let span = 100.0 / count.max(1) as f64;
    (0..count.max(1))
        .map(|i| StageSlice {
            base: span * i as f64,
            span,
        })
        .collect()
}

/// One progress observation mapped into whole-job terms. `force` marks stage
/// boundaries, which bypass the event throttle so observers never miss a
/// label change.
#[derive(Debug, Clone)]
pub(crate) struct ProgressSignal {
    pub percent: f64,
    pub frame: u64,
    pub total_frames: Option<u64>,
    pub stage_label: String,
    pub force: bool,
}

/// Per-stage input/output routing: the last stage writes the job's final
/// output, every earlier stage writes a job-owned intermediate.
pub(crate) fn route_stage_paths(
    job: &RenderJob,
    stage_count: usize,
    settings: &EngineSettings,
) -> Vec<(PathBuf, PathBuf)> {
    let temp_dir = settings.job_temp_dir(&job.id);
    let mut routes = Vec::with_capacity(stage_count);
    let mut input = PathBuf::from(&job.source_path);
    for index in 0..stage_count {
        let output = if index + 1 == stage_count {
            PathBuf::from(&job.output_path)
        } else {
            temp_dir.join(format!("intermediate-{}.mp4", index + 1))
        };
        routes.push((input.clone(), output.clone()));
        input = output;
    }
    routes
}

/// Executes one job's composed pipeline: routes artifacts between stages,
/// keeps the stage label and size side data current in the store, remaps
/// per-stage progress into the job's overall percentage, and cleans up the
/// job-owned temp directory on success, failure and cancellation alike.
pub(crate) struct PipelineExecutor<'a> {
    pub settings: &'a EngineSettings,
    pub store: &'a dyn JobStore,
}

impl<'a> PipelineExecutor<'a> {
    pub fn run(
        &self,
        job: &RenderJob,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(ProgressSignal),
    ) -> Result<(), EngineError> {
        let stages = compose_stages(job);
        if stages.is_empty() {
            return Err(EngineError::InvalidJob(
                "job requests no processing stages".to_string(),
            ));
        }

        let result = self.run_stages(job, &stages, cancel, sink);

        // Finally-equivalent: the job-owned scratch directory goes away no
        // matter how the pipeline ended.
        let temp_dir = self.settings.job_temp_dir(&job.id);
        if temp_dir.exists() {
            drop(fs::remove_dir_all(&temp_dir));
        }

        result
    }

    fn run_stages(
        &self,
        job: &RenderJob,
        stages: &[StageKind],
        cancel: &CancelToken,
        sink: &mut dyn FnMut(ProgressSignal),
    ) -> Result<(), EngineError> {
        let routes = route_stage_paths(job, stages.len(), self.settings);
        let slices = stage_slices(stages.len());

        // Persist the routed intermediate paths up front so a later delete
        // can always find what this run may have left behind.
        {
            let mut record = self.store.get(&job.id)?;
            record.intermediate1_path = (stages.len() > 1)
                .then(|| routes[0].1.to_string_lossy().into_owned());
            record.intermediate2_path = (stages.len() > 2)
                .then(|| routes[1].1.to_string_lossy().into_owned());
            self.store.update(&record)?;
        }

        let mut last_overall = 0.0f64;
        for (index, (&kind, (input, output))) in stages.iter().zip(routes.iter()).enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let slice = slices[index];
            let label = format!("Stage {} of {}: {}", index + 1, stages.len(), kind.label());
            debug!(job = %job.id, %label, input = %input.display(), output = %output.display(), "starting stage");

            // Stage boundary: update the label and snap the overall
            // percentage to the slice base so observers never see the
            // previous stage's coarse floor linger.
            {
                let mut record = self.store.get(&job.id)?;
                record.stage_label = Some(label.clone());
                record.progress = record.progress.max(slice.base);
                record.append_log_line(format!("{label} starting"));
                self.store.update(&record)?;
            }
            last_overall = last_overall.max(slice.base);
            sink(ProgressSignal {
                percent: last_overall,
                frame: 0,
                total_frames: job.total_frames,
                stage_label: label.clone(),
                force: true,
            });

            let request = StageRequest {
                input,
                output,
                job,
                settings: self.settings,
            };
            let runner = runner_for(kind);
            runner.preflight(&request)?;

            let mut stage_progress = |progress: super::stages::StageProgress| {
                let overall = match progress.percent {
                    Some(p) => slice.base + slice.span * (p.clamp(0.0, 100.0) / 100.0),
                    None => last_overall,
                };
                // Monotonic within the slice; tools occasionally repeat or
                // reorder a counter under load.
                if overall > last_overall {
                    last_overall = overall;
                }
                sink(ProgressSignal {
                    percent: last_overall,
                    frame: progress.frame,
                    total_frames: progress.total_frames.or(job.total_frames),
                    stage_label: label.clone(),
                    force: false,
                });
            };
            runner.run(&request, &mut stage_progress, cancel)?;

            let artifact_size = non_empty_artifact_size(output)?;
            {
                let mut record = self.store.get(&job.id)?;
                match (index + 1 == stages.len(), index) {
                    (true, _) => record.output_size_bytes = Some(artifact_size),
                    (false, 0) => record.intermediate1_size_bytes = Some(artifact_size),
                    (false, _) => record.intermediate2_size_bytes = Some(artifact_size),
                }
                record.append_log_line(format!("{label} finished ({artifact_size} bytes)"));
                self.store.update(&record)?;
            }
        }

        Ok(())
    }
}

fn non_empty_artifact_size(path: &std::path::Path) -> Result<u64, EngineError> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => Ok(meta.len()),
        Ok(_) => Err(EngineError::Process(format!(
            "stage produced an empty artifact: {}",
            path.display()
        ))),
        Err(err) => Err(EngineError::Process(format!(
            "stage produced no artifact at {}: {err}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_core::domain::{JobStatus, SourceKind, StageFlags, UpscaleVariant};
    use chrono::Utc;

    fn job_with_flags(source_kind: SourceKind, flags: StageFlags) -> RenderJob {
        RenderJob {
            id: "job-1".to_string(),
            source_kind,
            source_path: "/in/source".to_string(),
            output_path: "/out/final.mp4".to_string(),
            intermediate1_path: None,
            intermediate2_path: None,
            stage_flags: flags,
            status: JobStatus::Pending,
            progress: 0.0,
            current_frame: 0,
            total_frames: None,
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
    fn stage_order_is_render_upscale_interpolate() {
        let job = job_with_flags(
            SourceKind::TimelineProject,
            StageFlags {
                timeline_render: true,
                upscale: true,
                interpolate: true,
                upscale_variant: UpscaleVariant::AiAnime,
            },
        );
        assert_eq!(
            compose_stages(&job),
            vec![
                StageKind::TimelineRender,
                StageKind::Upscale,
                StageKind::Interpolate
            ]
        );
    }

    #[test]
    fn timeline_source_implies_the_render_stage() {
        let job = job_with_flags(
            SourceKind::TimelineProject,
            StageFlags {
                timeline_render: false,
                upscale: false,
                interpolate: true,
                upscale_variant: UpscaleVariant::None,
            },
        );
        assert_eq!(
            compose_stages(&job),
            vec![StageKind::TimelineRender, StageKind::Interpolate]
        );
    }

    #[test]
    fn plain_video_without_the_flag_skips_the_render_stage() {
        let job = job_with_flags(
            SourceKind::VideoFile,
            StageFlags {
                timeline_render: false,
                upscale: true,
                interpolate: false,
                upscale_variant: UpscaleVariant::Classic,
            },
        );
        assert_eq!(compose_stages(&job), vec![StageKind::Upscale]);
    }

    #[test]
    fn slices_are_uniform_and_cover_the_whole_range() {
        let slices = stage_slices(3);
        assert_eq!(slices.len(), 3);
        assert!((slices[0].base - 0.0).abs() < 1e-9);
        assert!((slices[1].base - 100.0 / 3.0).abs() < 1e-9);
        assert!((slices[2].base - 200.0 / 3.0).abs() < 1e-9);
        let end = slices[2].base + slices[2].span;
        assert!((end - 100.0).abs() < 1e-9);

        let halves = stage_slices(2);
        assert_eq!(halves[0], StageSlice { base: 0.0, span: 50.0 });
        assert_eq!(halves[1], StageSlice { base: 50.0, span: 50.0 });
    }

    #[test]
    fn single_stage_routes_source_straight_to_output() {
        let settings = EngineSettings::default();
        let job = job_with_flags(
            SourceKind::VideoFile,
            StageFlags {
                upscale: true,
                upscale_variant: UpscaleVariant::Classic,
                ..Default::default()
            },
        );
        let routes = route_stage_paths(&job, 1, &settings);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].0, PathBuf::from("/in/source"));
        assert_eq!(routes[0].1, PathBuf::from("/out/final.mp4"));
    }

    #[test]
    fn three_stage_routing_threads_both_intermediates() {
        let settings = EngineSettings::default();
        let job = job_with_flags(
            SourceKind::TimelineProject,
            StageFlags {
                timeline_render: true,
                upscale: true,
                interpolate: true,
                upscale_variant: UpscaleVariant::AiPhoto,
            },
        );
        let routes = route_stage_paths(&job, 3, &settings);
        let temp_dir = settings.job_temp_dir("job-1");

        assert_eq!(routes[0].0, PathBuf::from("/in/source"));
        assert_eq!(routes[0].1, temp_dir.join("intermediate-1.mp4"));
        assert_eq!(routes[1].0, temp_dir.join("intermediate-1.mp4"));
        assert_eq!(routes[1].1, temp_dir.join("intermediate-2.mp4"));
        assert_eq!(routes[2].0, temp_dir.join("intermediate-2.mp4"));
        assert_eq!(routes[2].1, PathBuf::from("/out/final.mp4"));
    }
}
