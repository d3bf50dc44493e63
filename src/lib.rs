pub mod render_core;
pub(crate) mod sync_ext;

pub use render_core::{
    compose_stages, EngineError, EngineEvent, EngineSettings, JobStatus, JobStore, JsonJobStore,
    NewJob, ProgressEvent, QueueStats, QueueStateEvent, RenderEngine, RenderJob, SourceKind,
    StageFlags, StageKind, ToolKind, ToolPaths, UpscaleVariant,
};
