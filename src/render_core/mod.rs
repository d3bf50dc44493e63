mod domain;
mod engine;
mod error;
mod pipeline;
mod retry;
mod settings;
mod stages;
mod store;
mod supervisor;
mod tools;

pub use domain::{
    EngineEvent, JobStatus, NewJob, ProgressEvent, QueueStats, QueueStateEvent, RenderJob,
    SourceKind, StageFlags, UpscaleVariant,
};
pub use engine::RenderEngine;
pub use error::EngineError;
pub use pipeline::compose_stages;
pub use settings::{EngineSettings, ToolPaths};
pub use stages::StageKind;
pub use store::{JobStore, JsonJobStore};
pub use supervisor::{CancelToken, ExecSpec, ExitReport, StreamKind};
pub use tools::ToolKind;
