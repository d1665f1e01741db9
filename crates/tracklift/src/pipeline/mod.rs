pub mod job;
pub mod track;

pub use job::{JobReport, JobRunner, KeyReport, SESSION_VAULT};
pub use track::{PipelineContext, TrackPipeline, TrackReport};
