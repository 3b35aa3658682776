mod annotator;
mod config;
mod integrator;
mod prompts;
mod reprocess;
mod trace;

pub use annotator::{AnnotationPipeline, BatchSelection, RunReport};
pub use config::{init_default_config, PipelineConfig, RetryPolicy};
pub use integrator::{BatchPayload, IntegrationCounts, SharedDocument};
pub use prompts::{render_template, PromptSet};
pub use reprocess::range_is_valid;
pub use trace::TraceWriter;
