mod pipeline;
mod sidecar;

pub use pipeline::{HarvestPipeline, RetrySummary};
pub use sidecar::page_metadata_path;
