//! Pipeline execution tracking, driven by workflow-engine webhooks.

pub mod tracker;

pub use tracker::{PipelineFilter, PipelineSort, PipelineSortField, PipelineTracker};
