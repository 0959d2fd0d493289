//! Discovers latent functional roles among outfield players from
//! season-aggregated statistics and explains every assignment.

pub mod artifacts;
pub mod attribution;
pub mod cluster_metrics;
pub mod clustering;
pub mod config;
pub mod dataset;
pub mod discovery;
pub mod embedding;
pub mod error;
pub mod features;
pub mod pipeline;
pub mod projector;
pub mod stability;
pub mod surrogate;

pub use error::PipelineError;
