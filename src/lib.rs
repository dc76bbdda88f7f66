pub mod agent;
pub mod audit;
pub mod capability;
pub mod code_loop;
pub mod config;
pub mod convergence;
pub mod dialogue;
pub mod draft;
pub mod errors;
pub mod pipeline;
pub mod references;
pub mod telemetry;
pub mod transcript;
pub mod ui;
pub mod util;

pub use errors::{CapabilityError, ConvergenceFailure, ExecutionFailure, PipelineStageFailure};
pub use pipeline::{Pipeline, PipelineEvent, PipelineOutput, PipelineRequest};
