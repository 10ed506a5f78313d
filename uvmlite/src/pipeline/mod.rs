//! Batch runner for utility VM lifecycles.
//!
//! ```text
//! Pipeline → Stages → Tasks
//!
//! - Pipeline: runs its stages in order
//! - Stage: a group of tasks run in parallel or one after another
//! - Task: one unit of work, e.g. boot a VM and wait for it to exit
//! ```
//!
//! A failing task never cancels its siblings or later stages. Its error is
//! recorded in the task's metrics and the run carries on.

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{Pipeline, PipelineExecutor};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
