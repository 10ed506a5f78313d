//! Pipeline executor.

use std::time::Instant;

use futures::future::join_all;

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::task::BoxedTask;

pub struct Pipeline<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    /// A single stage holding `tasks`.
    pub fn single(tasks: Vec<BoxedTask<Ctx>>, execution: ExecutionMode) -> Self {
        Self::new(vec![Stage::new(tasks, execution)])
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every stage in order and every task in each stage.
    ///
    /// Task errors are logged and recorded in the returned metrics; they do
    /// not stop other tasks.
    pub async fn execute<Ctx>(pipeline: Pipeline<Ctx>, ctx: Ctx) -> PipelineMetrics
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();

        for (index, stage) in pipeline.stages.into_iter().enumerate() {
            let execution = stage.execution;
            let stage_start = Instant::now();

            let task_metrics = match execution {
                ExecutionMode::Parallel => {
                    let futures = stage
                        .tasks
                        .into_iter()
                        .map(|task| run_task(task, ctx.clone()));
                    join_all(futures).await
                }
                ExecutionMode::Sequential => {
                    let mut task_metrics = Vec::new();
                    for task in stage.tasks {
                        task_metrics.push(run_task(task, ctx.clone()).await);
                    }
                    task_metrics
                }
            };

            stage_metrics.push(StageMetrics {
                index,
                execution,
                duration_ms: stage_start.elapsed().as_millis(),
                tasks: task_metrics,
            });
        }

        PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        }
    }
}

async fn run_task<Ctx>(task: BoxedTask<Ctx>, ctx: Ctx) -> TaskMetrics {
    let name = task.name().to_string();
    let task_start = Instant::now();
    let error = match task.run(ctx).await {
        Ok(()) => None,
        Err(e) => {
            tracing::error!(task = %name, error = %e, "Task failed");
            Some(e.to_string())
        }
    };
    TaskMetrics {
        name,
        duration_ms: task_start.elapsed().as_millis(),
        error,
    }
}
