//! Boot runs: create, start and wait on Linux utility VMs in a batch.

use std::sync::Arc;

use async_trait::async_trait;
use uvmlite_shared::errors::UvmResult;

use crate::context::OpContext;
use crate::lcow::{LcowOptions, create_lcow};
use crate::pipeline::{
    BoxedTask, ExecutionMode, Pipeline, PipelineExecutor, PipelineMetrics, PipelineTask,
};
use crate::source::LinuxSource;
use crate::vm::Uvm;

/// Shared by every boot task in a batch.
#[derive(Debug)]
pub struct BootContext {
    pub source: LinuxSource,
    pub options: LcowOptions,
    pub ctx: OpContext,
}

pub type BootCtx = Arc<BootContext>;

/// One full lifecycle: create_lcow, start, wait.
pub struct LcowBootTask {
    index: usize,
    name: String,
}

impl LcowBootTask {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            name: format!("boot-{index}"),
        }
    }
}

#[async_trait]
impl PipelineTask<BootCtx> for LcowBootTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> UvmResult<()> {
        tracing::info!(run = self.index, "Starting");

        let mut uvm = create_lcow(&ctx.source, &ctx.options, &ctx.ctx).await?;
        uvm.start(&ctx.ctx).await?;
        let status = uvm.wait(&ctx.ctx).await?;

        if let Some(forwarder) = uvm.take_log_forwarder() {
            forwarder.abort();
        }
        tracing::info!(run = self.index, uvm_id = %uvm.id(), reason = ?status.reason, "Finished");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Boot `count` VMs, sequentially or all at once. A failed run is logged
/// under its task name (`boot-<index>`) and reported in the metrics.
pub async fn run_batch(ctx: BootCtx, count: usize, parallel: bool) -> PipelineMetrics {
    let tasks: Vec<BoxedTask<BootCtx>> = (0..count)
        .map(|i| Box::new(LcowBootTask::new(i)) as BoxedTask<BootCtx>)
        .collect();
    let pipeline = Pipeline::single(tasks, ExecutionMode::from_parallel(parallel));
    PipelineExecutor::execute(pipeline, ctx).await
}
