//! Task trait for the batch runner.

use async_trait::async_trait;
use uvmlite_shared::errors::UvmResult;

/// A unit of work run with a shared context, cloned per task.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> UvmResult<()>;

    /// Name used in metrics and logs.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
