use crate::pipeline::ExecutionMode;

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
    /// Error message if the task failed.
    pub error: Option<String>,
}

impl TaskMetrics {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub execution: ExecutionMode,
    pub duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn tasks(&self) -> impl Iterator<Item = &TaskMetrics> {
        self.stages.iter().flat_map(|stage| stage.tasks.iter())
    }

    pub fn task(&self, name: &str) -> Option<&TaskMetrics> {
        self.tasks().find(|task| task.name == name)
    }

    /// Tasks that returned an error, in stage then task order.
    pub fn failures(&self) -> Vec<&TaskMetrics> {
        self.tasks().filter(|task| !task.succeeded()).collect()
    }
}
