//! Stages group tasks under one execution mode.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// All tasks are polled concurrently.
    Parallel,
    /// Each task starts after the previous one finished.
    Sequential,
}

impl ExecutionMode {
    pub fn from_parallel(parallel: bool) -> Self {
        if parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub tasks: Vec<T>,
    pub execution: ExecutionMode,
}

impl<T> Stage<T> {
    pub fn new(tasks: Vec<T>, execution: ExecutionMode) -> Self {
        Self { tasks, execution }
    }

    pub fn parallel(tasks: Vec<T>) -> Self {
        Self::new(tasks, ExecutionMode::Parallel)
    }

    pub fn sequential(tasks: Vec<T>) -> Self {
        Self::new(tasks, ExecutionMode::Sequential)
    }
}
