//! Rollback of a partially created compute system.

use uvmlite_shared::errors::{UvmError, UvmResult};

use crate::hcs::ComputeSystem;
use crate::trace::{Field, SharedSink, Span};

/// Holds a freshly created compute system until create completes.
///
/// On failure call [`run`](Self::run): it terminates the system and waits
/// for it to exit so nothing outlives the failed create. On success call
/// [`disarm`](Self::disarm) to take the handle. A guard dropped while still
/// armed (the create future was abandoned) can only release the handle; the
/// system then goes away with its last handle.
pub(super) struct CreateRollback {
    id: String,
    system: Option<Box<dyn ComputeSystem>>,
    sink: SharedSink,
}

impl CreateRollback {
    pub fn new(id: &str, system: Box<dyn ComputeSystem>, sink: SharedSink) -> Self {
        Self {
            id: id.to_string(),
            system: Some(system),
            sink,
        }
    }

    pub fn system(&self) -> UvmResult<&dyn ComputeSystem> {
        self.system
            .as_deref()
            .ok_or_else(|| UvmError::Internal("compute system handle already released".into()))
    }

    /// Keep the compute system (call on success).
    pub fn disarm(mut self) -> UvmResult<Box<dyn ComputeSystem>> {
        self.system
            .take()
            .ok_or_else(|| UvmError::Internal("compute system handle already released".into()))
    }

    /// Terminate the compute system and wait for it to exit.
    ///
    /// Runs to completion regardless of the caller's context. Failures are
    /// reported to the diagnostic sink only; the caller returns the error
    /// that caused the rollback.
    pub async fn run(mut self) {
        let Some(system) = self.system.take() else {
            return;
        };

        let span = Span::root(
            self.sink.clone(),
            "uvm::CreateRollback",
            vec![Field::new("uvm_id", &self.id)],
        );

        if let Err(e) = system.terminate().await {
            tracing::warn!(uvm_id = %self.id, error = %e, "Failed to terminate compute system during rollback");
            span.end(Some(&e));
            return;
        }

        match system.wait().await {
            Ok(status) => {
                tracing::debug!(uvm_id = %self.id, reason = ?status.reason, "Rolled back compute system");
                span.end(None);
            }
            Err(e) => {
                tracing::warn!(uvm_id = %self.id, error = %e, "Failed to wait for compute system during rollback");
                span.end(Some(&e));
            }
        }
    }
}

impl Drop for CreateRollback {
    fn drop(&mut self) {
        if self.system.take().is_some() {
            tracing::warn!(uvm_id = %self.id, "Create abandoned, releasing compute system handle");
        }
    }
}
