//! The utility VM descriptor.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;
use uvmlite_shared::errors::{UvmError, UvmResult};

use super::State;
use crate::config::SourceOptions;
use crate::hcs::{ComputeService, ComputeSystem, HcsOp};
use crate::hvsock::{HvSocketListener, HvSocketProvider};
use crate::osversion::OsVersion;
use crate::schema::options::{self, SchemaOpt};
use crate::schema::{ComputeSystemDoc, merge_json};
use crate::trace::{Field, SharedSink, Span};

/// Collaborators a utility VM talks to. Cheap to clone.
#[derive(Clone)]
pub struct UvmServices {
    pub compute: Arc<dyn ComputeService>,
    pub hvsock: Arc<dyn HvSocketProvider>,
    pub sink: SharedSink,
    pub os: OsVersion,
    pub options: SourceOptions,
}

/// A utility VM.
///
/// Starts PreCreated with a configuration document that mutators edit in
/// place. After [`create`](super::Uvm::create) the document is frozen and
/// device changes go to the compute system as modify requests.
///
/// The descriptor is owned by one caller; every state-changing method takes
/// `&mut self`. Dropping it releases the compute system handle and any log
/// listener that was not yet handed to the forwarding task.
pub struct UtilityVm {
    pub(super) id: String,
    pub(super) owner: String,
    pub(super) state: State,
    pub(super) doc: ComputeSystemDoc,
    pub(super) additional_json: Option<Value>,
    pub(super) system: Option<Box<dyn ComputeSystem>>,
    pub(super) runtime_id: Option<Uuid>,
    pub(super) log_listener: Option<Box<dyn HvSocketListener>>,
    pub(super) log_forwarder: Option<JoinHandle<()>>,
    pub(super) services: UvmServices,
}

impl UtilityVm {
    pub(crate) fn new(
        id: String,
        owner: String,
        doc: ComputeSystemDoc,
        services: UvmServices,
    ) -> Self {
        tracing::trace!(uvm_id = %id, owner = %owner, "UtilityVm::new called");
        Self {
            id,
            owner,
            state: State::PreCreated,
            doc,
            additional_json: None,
            system: None,
            runtime_id: None,
            log_listener: None,
            log_forwarder: None,
            services,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn document(&self) -> &ComputeSystemDoc {
        &self.doc
    }

    pub fn additional_json(&self) -> Option<&Value> {
        self.additional_json.as_ref()
    }

    /// Runtime id assigned by the compute service; known once created.
    pub fn runtime_id(&self) -> Option<Uuid> {
        self.runtime_id
    }

    /// Whether the descriptor still owns the guest log listener.
    pub fn has_log_listener(&self) -> bool {
        self.log_listener.is_some()
    }

    /// Completion handle of the log forwarding task started by `start`.
    pub fn take_log_forwarder(&mut self) -> Option<JoinHandle<()>> {
        self.log_forwarder.take()
    }

    pub fn os_version(&self) -> OsVersion {
        self.services.os
    }

    /// Apply functional schema options in order.
    pub fn apply_schema_options(&mut self, opts: Vec<SchemaOpt>) -> UvmResult<()> {
        self.ensure_pre_created()?;
        options::apply(&mut self.doc, opts);
        Ok(())
    }

    /// Store raw JSON to be deep-merged into the document at create.
    ///
    /// An empty or blank fragment clears any stored fragment.
    pub fn set_additional_json(&mut self, fragment: &str) -> UvmResult<()> {
        self.ensure_pre_created()?;

        if fragment.trim().is_empty() {
            self.additional_json = None;
            return Ok(());
        }

        let value: Value = serde_json::from_str(fragment).map_err(|e| {
            UvmError::Config(format!("failed to parse additional JSON '{fragment}': {e}"))
        })?;
        if !value.is_object() {
            return Err(UvmError::Config(
                "additional JSON must be a JSON object".into(),
            ));
        }
        self.additional_json = Some(value);
        Ok(())
    }

    /// The document as sent to the compute service, caller fragment merged in.
    pub fn serialized_document(&self) -> UvmResult<Value> {
        let mut value = self.doc.to_value()?;
        if let Some(fragment) = &self.additional_json {
            merge_json(&mut value, fragment);
        }
        Ok(value)
    }

    // ========================================================================
    // GUARDS
    // ========================================================================

    pub(super) fn ensure_pre_created(&self) -> UvmResult<()> {
        if self.state.is_pre_created() {
            Ok(())
        } else {
            Err(self.wrong_state("pre-created"))
        }
    }

    /// The compute system handle, if the VM is Created or Running.
    pub(super) fn ensure_live(&self) -> UvmResult<&dyn ComputeSystem> {
        if !self.state.is_live() {
            return Err(self.wrong_state("created or running"));
        }
        self.live_system()
    }

    pub(super) fn live_system(&self) -> UvmResult<&dyn ComputeSystem> {
        self.system.as_deref().ok_or_else(|| {
            UvmError::Internal(format!(
                "utility VM '{}' is {} without a compute system handle",
                self.id, self.state
            ))
        })
    }

    pub(super) fn wrong_state(&self, expected: &'static str) -> UvmError {
        UvmError::InvalidState {
            expected,
            actual: self.state.to_string(),
        }
    }

    /// Attach call context to a control-surface error.
    pub(super) fn hcs_error(&self, op: HcsOp, resource_path: Option<&str>, source: UvmError) -> UvmError {
        UvmError::compute_system(op.as_str(), &self.id, resource_path.map(str::to_string), source)
    }

    /// Open a span for one operation on this VM.
    pub(super) fn span(&self, name: &str) -> Span {
        Span::root(
            Arc::clone(&self.services.sink),
            name,
            vec![Field::new("uvm_id", &self.id)],
        )
    }
}

impl std::fmt::Debug for UtilityVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtilityVm")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state)
            .field("runtime_id", &self.runtime_id)
            .field("has_log_listener", &self.log_listener.is_some())
            .finish()
    }
}

impl Drop for UtilityVm {
    fn drop(&mut self) {
        super::lifecycle::drop_handler(self);
    }
}
