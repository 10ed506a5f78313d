//! Compute system control surface.
//!
//! ## Architecture
//!
//! - **ComputeService**: creation (returns a ComputeSystem handle)
//! - **ComputeSystem**: operations on one created system (start, terminate,
//!   wait, properties, modify)
//!
//! The utility VM only ever talks to these traits. `emulated` provides an
//! in-process implementation used by `uvmboot` and the tests.

pub mod emulated;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use uvmlite_shared::errors::UvmResult;

use crate::schema::ModifySettingRequest;

pub use emulated::{EmulatedComputeService, HcsCall, SystemState};

/// Calls on the control surface, as named in errors and the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HcsOp {
    Create,
    Start,
    Terminate,
    Wait,
    Properties,
    Modify,
}

impl HcsOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            HcsOp::Create => "create",
            HcsOp::Start => "start",
            HcsOp::Terminate => "terminate",
            HcsOp::Wait => "wait",
            HcsOp::Properties => "properties",
            HcsOp::Modify => "modify",
        }
    }
}

impl fmt::Display for HcsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Properties reported by a created compute system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemProperties {
    pub id: String,
    pub runtime_id: Uuid,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub state: String,
}

/// Why a compute system stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Terminated by the host.
    Terminated,
    /// The guest shut itself down.
    GuestExit,
    /// The last handle was closed.
    HandleClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub reason: ExitReason,
    pub exited_at: DateTime<Utc>,
}

/// Creates compute systems.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Create a compute system from a serialized configuration document.
    async fn create(&self, id: &str, document: &Value) -> UvmResult<Box<dyn ComputeSystem>>;
}

/// Handle to one created compute system.
///
/// Dropping the handle releases it; the system itself may outlive the
/// handle unless it was created with terminate-on-last-handle-closed.
#[async_trait]
pub trait ComputeSystem: Send + Sync {
    fn id(&self) -> &str;

    async fn start(&self) -> UvmResult<()>;

    async fn terminate(&self) -> UvmResult<()>;

    /// Block until the system stops.
    async fn wait(&self) -> UvmResult<ExitStatus>;

    async fn properties(&self) -> UvmResult<SystemProperties>;

    async fn modify(&self, request: &ModifySettingRequest) -> UvmResult<()>;
}

impl fmt::Debug for dyn ComputeSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeSystem").field("id", &self.id()).finish()
    }
}
