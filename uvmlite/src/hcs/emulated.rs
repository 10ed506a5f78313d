//! In-process compute service.
//!
//! Keeps every created system in memory, applies modify requests to its own
//! copy of the configuration document and journals each call it receives.
//! Faults can be queued per call kind: the next matching call either fails
//! or never returns.
//!
//! Optionally plays the guest as well: after start it can connect to the
//! guest log port and write a few log lines, and it can exit by itself after
//! a fixed lifetime.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use uuid::Uuid;
use uvmlite_shared::errors::{UvmError, UvmResult};

use super::{ComputeService, ComputeSystem, ExitReason, ExitStatus, HcsOp, SystemProperties};
use crate::hvsock::{HvSocketAddr, LoopbackHvSocket, ServiceId};
use crate::schema::{ModifySettingRequest, RequestType, merge_json};

/// Lifecycle of an emulated compute system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Created,
    Running,
    Stopped,
}

/// One journaled control-surface call.
#[derive(Debug, Clone)]
pub struct HcsCall {
    pub op: HcsOp,
    pub id: String,
    pub resource_path: Option<String>,
    pub at: DateTime<Utc>,
}

enum Fault {
    Fail(String),
    Stall,
}

struct GuestLogs {
    hvsock: LoopbackHvSocket,
    port: u32,
}

#[derive(Default)]
struct Settings {
    guest_lifetime: Option<Duration>,
    guest_logs: Option<GuestLogs>,
}

#[derive(Default)]
struct ServiceInner {
    systems: Mutex<HashMap<String, Arc<SystemEntry>>>,
    journal: Mutex<Vec<HcsCall>>,
    faults: Mutex<HashMap<HcsOp, VecDeque<Fault>>>,
    settings: Mutex<Settings>,
}

impl ServiceInner {
    /// Journal the call, then apply any queued fault.
    async fn enter(&self, op: HcsOp, id: &str, resource_path: Option<&str>) -> UvmResult<()> {
        self.journal.lock().push(HcsCall {
            op,
            id: id.to_string(),
            resource_path: resource_path.map(str::to_string),
            at: Utc::now(),
        });

        let fault = self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front);
        match fault {
            None => Ok(()),
            Some(Fault::Fail(message)) => {
                tracing::debug!(op = %op, id = %id, "Injected failure");
                Err(UvmError::Backend(message))
            }
            Some(Fault::Stall) => {
                tracing::debug!(op = %op, id = %id, "Injected stall");
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

struct SystemEntry {
    id: String,
    owner: String,
    runtime_id: Uuid,
    terminate_on_last_handle: bool,
    document: Mutex<Value>,
    state: Mutex<SystemState>,
    exit: watch::Sender<Option<ExitStatus>>,
    handles: AtomicUsize,
}

impl SystemEntry {
    /// Move to Stopped and wake waiters. Returns false if already stopped.
    fn stop(&self, reason: ExitReason) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SystemState::Stopped {
                return false;
            }
            *state = SystemState::Stopped;
        }
        self.exit.send_replace(Some(ExitStatus {
            reason,
            exited_at: Utc::now(),
        }));
        true
    }

    fn state(&self) -> SystemState {
        *self.state.lock()
    }
}

/// In-memory [`ComputeService`].
#[derive(Clone, Default)]
pub struct EmulatedComputeService {
    inner: Arc<ServiceInner>,
}

impl EmulatedComputeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Have every started system exit on its own after `lifetime`.
    pub fn with_guest_lifetime(self, lifetime: Duration) -> Self {
        self.inner.settings.lock().guest_lifetime = Some(lifetime);
        self
    }

    /// Have every started system connect to its log port and write logs.
    pub fn with_guest_logs(self, hvsock: LoopbackHvSocket, port: u32) -> Self {
        self.inner.settings.lock().guest_logs = Some(GuestLogs { hvsock, port });
        self
    }

    /// Fail the next call of kind `op`.
    pub fn fail_next(&self, op: HcsOp) {
        self.fail_next_with(op, format!("injected {op} failure"));
    }

    pub fn fail_next_with(&self, op: HcsOp, message: impl Into<String>) {
        self.queue(op, Fault::Fail(message.into()));
    }

    /// Make the next call of kind `op` hang until its caller gives up.
    pub fn stall_next(&self, op: HcsOp) {
        self.queue(op, Fault::Stall);
    }

    fn queue(&self, op: HcsOp, fault: Fault) {
        self.inner
            .faults
            .lock()
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<HcsCall> {
        self.inner.journal.lock().clone()
    }

    /// The kinds of calls received so far, in order.
    pub fn ops(&self) -> Vec<HcsOp> {
        self.inner.journal.lock().iter().map(|c| c.op).collect()
    }

    pub fn count(&self, op: HcsOp) -> usize {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    /// The service's copy of a system's document, with applied modifications.
    pub fn document(&self, id: &str) -> Option<Value> {
        let entry = self.inner.systems.lock().get(id).cloned()?;
        let doc = entry.document.lock().clone();
        Some(doc)
    }

    pub fn state(&self, id: &str) -> Option<SystemState> {
        self.inner.systems.lock().get(id).map(|e| e.state())
    }

    pub fn runtime_id(&self, id: &str) -> Option<Uuid> {
        self.inner.systems.lock().get(id).map(|e| e.runtime_id)
    }

    /// Number of open handles to a system.
    pub fn open_handles(&self, id: &str) -> usize {
        self.inner
            .systems
            .lock()
            .get(id)
            .map_or(0, |e| e.handles.load(Ordering::SeqCst))
    }

    /// Simulate the guest shutting down. Returns false if the system is
    /// unknown or already stopped.
    pub fn exit_guest(&self, id: &str) -> bool {
        let entry = self.inner.systems.lock().get(id).cloned();
        entry.is_some_and(|e| e.stop(ExitReason::GuestExit))
    }
}

#[async_trait]
impl ComputeService for EmulatedComputeService {
    async fn create(&self, id: &str, document: &Value) -> UvmResult<Box<dyn ComputeSystem>> {
        self.inner.enter(HcsOp::Create, id, None).await?;

        if !document.get("VirtualMachine").is_some_and(Value::is_object) {
            return Err(UvmError::Backend(
                "invalid configuration document: VirtualMachine is missing".into(),
            ));
        }

        let (exit, _) = watch::channel(None);
        let entry = Arc::new(SystemEntry {
            id: id.to_string(),
            owner: document
                .get("Owner")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            runtime_id: Uuid::new_v4(),
            terminate_on_last_handle: document
                .get("ShouldTerminateOnLastHandleClosed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            document: Mutex::new(document.clone()),
            state: Mutex::new(SystemState::Created),
            exit,
            handles: AtomicUsize::new(0),
        });

        {
            let mut systems = self.inner.systems.lock();
            if systems
                .get(id)
                .is_some_and(|e| e.state() != SystemState::Stopped)
            {
                return Err(UvmError::Backend(format!(
                    "compute system '{id}' already exists"
                )));
            }
            systems.insert(id.to_string(), Arc::clone(&entry));
        }

        tracing::debug!(
            id = %id,
            runtime_id = %entry.runtime_id,
            "Emulated compute system created"
        );

        Ok(Box::new(EmulatedSystem::open(Arc::clone(&self.inner), entry)))
    }
}

/// Handle to an emulated compute system.
struct EmulatedSystem {
    service: Arc<ServiceInner>,
    entry: Arc<SystemEntry>,
}

impl EmulatedSystem {
    fn open(service: Arc<ServiceInner>, entry: Arc<SystemEntry>) -> Self {
        entry.handles.fetch_add(1, Ordering::SeqCst);
        Self { service, entry }
    }

    fn spawn_guest(&self) {
        let settings = self.service.settings.lock();

        if let Some(lifetime) = settings.guest_lifetime {
            let entry = Arc::clone(&self.entry);
            tokio::spawn(async move {
                tokio::time::sleep(lifetime).await;
                if entry.stop(ExitReason::GuestExit) {
                    tracing::debug!(id = %entry.id, "Emulated guest exited");
                }
            });
        }

        if let Some(logs) = &settings.guest_logs {
            let hvsock = logs.hvsock.clone();
            let addr = HvSocketAddr {
                vm_id: self.entry.runtime_id,
                service_id: ServiceId::from_port(logs.port),
            };
            let id = self.entry.id.clone();
            tokio::spawn(async move { write_guest_logs(hvsock, addr, id).await });
        }
    }
}

async fn write_guest_logs(hvsock: LoopbackHvSocket, addr: HvSocketAddr, id: String) {
    let mut stream = match hvsock.connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(id = %id, error = %e, "Emulated guest could not reach log port");
            return;
        }
    };

    let lines = [
        json!({"level": "info", "msg": "gcs started", "uvm": id}),
        json!({"level": "debug", "msg": "waiting for host connection", "uvm": id}),
    ];
    for line in lines {
        let mut text = line.to_string();
        text.push('\n');
        if let Err(e) = stream.write_all(text.as_bytes()).await {
            tracing::debug!(id = %id, error = %e, "Emulated guest log write failed");
            return;
        }
    }
    let _ = stream.shutdown().await;
}

#[async_trait]
impl ComputeSystem for EmulatedSystem {
    fn id(&self) -> &str {
        &self.entry.id
    }

    async fn start(&self) -> UvmResult<()> {
        self.service.enter(HcsOp::Start, &self.entry.id, None).await?;

        {
            let mut state = self.entry.state.lock();
            if *state != SystemState::Created {
                return Err(UvmError::Backend(format!(
                    "compute system '{}' cannot start from {:?}",
                    self.entry.id, *state
                )));
            }
            *state = SystemState::Running;
        }

        self.spawn_guest();
        Ok(())
    }

    async fn terminate(&self) -> UvmResult<()> {
        self.service
            .enter(HcsOp::Terminate, &self.entry.id, None)
            .await?;
        if self.entry.stop(ExitReason::Terminated) {
            tracing::debug!(id = %self.entry.id, "Emulated compute system terminated");
        }
        Ok(())
    }

    async fn wait(&self) -> UvmResult<ExitStatus> {
        self.service.enter(HcsOp::Wait, &self.entry.id, None).await?;

        let mut rx = self.entry.exit.subscribe();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => status.clone(),
            Err(_) => return Err(UvmError::Backend("compute system went away".into())),
        };
        status.ok_or_else(|| UvmError::Internal("exit status missing after wake".into()))
    }

    async fn properties(&self) -> UvmResult<SystemProperties> {
        self.service
            .enter(HcsOp::Properties, &self.entry.id, None)
            .await?;
        Ok(SystemProperties {
            id: self.entry.id.clone(),
            runtime_id: self.entry.runtime_id,
            owner: self.entry.owner.clone(),
            state: format!("{:?}", self.entry.state()),
        })
    }

    async fn modify(&self, request: &ModifySettingRequest) -> UvmResult<()> {
        self.service
            .enter(HcsOp::Modify, &self.entry.id, Some(&request.resource_path))
            .await?;

        if self.entry.state() == SystemState::Stopped {
            return Err(UvmError::Backend(format!(
                "compute system '{}' is stopped",
                self.entry.id
            )));
        }

        apply_modify(&mut self.entry.document.lock(), request)
    }
}

impl Drop for EmulatedSystem {
    fn drop(&mut self) {
        if self.entry.handles.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        if self.entry.terminate_on_last_handle && self.entry.stop(ExitReason::HandleClosed) {
            tracing::debug!(id = %self.entry.id, "Last handle closed, compute system terminated");
        }
    }
}

/// Apply a modify request to a document at its resource path.
fn apply_modify(document: &mut Value, request: &ModifySettingRequest) -> UvmResult<()> {
    let path = &request.resource_path;
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(UvmError::Backend("empty resource path".into()));
    };

    let mut node = document;
    for segment in parents {
        node = match node {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => {
                return Err(UvmError::Backend(format!(
                    "resource path '{path}' does not address an object"
                )));
            }
        };
    }

    let Value::Object(map) = node else {
        return Err(UvmError::Backend(format!(
            "resource path '{path}' does not address an object"
        )));
    };

    match request.request_type {
        RequestType::Add => {
            map.insert(last.to_string(), request.settings.clone());
        }
        RequestType::Remove => {
            if map.remove(*last).is_none() {
                return Err(UvmError::Backend(format!("resource '{path}' not found")));
            }
        }
        RequestType::Update => match map.get_mut(*last) {
            Some(existing) => merge_json(existing, &request.settings),
            None => return Err(UvmError::Backend(format!("resource '{path}' not found"))),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attachment;

    fn doc() -> Value {
        json!({
            "Owner": "tests",
            "ShouldTerminateOnLastHandleClosed": true,
            "VirtualMachine": {"Devices": {"Scsi": {"0": {}}}}
        })
    }

    #[tokio::test]
    async fn test_create_rejects_document_without_vm() {
        let svc = EmulatedComputeService::new();
        let err = svc.create("a", &json!({"Owner": "x"})).await.unwrap_err();
        assert!(err.to_string().contains("VirtualMachine"));
        assert_eq!(svc.count(HcsOp::Create), 1);
    }

    #[tokio::test]
    async fn test_duplicate_live_id_rejected() {
        let svc = EmulatedComputeService::new();
        let _first = svc.create("a", &doc()).await.unwrap();
        assert!(svc.create("a", &doc()).await.is_err());
    }

    #[tokio::test]
    async fn test_modify_applies_to_document() {
        let svc = EmulatedComputeService::new();
        let system = svc.create("a", &doc()).await.unwrap();
        let request = ModifySettingRequest::add(
            "VirtualMachine/Devices/Scsi/0/Attachments/1",
            &Attachment {
                kind: "VirtualDisk".into(),
                path: "d.vhdx".into(),
                read_only: true,
            },
        )
        .unwrap();
        system.modify(&request).await.unwrap();

        let stored = svc.document("a").unwrap();
        assert_eq!(
            stored["VirtualMachine"]["Devices"]["Scsi"]["0"]["Attachments"]["1"]["Path"],
            "d.vhdx"
        );
        let calls = svc.calls();
        assert_eq!(
            calls.last().unwrap().resource_path.as_deref(),
            Some("VirtualMachine/Devices/Scsi/0/Attachments/1")
        );
    }

    #[tokio::test]
    async fn test_fail_next_is_consumed_once() {
        let svc = EmulatedComputeService::new();
        let system = svc.create("a", &doc()).await.unwrap();
        svc.fail_next(HcsOp::Properties);
        assert!(system.properties().await.is_err());
        assert!(system.properties().await.is_ok());
    }

    #[tokio::test]
    async fn test_terminate_wakes_waiter() {
        let svc = EmulatedComputeService::new();
        let system: Arc<dyn ComputeSystem> = Arc::from(svc.create("a", &doc()).await.unwrap());
        system.start().await.unwrap();

        let waiter = {
            let system = Arc::clone(&system);
            tokio::spawn(async move { system.wait().await })
        };
        tokio::task::yield_now().await;
        system.terminate().await.unwrap();

        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status.reason, ExitReason::Terminated);
        assert_eq!(svc.state("a"), Some(SystemState::Stopped));
    }

    #[tokio::test]
    async fn test_last_handle_close_terminates() {
        let svc = EmulatedComputeService::new();
        let system = svc.create("a", &doc()).await.unwrap();
        assert_eq!(svc.open_handles("a"), 1);
        drop(system);
        assert_eq!(svc.open_handles("a"), 0);
        assert_eq!(svc.state("a"), Some(SystemState::Stopped));

        // A stopped id can be reused.
        assert!(svc.create("a", &doc()).await.is_ok());
    }

    #[tokio::test]
    async fn test_guest_lifetime_exits() {
        let svc = EmulatedComputeService::new().with_guest_lifetime(Duration::from_millis(10));
        let system = svc.create("a", &doc()).await.unwrap();
        system.start().await.unwrap();
        let status = system.wait().await.unwrap();
        assert_eq!(status.reason, ExitReason::GuestExit);
    }

    #[test]
    fn test_apply_modify_remove_and_update() {
        let mut value = json!({"A": {"B": {"C": 1, "D": 2}}});
        let update = ModifySettingRequest {
            resource_path: "A/B".into(),
            request_type: RequestType::Update,
            settings: json!({"C": 5}),
        };
        apply_modify(&mut value, &update).unwrap();
        assert_eq!(value, json!({"A": {"B": {"C": 5, "D": 2}}}));

        apply_modify(&mut value, &ModifySettingRequest::remove("A/B/D")).unwrap();
        assert_eq!(value, json!({"A": {"B": {"C": 5}}}));
        assert!(apply_modify(&mut value, &ModifySettingRequest::remove("A/B/D")).is_err());
    }
}
