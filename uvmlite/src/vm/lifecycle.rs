//! Utility VM lifecycle
//!
//! Handles phase transitions, rollback of a failed create and the Drop hook.
//! Every transition checks the phase first and only moves forward once the
//! control-surface call succeeded.

use async_trait::async_trait;
use uuid::Uuid;
use uvmlite_shared::errors::UvmResult;

use super::rollback::CreateRollback;
use super::utility_vm::UtilityVm;
use super::{
    Capabilities, ComPortControl, HvSocketListen, LinuxBoot, MemoryConfigControl, MemoryControl,
    MmioConfigControl, Network, ProcessorControl, Scsi, State, UefiBoot, Uvm, VpMem, log_forward,
};
use crate::context::OpContext;
use crate::hcs::{ComputeSystem, ExitStatus, HcsOp};
use crate::hvsock::{HvSocketAddr, HvSocketListener, ServiceId};
use crate::trace::{Field, Span};

/// Create the compute system (PreCreated -> Created).
///
/// Once the service returned a handle, any later failure terminates and
/// waits on that handle before the error is returned, and the VM stays
/// PreCreated.
pub(super) async fn create(uvm: &mut UtilityVm, ctx: &OpContext) -> UvmResult<()> {
    if !uvm.state.can_create() {
        return Err(uvm.wrong_state("pre-created"));
    }
    ctx.check("create")?;

    let document = uvm.serialized_document()?;
    tracing::debug!(uvm_id = %uvm.id, owner = %uvm.owner, "Creating compute system");

    let compute = std::sync::Arc::clone(&uvm.services.compute);
    let system = ctx
        .run(HcsOp::Create.as_str(), async {
            compute
                .create(&uvm.id, &document)
                .await
                .map_err(|e| uvm.hcs_error(HcsOp::Create, None, e))
        })
        .await?;

    let rollback = CreateRollback::new(&uvm.id, system, uvm.services.sink.clone());
    let finished = match rollback.system() {
        Ok(system) => finish_create(uvm, system, ctx).await,
        Err(e) => Err(e),
    };

    match finished {
        Ok((runtime_id, listener)) => {
            uvm.system = Some(rollback.disarm()?);
            uvm.runtime_id = Some(runtime_id);
            uvm.log_listener = listener;
            uvm.state = State::Created;
            tracing::info!(uvm_id = %uvm.id, runtime_id = %runtime_id, "Utility VM created");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(uvm_id = %uvm.id, error = %e, "Create failed after compute system was created, rolling back");
            rollback.run().await;
            Err(e)
        }
    }
}

/// Steps after the compute system exists: resolve the runtime id and open
/// the guest log listener.
async fn finish_create(
    uvm: &UtilityVm,
    system: &dyn ComputeSystem,
    ctx: &OpContext,
) -> UvmResult<(Uuid, Option<Box<dyn HvSocketListener>>)> {
    let properties = ctx
        .run(HcsOp::Properties.as_str(), async {
            system
                .properties()
                .await
                .map_err(|e| uvm.hcs_error(HcsOp::Properties, None, e))
        })
        .await?;
    let runtime_id = properties.runtime_id;

    if !uvm.services.options.log_forwarding {
        return Ok((runtime_id, None));
    }

    let addr = HvSocketAddr {
        vm_id: runtime_id,
        service_id: ServiceId::from_port(uvm.services.options.log_port),
    };
    let hvsock = std::sync::Arc::clone(&uvm.services.hvsock);
    let listener = ctx.run("listen", hvsock.listen(addr)).await?;
    tracing::debug!(uvm_id = %uvm.id, addr = %addr, "Listening for guest logs");

    Ok((runtime_id, Some(listener)))
}

/// Start the compute system (Created -> Running) and hand the log listener
/// to the forwarding task.
pub(super) async fn start(uvm: &mut UtilityVm, ctx: &OpContext) -> UvmResult<()> {
    if !uvm.state.can_start() {
        return Err(uvm.wrong_state("created"));
    }
    ctx.check("start")?;

    {
        let system = uvm.live_system()?;
        ctx.run(HcsOp::Start.as_str(), async {
            system
                .start()
                .await
                .map_err(|e| uvm.hcs_error(HcsOp::Start, None, e))
        })
        .await?;
    }

    uvm.state = State::Running;

    if let Some(listener) = uvm.log_listener.take() {
        let span = uvm.span("uvm::ForwardGuestLogs");
        uvm.log_forwarder = Some(log_forward::spawn(listener, span));
    }

    tracing::info!(uvm_id = %uvm.id, "Utility VM started");
    Ok(())
}

/// Terminate a running VM (Running -> Terminated).
pub(super) async fn stop(uvm: &mut UtilityVm, ctx: &OpContext) -> UvmResult<()> {
    if !uvm.state.can_stop() {
        return Err(uvm.wrong_state("running"));
    }
    ctx.check("stop")?;

    {
        let system = uvm.live_system()?;
        ctx.run(HcsOp::Terminate.as_str(), async {
            system
                .terminate()
                .await
                .map_err(|e| uvm.hcs_error(HcsOp::Terminate, None, e))
        })
        .await?;
    }

    uvm.state = State::Terminated;
    tracing::info!(uvm_id = %uvm.id, "Utility VM stopped");
    Ok(())
}

/// Wait for the compute system to exit. A successful wait leaves the VM
/// Terminated whatever phase it was in.
pub(super) async fn wait(uvm: &mut UtilityVm, ctx: &OpContext) -> UvmResult<ExitStatus> {
    if !uvm.state.has_system() {
        return Err(uvm.wrong_state("created"));
    }

    let status = {
        let system = uvm.live_system()?;
        ctx.run(HcsOp::Wait.as_str(), async {
            system
                .wait()
                .await
                .map_err(|e| uvm.hcs_error(HcsOp::Wait, None, e))
        })
        .await?
    };

    if uvm.state != State::Terminated {
        tracing::debug!(uvm_id = %uvm.id, from = %uvm.state, reason = ?status.reason, "Compute system exited");
        uvm.state = State::Terminated;
    }
    Ok(status)
}

/// Drop hook: releases the handle and listener, never blocks.
pub(super) fn drop_handler(uvm: &mut UtilityVm) {
    if uvm.state.is_live() {
        tracing::debug!(uvm_id = %uvm.id, state = %uvm.state, "Dropping live utility VM, releasing compute system handle");
    } else {
        tracing::trace!(uvm_id = %uvm.id, state = %uvm.state, "UtilityVm dropped");
    }
    uvm.log_listener.take();
    uvm.system.take();
}

/// Write a `StateChanged` event on the operation span if the phase moved.
fn record_transition(uvm: &UtilityVm, span: &Span, from: State) {
    if uvm.state == from {
        return;
    }
    let mut fields = vec![Field::new("from", from), Field::new("to", uvm.state)];
    if let Some(runtime_id) = uvm.runtime_id {
        fields.push(Field::new("runtime_id", runtime_id));
    }
    span.info("StateChanged", fields);
}

// ============================================================================
// TRAIT WIRING
// ============================================================================

#[async_trait]
impl Uvm for UtilityVm {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> State {
        self.state
    }

    async fn create(&mut self, ctx: &OpContext) -> UvmResult<()> {
        let span = self.span("uvm::Create");
        let from = self.state;
        let result = create(self, ctx).await;
        record_transition(self, &span, from);
        span.end_with(&result);
        result
    }

    async fn start(&mut self, ctx: &OpContext) -> UvmResult<()> {
        let span = self.span("uvm::Start");
        let from = self.state;
        let result = start(self, ctx).await;
        record_transition(self, &span, from);
        span.end_with(&result);
        result
    }

    async fn stop(&mut self, ctx: &OpContext) -> UvmResult<()> {
        let span = self.span("uvm::Stop");
        let from = self.state;
        let result = stop(self, ctx).await;
        record_transition(self, &span, from);
        span.end_with(&result);
        result
    }

    async fn wait(&mut self, ctx: &OpContext) -> UvmResult<ExitStatus> {
        let span = self.span("uvm::Wait");
        let from = self.state;
        let result = wait(self, ctx).await;
        record_transition(self, &span, from);
        if let Ok(status) = &result {
            let reason = format!("{:?}", status.reason);
            span.debug("ComputeSystemExited", vec![Field::new("reason", reason)]);
        }
        span.end_with(&result);
        result
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn as_memory(&mut self) -> Option<&mut dyn MemoryControl> {
        Some(self)
    }

    fn as_memory_config(&mut self) -> Option<&mut dyn MemoryConfigControl> {
        Some(self)
    }

    fn as_mmio(&mut self) -> Option<&mut dyn MmioConfigControl> {
        Some(self)
    }

    fn as_processor(&mut self) -> Option<&mut dyn ProcessorControl> {
        Some(self)
    }

    fn as_scsi(&mut self) -> Option<&mut dyn Scsi> {
        Some(self)
    }

    fn as_vpmem(&mut self) -> Option<&mut dyn VpMem> {
        Some(self)
    }

    fn as_uefi_boot(&mut self) -> Option<&mut dyn UefiBoot> {
        Some(self)
    }

    fn as_linux_boot(&mut self) -> Option<&mut dyn LinuxBoot> {
        Some(self)
    }

    fn as_hvsocket(&mut self) -> Option<&mut dyn HvSocketListen> {
        Some(self)
    }

    fn as_network(&mut self) -> Option<&mut dyn Network> {
        Some(self)
    }

    fn as_com_port(&mut self) -> Option<&mut dyn ComPortControl> {
        Some(self)
    }
}
