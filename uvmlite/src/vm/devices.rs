//! Device and topology mutators.
//!
//! Before create every mutator edits the configuration document. Once the
//! compute system exists, the ones that support hot-add send a modify
//! request instead; the rest fail with a phase error. The phase is always
//! checked before arguments are validated.

use async_trait::async_trait;
use uuid::Uuid;
use uvmlite_shared::constants::{host, lcow, resource_paths};
use uvmlite_shared::errors::{UvmError, UvmResult};

use super::utility_vm::UtilityVm;
use super::{
    ComPortControl, HvSocketListen, LinuxBoot, MemoryBackingType, MemoryConfig,
    MemoryConfigControl, MemoryControl, MmioConfigControl, Network, ProcessorControl, Scsi,
    ScsiDiskType, UefiBoot, VpMem, VpMemImageFormat,
};
use crate::context::OpContext;
use crate::hcs::{ComputeSystem, HcsOp};
use crate::hvsock::{HvSocketAddr, HvSocketListener, ServiceId};
use crate::schema::{
    Attachment, ComPort, LinuxKernelDirect, ModifySettingRequest, NetworkAdapter, Uefi,
    UefiBootEntry, VirtualPMemController, VirtualPMemDevice,
};

impl UtilityVm {
    /// Send a modify request to the live compute system.
    async fn send_modify(
        &self,
        ctx: &OpContext,
        system: &dyn ComputeSystem,
        request: ModifySettingRequest,
    ) -> UvmResult<()> {
        tracing::debug!(
            uvm_id = %self.id,
            resource_path = %request.resource_path,
            request_type = ?request.request_type,
            "Sending modify request"
        );
        ctx.run(HcsOp::Modify.as_str(), async {
            system
                .modify(&request)
                .await
                .map_err(|e| self.hcs_error(HcsOp::Modify, Some(&request.resource_path), e))
        })
        .await
    }

    /// Fail unless the VM is PreCreated, Created or Running.
    fn ensure_not_terminated(&self) -> UvmResult<()> {
        if self.state.is_pre_created() || self.state.is_live() {
            Ok(())
        } else {
            Err(self.wrong_state("pre-created, created or running"))
        }
    }

    fn has_vpmem_controller(&self) -> bool {
        self.doc
            .devices()
            .is_some_and(|devices| devices.virtual_p_mem.is_some())
    }
}

/// Reject values the document cannot carry as a signed 32-bit count.
fn positive_i32(what: &str, value: u64) -> UvmResult<i32> {
    match i32::try_from(value) {
        Ok(v) if v >= 1 => Ok(v),
        _ => Err(UvmError::InvalidArgument(format!(
            "{what} must be between 1 and {}, got {value}",
            i32::MAX
        ))),
    }
}

fn bounded_mmio(what: &str, value: u64) -> UvmResult<u64> {
    if value > i32::MAX as u64 {
        return Err(UvmError::InvalidArgument(format!(
            "{what} must not exceed {} MB, got {value}",
            i32::MAX
        )));
    }
    Ok(value)
}

// ============================================================================
// TOPOLOGY
// ============================================================================

#[async_trait]
impl MemoryControl for UtilityVm {
    async fn set_memory_limit(&mut self, _ctx: &OpContext, memory_mb: u64) -> UvmResult<()> {
        self.ensure_pre_created()?;
        let size_in_mb = positive_i32("memory size in MB", memory_mb)?;

        self.doc.memory_mut().size_in_mb = size_in_mb;
        tracing::debug!(uvm_id = %self.id, memory_mb, "Set memory limit");
        Ok(())
    }
}

#[async_trait]
impl MemoryConfigControl for UtilityVm {
    async fn set_memory_config(&mut self, _ctx: &OpContext, config: &MemoryConfig) -> UvmResult<()> {
        self.ensure_pre_created()?;

        let memory = self.doc.memory_mut();
        memory.allow_overcommit = config.backing_type == MemoryBackingType::Virtual;
        memory.enable_deferred_commit = config.deferred_commit;
        memory.enable_hot_hint = config.hot_hint;
        memory.enable_cold_hint = config.cold_hint;
        memory.enable_cold_discard_hint = config.cold_discard_hint;
        tracing::debug!(uvm_id = %self.id, config = ?config, "Set memory config");
        Ok(())
    }
}

#[async_trait]
impl MmioConfigControl for UtilityVm {
    async fn set_mmio_config(
        &mut self,
        _ctx: &OpContext,
        low_gap_mb: u64,
        high_base_mb: u64,
        high_gap_mb: u64,
    ) -> UvmResult<()> {
        self.ensure_pre_created()?;
        let low_gap_mb = bounded_mmio("low MMIO gap", low_gap_mb)?;
        let high_base_mb = bounded_mmio("high MMIO base", high_base_mb)?;
        let high_gap_mb = bounded_mmio("high MMIO gap", high_gap_mb)?;

        let memory = self.doc.memory_mut();
        memory.low_mmio_gap_in_mb = low_gap_mb;
        memory.high_mmio_base_in_mb = high_base_mb;
        memory.high_mmio_gap_in_mb = high_gap_mb;
        tracing::debug!(uvm_id = %self.id, low_gap_mb, high_base_mb, high_gap_mb, "Set MMIO config");
        Ok(())
    }
}

#[async_trait]
impl ProcessorControl for UtilityVm {
    async fn set_processor_count(&mut self, _ctx: &OpContext, count: u64) -> UvmResult<()> {
        self.ensure_pre_created()?;
        let count = positive_i32("processor count", count)?;

        self.doc.processor_mut().count = count;
        tracing::debug!(uvm_id = %self.id, count, "Set processor count");
        Ok(())
    }
}

// ============================================================================
// STORAGE
// ============================================================================

#[async_trait]
impl Scsi for UtilityVm {
    async fn add_scsi_controller(&mut self, _ctx: &OpContext, controller: u32) -> UvmResult<()> {
        self.ensure_pre_created()?;

        self.doc
            .devices_mut()
            .scsi
            .insert(controller.to_string(), Default::default());
        tracing::debug!(uvm_id = %self.id, controller, "Added SCSI controller");
        Ok(())
    }

    async fn add_scsi_disk(
        &mut self,
        ctx: &OpContext,
        controller: u32,
        lun: u32,
        path: &str,
        kind: ScsiDiskType,
        read_only: bool,
    ) -> UvmResult<()> {
        if self.state.is_pre_created() {
            return Err(UvmError::NotImplemented(
                "SCSI disks can only be attached once the VM is created".into(),
            ));
        }
        let system = self.ensure_live()?;
        let kind = kind.schema_name()?;

        let resource_path = format!("{}/{controller}/Attachments/{lun}", resource_paths::SCSI);
        let attachment = Attachment {
            kind: kind.to_string(),
            path: path.to_string(),
            read_only,
        };
        let request = ModifySettingRequest::add(resource_path, &attachment)?;
        self.send_modify(ctx, system, request).await?;

        tracing::debug!(uvm_id = %self.id, controller, lun, path, "Attached SCSI disk");
        Ok(())
    }
}

#[async_trait]
impl VpMem for UtilityVm {
    async fn add_vpmem_controller(
        &mut self,
        _ctx: &OpContext,
        maximum_devices: u32,
        maximum_size_bytes: u64,
    ) -> UvmResult<()> {
        self.ensure_pre_created()?;

        self.doc.devices_mut().virtual_p_mem = Some(VirtualPMemController {
            devices: Default::default(),
            maximum_count: maximum_devices,
            maximum_size_bytes,
        });
        tracing::debug!(uvm_id = %self.id, maximum_devices, maximum_size_bytes, "Added VPMem controller");
        Ok(())
    }

    async fn add_vpmem_device(
        &mut self,
        ctx: &OpContext,
        id: u32,
        path: &str,
        read_only: bool,
        format: VpMemImageFormat,
    ) -> UvmResult<()> {
        self.ensure_not_terminated()?;
        if !self.has_vpmem_controller() {
            return Err(UvmError::MissingPrerequisite("VPMem controller".into()));
        }
        let device = VirtualPMemDevice {
            host_path: path.to_string(),
            read_only,
            image_format: format.schema_name()?.to_string(),
        };

        if self.state.is_pre_created() {
            if let Some(controller) = self.doc.devices_mut().virtual_p_mem.as_mut() {
                controller.devices.insert(id.to_string(), device);
            }
            tracing::debug!(uvm_id = %self.id, id, path, "Added VPMem device to document");
            return Ok(());
        }

        let system = self.ensure_live()?;
        let request =
            ModifySettingRequest::add(format!("{}/{id}", resource_paths::VPMEM_DEVICES), &device)?;
        self.send_modify(ctx, system, request).await?;

        tracing::debug!(uvm_id = %self.id, id, path, "Hot-added VPMem device");
        Ok(())
    }
}

// ============================================================================
// BOOT
// ============================================================================

#[async_trait]
impl UefiBoot for UtilityVm {
    async fn set_uefi_boot(&mut self, _ctx: &OpContext, dir: &str, kernel: &str, cmd: &str) -> UvmResult<()> {
        self.ensure_pre_created()?;

        self.doc.chipset_mut().uefi = Some(Uefi {
            boot_this: Some(UefiBootEntry {
                device_path: format!("\\{kernel}"),
                device_type: lcow::UEFI_DEVICE_TYPE.to_string(),
                vmb_fs_root_path: dir.to_string(),
                optional_data: cmd.to_string(),
            }),
        });
        tracing::debug!(uvm_id = %self.id, dir, kernel, "Set UEFI boot");
        Ok(())
    }
}

#[async_trait]
impl LinuxBoot for UtilityVm {
    async fn set_linux_kernel_direct_boot(
        &mut self,
        _ctx: &OpContext,
        kernel: &str,
        initrd: &str,
        cmd: &str,
    ) -> UvmResult<()> {
        self.ensure_pre_created()?;
        let os = self.services.os;
        if !os.supports_kernel_direct() {
            return Err(UvmError::Unsupported(format!(
                "kernel direct boot requires host build {} or later (host is {os})",
                host::MIN_KERNEL_DIRECT_BUILD
            )));
        }

        self.doc.chipset_mut().linux_kernel_direct = Some(LinuxKernelDirect {
            kernel_file_path: kernel.to_string(),
            init_rd_path: initrd.to_string(),
            kernel_cmd_line: cmd.to_string(),
        });
        tracing::debug!(uvm_id = %self.id, kernel, initrd, "Set kernel direct boot");
        Ok(())
    }
}

// ============================================================================
// CHANNELS
// ============================================================================

#[async_trait]
impl HvSocketListen for UtilityVm {
    async fn hvsocket_listen(
        &mut self,
        ctx: &OpContext,
        service_id: ServiceId,
    ) -> UvmResult<Box<dyn HvSocketListener>> {
        self.ensure_live()?;
        let vm_id = self.runtime_id.ok_or_else(|| {
            UvmError::Internal(format!("utility VM '{}' has no runtime id", self.id))
        })?;

        let addr = HvSocketAddr { vm_id, service_id };
        let listener = ctx.run("listen", self.services.hvsock.listen(addr)).await?;
        tracing::debug!(uvm_id = %self.id, addr = %addr, "Listening on host socket");
        Ok(listener)
    }
}

#[async_trait]
impl Network for UtilityVm {
    async fn add_nic(&mut self, ctx: &OpContext, nic_id: Uuid, endpoint_id: &str, mac: &str) -> UvmResult<()> {
        self.ensure_not_terminated()?;
        let adapter = NetworkAdapter {
            endpoint_id: endpoint_id.to_string(),
            mac_address: mac.to_string(),
        };

        if self.state.is_pre_created() {
            self.doc
                .devices_mut()
                .network_adapters
                .insert(nic_id.to_string(), adapter);
            tracing::debug!(uvm_id = %self.id, nic_id = %nic_id, "Added network adapter to document");
            return Ok(());
        }

        let system = self.ensure_live()?;
        let request = ModifySettingRequest::add(
            format!("{}/{nic_id}", resource_paths::NETWORK_ADAPTERS),
            &adapter,
        )?;
        self.send_modify(ctx, system, request).await?;

        tracing::debug!(uvm_id = %self.id, nic_id = %nic_id, "Hot-added network adapter");
        Ok(())
    }
}

#[async_trait]
impl ComPortControl for UtilityVm {
    async fn set_com_port(&mut self, _ctx: &OpContext, port: u32, named_pipe: &str) -> UvmResult<()> {
        self.ensure_pre_created()?;

        self.doc.devices_mut().com_ports.insert(
            port.to_string(),
            ComPort {
                named_pipe: named_pipe.to_string(),
            },
        );
        tracing::debug!(uvm_id = %self.id, port, named_pipe, "Set COM port");
        Ok(())
    }
}
