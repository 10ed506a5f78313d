//! Utility VM lifecycle and device configuration.
//!
//! ## Architecture
//!
//! - `utility_vm`: the VM descriptor and its collaborators
//! - `lifecycle`: create/start/stop/wait and the phase guards
//! - `devices`: document mutators and live modify requests
//! - `rollback`: cleanup of a half-created compute system
//! - `log_forward`: guest log forwarding task started with the VM
//!
//! Callers that only need some features go through the capability traits
//! below; [`Uvm::capabilities`] says which ones a VM supports and the `as_*`
//! accessors hand them out.

mod devices;
mod lifecycle;
mod log_forward;
mod rollback;
mod utility_vm;

pub use utility_vm::{UtilityVm, UvmServices};

use std::fmt;

use async_trait::async_trait;
use bitflags::bitflags;
use uuid::Uuid;
use uvmlite_shared::errors::{UvmError, UvmResult};

use crate::context::OpContext;
use crate::hcs::ExitStatus;
use crate::hvsock::{HvSocketListener, ServiceId};

// ============================================================================
// STATE
// ============================================================================

/// Lifecycle phase of a utility VM. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    PreCreated,
    Created,
    Running,
    Terminated,
}

impl State {
    /// Document mutators are legal.
    pub fn is_pre_created(&self) -> bool {
        matches!(self, State::PreCreated)
    }

    /// A compute system exists and accepts modify requests.
    pub fn is_live(&self) -> bool {
        matches!(self, State::Created | State::Running)
    }

    /// A compute system handle is held.
    pub fn has_system(&self) -> bool {
        !matches!(self, State::PreCreated)
    }

    pub fn can_create(&self) -> bool {
        matches!(self, State::PreCreated)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, State::Created)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, State::Running)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::PreCreated => "PreCreated",
            State::Created => "Created",
            State::Running => "Running",
            State::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

// ============================================================================
// DEVICE TAGS
// ============================================================================

/// Raw SCSI attachment kind. Only the associated constants are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScsiDiskType(pub u8);

impl ScsiDiskType {
    pub const VIRTUAL_DISK: Self = Self(0);
    pub const PASS_THROUGH: Self = Self(1);

    /// Schema name of the attachment kind.
    pub fn schema_name(self) -> UvmResult<&'static str> {
        match self {
            Self::VIRTUAL_DISK => Ok("VirtualDisk"),
            Self::PASS_THROUGH => Ok("PassThru"),
            Self(other) => Err(UvmError::Unsupported(format!(
                "unsupported SCSI disk type: {other}"
            ))),
        }
    }
}

/// Raw VPMem image format. Only the associated constants are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VpMemImageFormat(pub u8);

impl VpMemImageFormat {
    pub const VHD1: Self = Self(0);
    pub const VHDX: Self = Self(1);

    pub fn schema_name(self) -> UvmResult<&'static str> {
        match self {
            Self::VHD1 => Ok("Vhd1"),
            Self::VHDX => Ok("Vhdx"),
            Self(other) => Err(UvmError::Unsupported(format!(
                "unsupported VPMem image format: {other}"
            ))),
        }
    }

    /// Pick the format from a file name: `.vhdx` is VHDX, anything else VHD1.
    pub fn from_path(path: &str) -> Self {
        let is_vhdx = std::path::Path::new(path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("vhdx"));
        if is_vhdx { Self::VHDX } else { Self::VHD1 }
    }
}

/// How guest memory is backed on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryBackingType {
    /// Host virtual memory; allows overcommit.
    #[default]
    Virtual,
    /// Pinned physical memory.
    Physical,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryConfig {
    pub backing_type: MemoryBackingType,
    pub deferred_commit: bool,
    pub hot_hint: bool,
    pub cold_hint: bool,
    pub cold_discard_hint: bool,
}

bitflags! {
    /// Features a VM backend implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const MEMORY = 1 << 0;
        const MEMORY_CONFIG = 1 << 1;
        const MMIO = 1 << 2;
        const PROCESSOR = 1 << 3;
        const SCSI = 1 << 4;
        const VPMEM = 1 << 5;
        const UEFI_BOOT = 1 << 6;
        const LINUX_BOOT = 1 << 7;
        const HVSOCKET = 1 << 8;
        const NETWORK = 1 << 9;
        const COM_PORT = 1 << 10;
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// A utility VM: identity, lifecycle and capability discovery.
#[async_trait]
pub trait Uvm: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> State;

    /// Create the compute system from the configuration document.
    async fn create(&mut self, ctx: &OpContext) -> UvmResult<()>;

    async fn start(&mut self, ctx: &OpContext) -> UvmResult<()>;

    /// Terminate a running VM.
    async fn stop(&mut self, ctx: &OpContext) -> UvmResult<()>;

    /// Block until the compute system exits. The VM is Terminated afterwards.
    async fn wait(&mut self, ctx: &OpContext) -> UvmResult<ExitStatus>;

    fn capabilities(&self) -> Capabilities;

    fn as_memory(&mut self) -> Option<&mut dyn MemoryControl> {
        None
    }

    fn as_memory_config(&mut self) -> Option<&mut dyn MemoryConfigControl> {
        None
    }

    fn as_mmio(&mut self) -> Option<&mut dyn MmioConfigControl> {
        None
    }

    fn as_processor(&mut self) -> Option<&mut dyn ProcessorControl> {
        None
    }

    fn as_scsi(&mut self) -> Option<&mut dyn Scsi> {
        None
    }

    fn as_vpmem(&mut self) -> Option<&mut dyn VpMem> {
        None
    }

    fn as_uefi_boot(&mut self) -> Option<&mut dyn UefiBoot> {
        None
    }

    fn as_linux_boot(&mut self) -> Option<&mut dyn LinuxBoot> {
        None
    }

    fn as_hvsocket(&mut self) -> Option<&mut dyn HvSocketListen> {
        None
    }

    fn as_network(&mut self) -> Option<&mut dyn Network> {
        None
    }

    fn as_com_port(&mut self) -> Option<&mut dyn ComPortControl> {
        None
    }
}

#[async_trait]
pub trait MemoryControl: Send {
    /// Guest memory size in MB.
    async fn set_memory_limit(&mut self, ctx: &OpContext, memory_mb: u64) -> UvmResult<()>;
}

#[async_trait]
pub trait MemoryConfigControl: Send {
    async fn set_memory_config(&mut self, ctx: &OpContext, config: &MemoryConfig) -> UvmResult<()>;
}

#[async_trait]
pub trait MmioConfigControl: Send {
    /// MMIO gaps and base, all in MB.
    async fn set_mmio_config(
        &mut self,
        ctx: &OpContext,
        low_gap_mb: u64,
        high_base_mb: u64,
        high_gap_mb: u64,
    ) -> UvmResult<()>;
}

#[async_trait]
pub trait ProcessorControl: Send {
    async fn set_processor_count(&mut self, ctx: &OpContext, count: u64) -> UvmResult<()>;
}

#[async_trait]
pub trait Scsi: Send {
    async fn add_scsi_controller(&mut self, ctx: &OpContext, controller: u32) -> UvmResult<()>;

    /// Attach a disk. Disks are hot-attached once the VM exists.
    async fn add_scsi_disk(
        &mut self,
        ctx: &OpContext,
        controller: u32,
        lun: u32,
        path: &str,
        kind: ScsiDiskType,
        read_only: bool,
    ) -> UvmResult<()>;
}

#[async_trait]
pub trait VpMem: Send {
    async fn add_vpmem_controller(
        &mut self,
        ctx: &OpContext,
        maximum_devices: u32,
        maximum_size_bytes: u64,
    ) -> UvmResult<()>;

    async fn add_vpmem_device(
        &mut self,
        ctx: &OpContext,
        id: u32,
        path: &str,
        read_only: bool,
        format: VpMemImageFormat,
    ) -> UvmResult<()>;
}

#[async_trait]
pub trait UefiBoot: Send {
    /// Boot `kernel` from `dir` through UEFI with `cmd` as boot options.
    async fn set_uefi_boot(&mut self, ctx: &OpContext, dir: &str, kernel: &str, cmd: &str) -> UvmResult<()>;
}

#[async_trait]
pub trait LinuxBoot: Send {
    async fn set_linux_kernel_direct_boot(
        &mut self,
        ctx: &OpContext,
        kernel: &str,
        initrd: &str,
        cmd: &str,
    ) -> UvmResult<()>;
}

#[async_trait]
pub trait HvSocketListen: Send {
    /// Listen on `service_id` inside this VM's runtime id.
    async fn hvsocket_listen(
        &mut self,
        ctx: &OpContext,
        service_id: ServiceId,
    ) -> UvmResult<Box<dyn HvSocketListener>>;
}

#[async_trait]
pub trait Network: Send {
    async fn add_nic(&mut self, ctx: &OpContext, nic_id: Uuid, endpoint_id: &str, mac: &str) -> UvmResult<()>;
}

#[async_trait]
pub trait ComPortControl: Send {
    async fn set_com_port(&mut self, ctx: &OpContext, port: u32, named_pipe: &str) -> UvmResult<()>;
}
