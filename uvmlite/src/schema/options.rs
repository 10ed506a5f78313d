//! Functional options for building a Linux utility VM document.
//!
//! Each option is a boxed closure over [`ComputeSystemDoc`]; options are
//! applied in order, so a later option overrides whatever an earlier one set
//! on the same field.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uvmlite_shared::constants::{hvsocket, lcow, vpmem};

use super::{
    ComPort, ComputeSystemDoc, EnhancedModeVideo, GuestConnection, HvSocket,
    HvSocketSystemConfig, Keyboard, LinuxKernelDirect, Processor, Scsi, SchemaVersion, Uefi,
    UefiBootEntry, VideoMonitor, VirtualMachine, VirtualPMemController, VirtualPMemDevice,
    VirtualSmb, VirtualSmbShare, VirtualSmbShareOptions,
};

/// A deferred modification of a configuration document.
pub type SchemaOpt = Box<dyn FnOnce(&mut ComputeSystemDoc) + Send>;

/// Where the guest root filesystem comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredRootFsType {
    /// Boot from an initial ramdisk.
    #[default]
    InitRd,
    /// Boot from a read-only VHD exposed as VPMem device 0.
    Vhd,
}

impl PreferredRootFsType {
    /// Map the numeric form used on the command line (0 or 1).
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::InitRd),
            1 => Some(Self::Vhd),
            _ => None,
        }
    }

    pub fn default_file(self) -> &'static str {
        match self {
            Self::InitRd => lcow::INITRD_FILE,
            Self::Vhd => lcow::VHD_FILE,
        }
    }
}

// ============================================================================
// KERNEL COMMAND LINE
// ============================================================================

/// A fragment of the kernel command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOpt {
    PMemBoot,
    InitRdBoot,
    /// A single kernel argument, written as given.
    Arg(String),
    /// Everything after `--`, handed to the guest init.
    InitArgs(String),
}

impl KernelOpt {
    fn render(&self) -> String {
        match self {
            KernelOpt::PMemBoot => "root=/dev/pmem0 ro init=/init".to_string(),
            KernelOpt::InitRdBoot => format!("initrd=/{}", lcow::INITRD_FILE),
            KernelOpt::Arg(arg) => arg.clone(),
            KernelOpt::InitArgs(args) => format!("-- {args}"),
        }
    }
}

/// Join kernel options with single spaces, in the order given.
pub fn create_kernel_command_line(opts: &[KernelOpt]) -> String {
    opts.iter()
        .map(KernelOpt::render)
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// SCHEMA OPTIONS
// ============================================================================

pub fn with_owner(owner: impl Into<String>) -> SchemaOpt {
    let owner = owner.into();
    Box::new(move |doc| doc.owner = owner)
}

pub fn with_processor_config(count: i32) -> SchemaOpt {
    Box::new(move |doc| {
        doc.topology_mut().processor = Some(Processor { count });
    })
}

/// Replace the memory section wholesale.
pub fn with_memory_config(size_mb: i32, allow_overcommit: bool, deferred_commit: bool) -> SchemaOpt {
    Box::new(move |doc| {
        doc.topology_mut().memory = Some(super::Memory {
            size_in_mb: size_mb,
            allow_overcommit,
            enable_deferred_commit: deferred_commit,
            ..Default::default()
        });
    })
}

/// Declare the VPMem controller. Size is given in MB.
pub fn with_vpmem_controller(count: u32, size_mb: u64) -> SchemaOpt {
    Box::new(move |doc| {
        doc.devices_mut().virtual_p_mem = Some(VirtualPMemController {
            devices: BTreeMap::new(),
            maximum_count: count,
            maximum_size_bytes: size_mb * 1024 * 1024,
        });
    })
}

/// Declare `count` SCSI controllers with empty attachment tables.
pub fn with_scsi(count: u32) -> SchemaOpt {
    Box::new(move |doc| {
        doc.devices_mut().scsi = (0..count)
            .map(|i| (i.to_string(), Scsi::default()))
            .collect();
    })
}

pub fn with_guest_connection() -> SchemaOpt {
    Box::new(|doc| {
        doc.vm_mut().guest_connection = Some(GuestConnection {
            use_vsock: true,
            use_connected_suspend: true,
        });
    })
}

pub fn with_hvsocket(sddl: impl Into<String>) -> SchemaOpt {
    let sddl = sddl.into();
    Box::new(move |doc| {
        doc.devices_mut().hv_socket = Some(HvSocket {
            hv_socket_config: Some(HvSocketSystemConfig {
                default_bind_security_descriptor: sddl,
            }),
        });
    })
}

pub fn with_com_port(port_id: impl Into<String>, named_pipe: impl Into<String>) -> SchemaOpt {
    let port_id = port_id.into();
    let named_pipe = named_pipe.into();
    Box::new(move |doc| {
        doc.devices_mut()
            .com_ports
            .insert(port_id, ComPort { named_pipe });
    })
}

/// Boot configuration for a Linux utility VM.
///
/// Direct boot points the chipset at the kernel (and initrd) on the host.
/// UEFI boot exposes `boot_files_path` as the read-only `os` share and boots
/// `\kernel` from it. A VHD root adds the image as VPMem device 0, which
/// requires the VPMem controller to be declared by an earlier option.
pub fn with_lcow_kernel_boot_config(
    boot_files_path: impl Into<String>,
    root_fs_type: PreferredRootFsType,
    kernel_direct: bool,
    kernel_cmd_line: impl Into<String>,
) -> SchemaOpt {
    let boot_files_path = boot_files_path.into();
    let kernel_cmd_line = kernel_cmd_line.into();
    Box::new(move |doc| {
        let boot_file = |name: &str| {
            Path::new(&boot_files_path)
                .join(name)
                .to_string_lossy()
                .into_owned()
        };

        if kernel_direct {
            let init_rd_path = match root_fs_type {
                PreferredRootFsType::InitRd => boot_file(lcow::INITRD_FILE),
                PreferredRootFsType::Vhd => String::new(),
            };
            doc.chipset_mut().linux_kernel_direct = Some(LinuxKernelDirect {
                kernel_file_path: boot_file(lcow::KERNEL_FILE),
                init_rd_path,
                kernel_cmd_line: kernel_cmd_line.clone(),
            });
        } else {
            doc.devices_mut().virtual_smb = Some(os_share(&boot_files_path));
            doc.chipset_mut().uefi = Some(Uefi {
                boot_this: Some(UefiBootEntry {
                    device_path: format!("\\{}", lcow::KERNEL_FILE),
                    device_type: lcow::UEFI_DEVICE_TYPE.to_string(),
                    vmb_fs_root_path: String::new(),
                    optional_data: kernel_cmd_line.clone(),
                }),
            });
        }

        if root_fs_type == PreferredRootFsType::Vhd {
            let vhd = VirtualPMemDevice {
                host_path: boot_file(lcow::VHD_FILE),
                read_only: true,
                image_format: "Vhd1".to_string(),
            };
            let controller = doc
                .devices_mut()
                .virtual_p_mem
                .get_or_insert_with(VirtualPMemController::default);
            controller.devices = BTreeMap::from([("0".to_string(), vhd)]);
        }
    })
}

/// Expose `boot_files_path` to UEFI as the read-only `os` share.
pub fn with_boot_files_share(boot_files_path: impl Into<String>) -> SchemaOpt {
    let boot_files_path = boot_files_path.into();
    Box::new(move |doc| {
        doc.devices_mut().virtual_smb = Some(os_share(&boot_files_path));
    })
}

/// Keyboard and video devices for an interactive console.
pub fn with_graphics_console() -> SchemaOpt {
    Box::new(|doc| {
        let devices = doc.devices_mut();
        devices.keyboard = Some(Keyboard {});
        devices.enhanced_mode_video = Some(EnhancedModeVideo {});
        devices.video_monitor = Some(VideoMonitor {});
    })
}

fn os_share(boot_files_path: &str) -> VirtualSmb {
    VirtualSmb {
        shares: vec![VirtualSmbShare {
            name: lcow::OS_SHARE_NAME.to_string(),
            path: boot_files_path.to_string(),
            options: Some(VirtualSmbShareOptions {
                read_only: true,
                take_backup_privilege: true,
                cache_io: true,
                share_read: true,
            }),
        }],
    }
}

/// The option set a Linux utility VM starts from.
pub fn default_lcow_options(owner: impl Into<String>, processors: i32) -> Vec<SchemaOpt> {
    vec![
        with_owner(owner),
        with_processor_config(processors),
        with_memory_config(lcow::DEFAULT_MEMORY_MB as i32, true, false),
        with_vpmem_controller(vpmem::DEFAULT_COUNT, vpmem::DEFAULT_SIZE_BYTES / (1024 * 1024)),
        with_scsi(1),
        with_guest_connection(),
        with_hvsocket(hvsocket::DEFAULT_BIND_SDDL),
    ]
}

/// Build a schema 2.1 document from empty chipset, topology and device
/// sections, then apply `opts` in order.
pub fn create_schema_lcow(opts: impl IntoIterator<Item = SchemaOpt>) -> ComputeSystemDoc {
    let mut doc = ComputeSystemDoc {
        schema_version: Some(SchemaVersion::v21()),
        virtual_machine: Some(VirtualMachine {
            chipset: Some(Default::default()),
            compute_topology: Some(Default::default()),
            devices: Some(Default::default()),
            ..Default::default()
        }),
        ..Default::default()
    };
    apply(&mut doc, opts);
    doc
}

/// Apply options to an existing document.
pub fn apply(doc: &mut ComputeSystemDoc, opts: impl IntoIterator<Item = SchemaOpt>) {
    for opt in opts {
        opt(doc);
    }
}
