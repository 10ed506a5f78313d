//! Utility VM constants.
//!
//! Centralized location for schema, device and host-socket defaults.

/// Compute system schema version written into every document.
pub mod schema {
    pub const VERSION_MAJOR: u32 = 2;
    pub const VERSION_MINOR: u32 = 1;
}

/// Modify request resource paths.
pub mod resource_paths {
    pub const SCSI: &str = "VirtualMachine/Devices/Scsi";
    pub const VPMEM_DEVICES: &str = "VirtualMachine/Devices/VirtualPMem/Devices";
    pub const NETWORK_ADAPTERS: &str = "VirtualMachine/Devices/NetworkAdapters";
}

/// Pluggable memory (VPMem) limits.
pub mod vpmem {
    /// Upper bound on VPMem devices per utility VM.
    pub const MAX_COUNT: u32 = 128;

    pub const DEFAULT_COUNT: u32 = 64;

    /// Default per-device size (4GB).
    pub const DEFAULT_SIZE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

    /// Device sizes must be page aligned.
    pub const SIZE_ALIGNMENT: u64 = 4096;
}

/// SCSI controller limits.
pub mod scsi {
    pub const MAX_CONTROLLERS: u32 = 1;
    pub const DEFAULT_CONTROLLERS: u32 = 1;
}

/// Host socket (HvSocket) configuration.
pub mod hvsocket {
    /// Allow administrators and SYSTEM to bind to guest sockets.
    pub const DEFAULT_BIND_SDDL: &str = "D:P(A;;FA;;;SY)(A;;FA;;;BA)";

    /// Base service GUID into which a vsock port is embedded.
    pub const SERVICE_ID_TEMPLATE: &str = "00000000-facb-11e6-bd58-64006a7986d3";

    /// Port the guest compute service writes its logs to.
    pub const LINUX_LOG_VSOCK_PORT: u32 = 109;
}

/// Host platform gates.
pub mod host {
    /// First host build able to boot a Linux kernel directly.
    pub const MIN_KERNEL_DIRECT_BUILD: u32 = 18286;
}

/// Linux utility VM boot files and defaults.
pub mod lcow {
    pub const BOOT_FILES_DIR: &str = "Linux Containers";
    pub const KERNEL_FILE: &str = "kernel";
    pub const INITRD_FILE: &str = "initrd.img";
    pub const VHD_FILE: &str = "rootfs.vhd";
    pub const DEFAULT_MEMORY_MB: u64 = 1024;
    pub const DEFAULT_PROCESSORS: u32 = 2;

    /// UEFI boot device type for the boot files share.
    pub const UEFI_DEVICE_TYPE: &str = "VmbFs";

    /// Name of the VirtualSmb share exposing the boot files.
    pub const OS_SHARE_NAME: &str = "os";
}
