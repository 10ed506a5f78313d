//! Linux utility VM (LCOW) construction.
//!
//! [`create_lcow`] validates [`LcowOptions`], checks the boot files exist,
//! builds the VM document through the capability mutators and creates the
//! compute system. The result is a Created VM ready to start.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uvmlite_shared::constants::{host, hvsocket, lcow, scsi, vpmem};
use uvmlite_shared::errors::{UvmError, UvmResult};

use crate::context::OpContext;
use crate::osversion::OsVersion;
use crate::schema::options::{self, KernelOpt, PreferredRootFsType, create_kernel_command_line};
use crate::source::LinuxSource;
use crate::vm::{
    ComPortControl, LinuxBoot, MemoryBackingType, MemoryConfig, MemoryConfigControl,
    MemoryControl, ProcessorControl, Scsi, UefiBoot, UtilityVm, Uvm, VpMem, VpMemImageFormat,
};

/// Options for a Linux utility VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcowOptions {
    /// VM id; generated when empty.
    pub id: String,
    /// Owner recorded in the document; the executable name when empty.
    pub owner: String,
    /// Directory holding the kernel and root filesystem.
    pub boot_files_path: PathBuf,
    /// Kernel file name under `boot_files_path`.
    pub kernel_file: String,
    /// Root filesystem file name; derived from `preferred_root_fs` when unset.
    pub root_fs_file: Option<String>,
    /// Skip UEFI and boot the kernel directly.
    pub kernel_direct: bool,
    /// Extra kernel arguments.
    pub kernel_boot_options: String,
    pub enable_graphics_console: bool,
    /// Named pipe for the serial console, e.g. `\\.\pipe\vmpipe`.
    pub console_pipe: Option<String>,
    pub scsi_controller_count: u32,
    /// VPMem devices; device 0 is taken when booting from a VHD.
    pub vpmem_device_count: u32,
    pub vpmem_size_bytes: u64,
    pub preferred_root_fs: PreferredRootFsType,
    pub processor_count: u32,
    pub memory_mb: u64,
    pub allow_overcommit: bool,
    pub enable_deferred_commit: bool,
    /// JSON object deep-merged into the document at create.
    pub additional_json: Option<String>,
    /// Log level handed to the guest compute service.
    pub guest_log_level: String,
}

impl Default for LcowOptions {
    fn default() -> Self {
        Self {
            id: String::new(),
            owner: String::new(),
            boot_files_path: default_boot_files_path(),
            kernel_file: lcow::KERNEL_FILE.to_string(),
            root_fs_file: None,
            kernel_direct: false,
            kernel_boot_options: String::new(),
            enable_graphics_console: false,
            console_pipe: None,
            scsi_controller_count: scsi::DEFAULT_CONTROLLERS,
            vpmem_device_count: vpmem::DEFAULT_COUNT,
            vpmem_size_bytes: vpmem::DEFAULT_SIZE_BYTES,
            preferred_root_fs: PreferredRootFsType::InitRd,
            processor_count: default_processor_count(),
            memory_mb: lcow::DEFAULT_MEMORY_MB,
            allow_overcommit: true,
            enable_deferred_commit: false,
            additional_json: None,
            guest_log_level: "info".to_string(),
        }
    }
}

/// `%ProgramFiles%\Linux Containers`.
fn default_boot_files_path() -> PathBuf {
    let program_files = std::env::var_os("ProgramFiles")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
    program_files.join(lcow::BOOT_FILES_DIR)
}

fn default_processor_count() -> u32 {
    match std::thread::available_parallelism() {
        Ok(n) if n.get() == 1 => 1,
        _ => lcow::DEFAULT_PROCESSORS,
    }
}

impl LcowOptions {
    /// Root filesystem file name, explicit or derived from the root type.
    pub fn root_fs_file(&self) -> &str {
        match &self.root_fs_file {
            Some(file) if !file.is_empty() => file,
            _ => self.preferred_root_fs.default_file(),
        }
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.boot_files_path.join(&self.kernel_file)
    }

    pub fn root_fs_path(&self) -> PathBuf {
        self.boot_files_path.join(self.root_fs_file())
    }

    /// Whether a console is attached, which keeps the guest alive on panic
    /// and starts a shell next to the guest service.
    pub fn vm_debugging(&self) -> bool {
        self.console_pipe.as_deref().is_some_and(|pipe| !pipe.is_empty())
            || self.enable_graphics_console
    }

    /// Check option ranges and the host gate. Boot files are checked by
    /// [`check_boot_files`](Self::check_boot_files).
    pub fn validate(&self, os: OsVersion) -> UvmResult<()> {
        if self.scsi_controller_count > scsi::MAX_CONTROLLERS {
            return Err(UvmError::Config(format!(
                "SCSI controller count must be 0 or {}",
                scsi::MAX_CONTROLLERS
            )));
        }
        if self.vpmem_device_count > vpmem::MAX_COUNT {
            return Err(UvmError::Config(format!(
                "vpmem device count cannot be greater than {}",
                vpmem::MAX_COUNT
            )));
        }
        if self.vpmem_device_count > 0 {
            if self.vpmem_size_bytes % vpmem::SIZE_ALIGNMENT != 0 {
                return Err(UvmError::Config(format!(
                    "vpmem size in bytes must be a multiple of {}",
                    vpmem::SIZE_ALIGNMENT
                )));
            }
        } else if self.preferred_root_fs == PreferredRootFsType::Vhd {
            return Err(UvmError::Config(
                "a VHD root filesystem requires at least one VPMem device".into(),
            ));
        }
        if self.kernel_direct && !os.supports_kernel_direct() {
            return Err(UvmError::Unsupported(format!(
                "kernel direct boot is not supported on builds older than {} (host is {os})",
                host::MIN_KERNEL_DIRECT_BUILD
            )));
        }
        Ok(())
    }

    pub fn check_boot_files(&self) -> UvmResult<()> {
        let kernel = self.kernel_path();
        if !kernel.is_file() {
            return Err(UvmError::Config(format!(
                "kernel '{}' not found",
                kernel.display()
            )));
        }
        if !self.root_fs_path().is_file() {
            return Err(UvmError::Config(format!(
                "{} not found under {}",
                self.root_fs_file(),
                self.boot_files_path.display()
            )));
        }
        Ok(())
    }

    /// The kernel command line for these options.
    pub fn kernel_args(&self) -> String {
        let mut args = Vec::new();

        match self.preferred_root_fs {
            PreferredRootFsType::InitRd if !self.kernel_direct => {
                let file = self.root_fs_file();
                if file == lcow::INITRD_FILE {
                    args.push(KernelOpt::InitRdBoot);
                } else {
                    args.push(KernelOpt::Arg(format!("initrd=/{file}")));
                }
            }
            PreferredRootFsType::InitRd => {}
            PreferredRootFsType::Vhd => args.push(KernelOpt::PMemBoot),
        }

        if self.console_pipe.as_deref().is_some_and(|pipe| !pipe.is_empty()) {
            args.push(KernelOpt::Arg(
                "8250_core.nr_uarts=1 8250_core.skip_txen_test=1 console=ttyS0,115200".into(),
            ));
        } else {
            args.push(KernelOpt::Arg("8250_core.nr_uarts=0".into()));
        }
        if self.enable_graphics_console {
            args.push(KernelOpt::Arg("console=tty".into()));
        }
        if !self.vm_debugging() {
            args.push(KernelOpt::Arg("panic=-1 quiet".into()));
        }
        if !self.kernel_boot_options.is_empty() {
            args.push(KernelOpt::Arg(self.kernel_boot_options.clone()));
        }

        let mut init = format!(
            "/bin/vsockexec -e {} /bin/gcs -log-format json -loglevel {}",
            hvsocket::LINUX_LOG_VSOCK_PORT,
            self.guest_log_level
        );
        if self.vm_debugging() {
            init = format!("sh -c \"{init} & exec sh\"");
        }
        args.push(KernelOpt::Arg("pci=off brd.rd_nr=0 pmtmr=0".into()));
        args.push(KernelOpt::InitArgs(init));

        create_kernel_command_line(&args)
    }
}

/// Build and create a Linux utility VM. The returned VM is Created.
pub async fn create_lcow(
    source: &LinuxSource,
    opts: &LcowOptions,
    ctx: &OpContext,
) -> UvmResult<UtilityVm> {
    tracing::debug!(options = ?opts, "uvm::CreateLcow");
    opts.validate(source.services().os)?;
    opts.check_boot_files()?;

    let mut uvm = source.new_utility_vm(&opts.id, &opts.owner);

    uvm.set_memory_limit(ctx, opts.memory_mb).await?;
    let backing_type = if opts.allow_overcommit {
        MemoryBackingType::Virtual
    } else {
        MemoryBackingType::Physical
    };
    uvm.set_memory_config(
        ctx,
        &MemoryConfig {
            backing_type,
            deferred_commit: opts.enable_deferred_commit,
            ..Default::default()
        },
    )
    .await?;
    uvm.set_processor_count(ctx, u64::from(opts.processor_count))
        .await?;
    uvm.apply_schema_options(vec![options::with_guest_connection()])?;

    for controller in 0..opts.scsi_controller_count {
        uvm.add_scsi_controller(ctx, controller).await?;
    }
    if opts.vpmem_device_count > 0 {
        uvm.add_vpmem_controller(ctx, opts.vpmem_device_count, opts.vpmem_size_bytes)
            .await?;
    }

    let boot_files_path = opts.boot_files_path.to_string_lossy().into_owned();
    let root_fs_path = opts.root_fs_path().to_string_lossy().into_owned();
    if opts.preferred_root_fs == PreferredRootFsType::Vhd {
        let format = VpMemImageFormat::from_path(opts.root_fs_file());
        uvm.add_vpmem_device(ctx, 0, &root_fs_path, true, format)
            .await?;
    }

    if let Some(pipe) = opts.console_pipe.as_deref().filter(|pipe| !pipe.is_empty()) {
        uvm.set_com_port(ctx, 0, pipe).await?;
    }
    if opts.enable_graphics_console {
        uvm.apply_schema_options(vec![options::with_graphics_console()])?;
    }

    let kernel_args = opts.kernel_args();
    if opts.kernel_direct {
        let initrd = match opts.preferred_root_fs {
            PreferredRootFsType::InitRd => root_fs_path.as_str(),
            PreferredRootFsType::Vhd => "",
        };
        let kernel = opts.kernel_path().to_string_lossy().into_owned();
        uvm.set_linux_kernel_direct_boot(ctx, &kernel, initrd, &kernel_args)
            .await?;
    } else {
        uvm.apply_schema_options(vec![options::with_boot_files_share(boot_files_path)])?;
        uvm.set_uefi_boot(ctx, "", &opts.kernel_file, &kernel_args)
            .await?;
    }

    if let Some(fragment) = &opts.additional_json {
        uvm.set_additional_json(fragment)?;
    }

    uvm.create(ctx).await?;
    Ok(uvm)
}
