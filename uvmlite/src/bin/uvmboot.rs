//! uvmboot: boot Linux utility VMs and wait for them to exit.
//!
//! Runs against the in-process emulated compute service, which makes it a
//! harness for the lifecycle, device configuration and log forwarding code.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use clap::Parser;
use uvmlite::boot::{BootContext, run_batch};
use uvmlite::config::SourceOptions;
use uvmlite::hcs::EmulatedComputeService;
use uvmlite::hvsock::LoopbackHvSocket;
use uvmlite::logging::init_logging;
use uvmlite::schema::options::PreferredRootFsType;
use uvmlite::trace::TracingSink;
use uvmlite::{LcowOptions, LinuxSource, OpContext};

#[derive(Parser, Debug)]
#[command(name = "uvmboot", version, about = "Boot a utility VM and wait for it to exit")]
struct Args {
    /// Additional arguments to pass to the kernel
    #[arg(long, default_value = "")]
    kernel_args: String,

    /// 0 to boot from initrd, 1 to boot from VHD
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    root_fs_type: u8,

    /// Number of VPMem devices on the UVM
    #[arg(long, default_value_t = 64)]
    vpmem_max_count: u32,

    /// Size of each VPMem device, in MB
    #[arg(long, default_value_t = 4 * 1024)]
    vpmem_max_size: u64,

    /// Number of CPUs on the UVM
    #[arg(long, default_value_t = 2)]
    cpus: u32,

    /// Amount of memory on the UVM, in MB
    #[arg(long, default_value_t = 1024)]
    memory: u64,

    /// Disable memory overcommit on the UVM
    #[arg(long)]
    disallow_overcommit: bool,

    /// Enable deferred commit on the UVM
    #[arg(long)]
    enable_deferred_commit: bool,

    /// Measure wall clock time of the UVM run
    #[arg(long)]
    measure: bool,

    /// Run the UVMs in parallel instead of sequentially
    #[arg(long)]
    parallel: bool,

    /// Number of UVMs to run
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Folder holding the kernel and root filesystem
    #[arg(long)]
    boot_files_path: Option<PathBuf>,

    /// Boot the kernel directly instead of through UEFI
    #[arg(long)]
    kernel_direct: bool,

    /// Host build to assume instead of detecting it
    #[arg(long)]
    host_build: Option<u32>,

    /// How long each emulated guest runs before exiting, in milliseconds
    #[arg(long, default_value_t = 1000)]
    guest_lifetime_ms: u64,

    /// Also write logs to uvmboot.log in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_dir.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let preferred_root_fs = PreferredRootFsType::from_raw(args.root_fs_type)
        .ok_or_else(|| anyhow!("invalid root filesystem type {}", args.root_fs_type))?;

    let mut options = SourceOptions::from_env()?;
    if args.host_build.is_some() {
        options.host_build = args.host_build;
    }

    let hvsock = LoopbackHvSocket::new();
    let mut compute = EmulatedComputeService::new()
        .with_guest_lifetime(Duration::from_millis(args.guest_lifetime_ms));
    if options.log_forwarding {
        compute = compute.with_guest_logs(hvsock.clone(), options.log_port);
    }
    let source = LinuxSource::new(
        Arc::new(compute),
        Arc::new(hvsock),
        Arc::new(TracingSink),
        options,
    );

    let vpmem_size_bytes = args
        .vpmem_max_size
        .checked_mul(1024 * 1024)
        .ok_or_else(|| anyhow!("vpmem size of {} MB is too large", args.vpmem_max_size))?;

    let mut lcow = LcowOptions {
        kernel_boot_options: args.kernel_args,
        preferred_root_fs,
        vpmem_device_count: args.vpmem_max_count,
        vpmem_size_bytes,
        processor_count: args.cpus,
        memory_mb: args.memory,
        allow_overcommit: !args.disallow_overcommit,
        enable_deferred_commit: args.enable_deferred_commit,
        kernel_direct: args.kernel_direct,
        ..Default::default()
    };
    if let Some(path) = args.boot_files_path {
        lcow.boot_files_path = path;
    }

    let ctx = Arc::new(BootContext {
        source,
        options: lcow,
        ctx: OpContext::background(),
    });

    let start = Instant::now();
    let metrics = run_batch(ctx, args.count, args.parallel).await;
    let failed = metrics.failures().len();
    tracing::info!(runs = args.count, failed, "All runs finished");

    if args.measure {
        println!("Elapsed time: {:?}", start.elapsed());
    }
    Ok(())
}
