//! Shared harness: a Linux source wired to the emulated compute service,
//! the loopback host socket and an in-memory diagnostic sink.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use uvmlite::SourceOptions;
use uvmlite::hcs::EmulatedComputeService;
use uvmlite::hvsock::LoopbackHvSocket;
use uvmlite::source::LinuxSource;
use uvmlite::trace::MemorySink;

/// Host build used by every harness; new enough for kernel direct boot.
pub const HOST_BUILD: u32 = 19041;

pub struct Harness {
    pub compute: EmulatedComputeService,
    pub hvsock: LoopbackHvSocket,
    pub sink: Arc<MemorySink>,
    pub source: LinuxSource,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(EmulatedComputeService::new(), LoopbackHvSocket::new(), true)
    }

    /// A harness whose VMs do not listen for guest logs.
    pub fn without_log_forwarding() -> Self {
        Self::with(EmulatedComputeService::new(), LoopbackHvSocket::new(), false)
    }

    pub fn with(compute: EmulatedComputeService, hvsock: LoopbackHvSocket, log_forwarding: bool) -> Self {
        let sink = Arc::new(MemorySink::default());
        let source = LinuxSource::new(
            Arc::new(compute.clone()),
            Arc::new(hvsock.clone()),
            sink.clone(),
            SourceOptions {
                log_forwarding,
                host_build: Some(HOST_BUILD),
                ..Default::default()
            },
        );
        Self {
            compute,
            hvsock,
            sink,
            source,
        }
    }
}

/// Write an empty kernel and root filesystem under `dir`.
pub fn write_boot_files(dir: &Path, files: &[&str]) {
    for file in files {
        std::fs::write(dir.join(file), b"").unwrap();
    }
}
