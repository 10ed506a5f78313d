//! Utility VM factory.

use std::sync::Arc;

use uuid::Uuid;
use uvmlite_shared::errors::UvmResult;

use crate::config::SourceOptions;
use crate::hcs::ComputeService;
use crate::hvsock::HvSocketProvider;
use crate::schema::options;
use crate::schema::{
    ComputeSystemDoc, Devices, Memory, Plan9, SchemaVersion, Topology, VirtualMachine,
};
use crate::trace::SharedSink;
use crate::vm::{Uvm, UtilityVm, UvmServices};

/// Produces utility VMs in the PreCreated phase.
pub trait UvmSource: Send + Sync {
    /// A Linux utility VM with the minimal initial document.
    ///
    /// An empty `id` is replaced by a random one; an empty `owner` by the
    /// name of the running executable.
    fn new_linux_uvm(&self, id: &str, owner: &str) -> UvmResult<Box<dyn Uvm>>;
}

/// Source for Linux utility VMs. Cheap to clone.
#[derive(Clone)]
pub struct LinuxSource {
    services: UvmServices,
}

impl LinuxSource {
    pub fn new(
        compute: Arc<dyn ComputeService>,
        hvsock: Arc<dyn HvSocketProvider>,
        sink: SharedSink,
        options: SourceOptions,
    ) -> Self {
        let os = options.os_version();
        tracing::debug!(os = %os, log_forwarding = options.log_forwarding, "Linux utility VM source ready");
        Self {
            services: UvmServices {
                compute,
                hvsock,
                sink,
                os,
                options,
            },
        }
    }

    pub fn options(&self) -> &SourceOptions {
        &self.services.options
    }

    pub fn services(&self) -> &UvmServices {
        &self.services
    }

    /// Like [`UvmSource::new_linux_uvm`], returning the concrete type.
    pub fn new_utility_vm(&self, id: &str, owner: &str) -> UtilityVm {
        let id = if id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };
        let owner = if owner.is_empty() {
            default_owner()
        } else {
            owner.to_string()
        };

        let mut doc = ComputeSystemDoc {
            owner: owner.clone(),
            schema_version: Some(SchemaVersion::v21()),
            should_terminate_on_last_handle_closed: true,
            virtual_machine: Some(VirtualMachine {
                stop_on_reset: true,
                chipset: Some(Default::default()),
                compute_topology: Some(Topology {
                    memory: Some(Memory {
                        allow_overcommit: true,
                        ..Default::default()
                    }),
                    processor: Some(Default::default()),
                }),
                devices: Some(Devices {
                    plan9: Some(Plan9::default()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        };
        options::apply(
            &mut doc,
            [options::with_hvsocket(self.services.options.hvsocket_sddl.clone())],
        );

        UtilityVm::new(id, owner, doc, self.services.clone())
    }
}

impl UvmSource for LinuxSource {
    fn new_linux_uvm(&self, id: &str, owner: &str) -> UvmResult<Box<dyn Uvm>> {
        Ok(Box::new(self.new_utility_vm(id, owner)))
    }
}

impl std::fmt::Debug for LinuxSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxSource")
            .field("os", &self.services.os)
            .field("options", &self.services.options)
            .finish()
    }
}

/// File stem of the running executable.
fn default_owner() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "uvmlite".to_string())
}
