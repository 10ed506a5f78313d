//! uvmlite: lifecycle and device configuration of host compute utility VMs.
//!
//! ## Architecture
//!
//! ```text
//! LinuxSource ──→ UtilityVm (PreCreated) ──create──→ Created ──start──→ Running
//!                     │                                  │
//!                 mutators edit                      mutators send
//!                 the document                       modify requests
//! ```
//!
//! - [`source`]: produces PreCreated VMs with the initial document
//! - [`vm`]: the VM descriptor, its lifecycle and capability traits
//! - [`schema`]: the configuration document and functional options
//! - [`hcs`]: the compute system control surface and its emulation
//! - [`hvsock`]: host-socket listeners
//! - [`lcow`]: Linux utility VM construction from [`LcowOptions`]
//! - [`boot`] and [`pipeline`]: batches of boot runs
//! - [`trace`]: injected diagnostics

pub mod boot;
pub mod config;
pub mod context;
pub mod hcs;
pub mod hvsock;
pub mod lcow;
pub mod logging;
pub mod osversion;
pub mod pipeline;
pub mod schema;
pub mod source;
pub mod trace;
pub mod vm;

pub use config::SourceOptions;
pub use context::OpContext;
pub use lcow::{LcowOptions, create_lcow};
pub use osversion::OsVersion;
pub use source::{LinuxSource, UvmSource};
pub use uvmlite_shared::{UvmError, UvmResult};
pub use vm::{State, UtilityVm, Uvm};
