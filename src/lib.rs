//! shuairan - a lightweight hypervisor core
//!
//! shuairan turns a declarative VM description into a running machine: it
//! realizes the virtual devices, loads the guest images, starts one OS
//! thread per vCPU and coordinates those threads from a single control
//! thread until the guest shuts down or crashes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  Vmm (hypervisor context, settings)             │
//! ├─────────────────────────────────────────────────┤
//! │  Vm (lifecycle state machine)                   │
//! ├────────────────────────┬────────────────────────┤
//! │  VcpuManager           │  DeviceManager         │
//! │  one thread per vCPU   │  DeviceSet (shared)    │
//! ├────────────────────────┴────────────────────────┤
//! │  ExecutionBackend (guest execution primitive)   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use shuairan::{HypervisorSettings, Vmm};
//!
//! let mut vmm = Vmm::new(HypervisorSettings::default());
//! vmm.init().unwrap();
//!
//! let id = vmm.create_vm_from_file("vm.json".as_ref()).unwrap();
//! let state = vmm.run_to_completion(id).unwrap();
//! println!("vm finished: {}", state);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod boot;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod memory;
pub mod vcpu;
pub mod vm;
pub mod vmm;

// Re-export main types for convenience
pub use backend::{default_backend, ExecutionBackend, GuestProgram, ScriptedBackend};
pub use config::HypervisorSettings;
pub use device::{DeviceError, DeviceManager, DeviceSet};
pub use error::{Error, Result};
pub use shuairan_desc::{ConfigError, ParseError, VmDescription};
pub use vcpu::{VcpuManager, VcpuState};
pub use vm::{Vm, VmState};
pub use vmm::{VmId, Vmm, VmmState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
