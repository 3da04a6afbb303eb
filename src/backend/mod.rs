//! Guest execution backends.
//!
//! A backend creates one [`VcpuExecutor`] per vCPU. The executor is moved
//! onto the vCPU's thread and driven by its loop: `run()` executes the guest
//! until the next trap and returns it as a [`VcpuExit`].

mod enumerate;
mod scripted;

pub use enumerate::EnumerateBackend;
pub use scripted::{GuestOp, GuestProgram, ScriptedBackend};

use crate::boot::BootRegisters;
use crate::device::{DeviceSet, IoEventToken};
use crate::error::Result;
use crate::memory::GuestMemory;
use std::sync::Arc;

/// A trap that returned control to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcpuExit {
    /// Guest load from an MMIO address; the loop completes it with
    /// [`VcpuExecutor::complete_mmio_read`].
    MmioRead {
        /// Guest physical address.
        address: u64,
        /// Access width in bytes.
        size: usize,
    },
    /// Guest store to an MMIO address.
    MmioWrite {
        /// Guest physical address.
        address: u64,
        /// Stored bytes.
        data: Vec<u8>,
    },
    /// A registered ioevent fired.
    IoEvent(IoEventToken),
    /// Halt until the next interrupt.
    Halt,
    /// The guest powered this vCPU off.
    Shutdown,
    /// Execution returned without a trap to handle.
    Interrupted,
}

/// Executes guest code for one vCPU. Owned by that vCPU's thread.
pub trait VcpuExecutor: Send {
    /// Load the initial register state.
    fn set_boot_registers(&mut self, regs: BootRegisters) -> Result<()>;

    /// Run the guest until the next exit. An unhandled trap is an
    /// [`Error::VcpuFault`](crate::Error::VcpuFault).
    fn run(&mut self) -> Result<VcpuExit>;

    /// Supply the value of the last [`VcpuExit::MmioRead`].
    fn complete_mmio_read(&mut self, data: &[u8]) -> Result<()>;

    /// Deliver an interrupt before the next `run()`.
    fn inject_interrupt(&mut self) {}
}

/// Creates vCPU executors for a VM.
pub trait ExecutionBackend: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Create the executor for vCPU `index`.
    fn create_executor(
        &self,
        index: u32,
        devices: &DeviceSet,
        memory: &Arc<GuestMemory>,
    ) -> Result<Box<dyn VcpuExecutor>>;
}

/// The backend used when the caller does not supply one.
pub fn default_backend() -> Arc<dyn ExecutionBackend> {
    Arc::new(EnumerateBackend::new())
}
