//! Backend that replays a fixed list of guest operations.

use super::{ExecutionBackend, VcpuExecutor, VcpuExit};
use crate::boot::BootRegisters;
use crate::device::{DeviceSet, IoEventToken};
use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use std::sync::Arc;
use std::time::Duration;

/// One step of a guest program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestOp {
    /// MMIO load; faults if the device returns something other than `expect`.
    Read {
        /// Guest physical address.
        address: u64,
        /// Width in bytes.
        size: usize,
        /// Required value.
        expect: Option<u64>,
    },
    /// MMIO store of the low `size` bytes of `value`.
    Write {
        /// Guest physical address.
        address: u64,
        /// Stored value.
        value: u64,
        /// Width in bytes.
        size: usize,
    },
    /// Fire an ioevent.
    Notify(IoEventToken),
    /// Halt until interrupted.
    Halt,
    /// Power the vCPU off.
    Shutdown,
    /// Raise an unhandled trap.
    Fault(String),
    /// Stay inside guest execution for a while.
    Spin(Duration),
    /// Return to the loop without a trap.
    Yield,
}

/// An ordered list of [`GuestOp`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestProgram {
    ops: Vec<GuestOp>,
    looping: bool,
}

impl GuestProgram {
    /// An empty program. Without further ops the vCPU halts immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an op.
    pub fn op(mut self, op: GuestOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Append an unchecked MMIO load.
    pub fn read(self, address: u64, size: usize) -> Self {
        self.op(GuestOp::Read {
            address,
            size,
            expect: None,
        })
    }

    /// Append an MMIO load that must return `value`.
    pub fn read_expect(self, address: u64, size: usize, value: u64) -> Self {
        self.op(GuestOp::Read {
            address,
            size,
            expect: Some(value),
        })
    }

    /// Append an MMIO store.
    pub fn write(self, address: u64, value: u64, size: usize) -> Self {
        self.op(GuestOp::Write {
            address,
            value,
            size,
        })
    }

    /// Append an ioevent.
    pub fn notify(self, token: IoEventToken) -> Self {
        self.op(GuestOp::Notify(token))
    }

    /// Append a halt.
    pub fn halt(self) -> Self {
        self.op(GuestOp::Halt)
    }

    /// Append a shutdown.
    pub fn shutdown(self) -> Self {
        self.op(GuestOp::Shutdown)
    }

    /// Append a fault.
    pub fn fault(self, reason: impl Into<String>) -> Self {
        self.op(GuestOp::Fault(reason.into()))
    }

    /// Append a spin.
    pub fn spin(self, duration: Duration) -> Self {
        self.op(GuestOp::Spin(duration))
    }

    /// Append a yield.
    pub fn yield_now(self) -> Self {
        self.op(GuestOp::Yield)
    }

    /// Restart from the first op instead of halting at the end.
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    /// Number of ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the program has no ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

enum Programs {
    Uniform(GuestProgram),
    PerVcpu(Vec<GuestProgram>),
}

/// Runs a [`GuestProgram`] on every vCPU.
pub struct ScriptedBackend {
    programs: Programs,
    fail_create: Option<u32>,
}

impl ScriptedBackend {
    /// Every vCPU runs `program`.
    pub fn uniform(program: GuestProgram) -> Self {
        Self {
            programs: Programs::Uniform(program),
            fail_create: None,
        }
    }

    /// vCPU `i` runs `programs[i]`; vCPUs past the end run an empty program.
    pub fn per_vcpu(programs: Vec<GuestProgram>) -> Self {
        Self {
            programs: Programs::PerVcpu(programs),
            fail_create: None,
        }
    }

    /// Refuse to create the executor of vCPU `index`.
    pub fn fail_create(mut self, index: u32) -> Self {
        self.fail_create = Some(index);
        self
    }

    fn program(&self, index: u32) -> GuestProgram {
        match &self.programs {
            Programs::Uniform(program) => program.clone(),
            Programs::PerVcpu(programs) => programs.get(index as usize).cloned().unwrap_or_default(),
        }
    }
}

impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn create_executor(
        &self,
        index: u32,
        _devices: &DeviceSet,
        _memory: &Arc<GuestMemory>,
    ) -> Result<Box<dyn VcpuExecutor>> {
        if self.fail_create == Some(index) {
            return Err(Error::vcpu_creation(index, "executor creation refused"));
        }
        Ok(Box::new(ScriptedExecutor::new(index, self.program(index))))
    }
}

/// Executor stepping through a [`GuestProgram`].
pub(crate) struct ScriptedExecutor {
    index: u32,
    program: GuestProgram,
    pc: usize,
    regs: Option<BootRegisters>,
    pending_read: Option<(u64, Option<u64>)>,
    interrupts: u64,
}

impl ScriptedExecutor {
    pub(crate) fn new(index: u32, program: GuestProgram) -> Self {
        Self {
            index,
            program,
            pc: 0,
            regs: None,
            pending_read: None,
            interrupts: 0,
        }
    }

    fn next_op(&mut self) -> Option<GuestOp> {
        if self.pc == self.program.ops.len() && self.program.looping && !self.program.ops.is_empty() {
            self.pc = 0;
        }
        let op = self.program.ops.get(self.pc).cloned()?;
        self.pc += 1;
        Some(op)
    }
}

impl VcpuExecutor for ScriptedExecutor {
    fn set_boot_registers(&mut self, regs: BootRegisters) -> Result<()> {
        self.regs = Some(regs);
        Ok(())
    }

    fn run(&mut self) -> Result<VcpuExit> {
        if self.regs.is_none() {
            return Err(Error::vcpu_fault(self.index, "run before boot registers were set"));
        }
        if let Some((address, _)) = self.pending_read {
            return Err(Error::vcpu_fault(
                self.index,
                format!("mmio read at {:#x} never completed", address),
            ));
        }

        let op = self.next_op().unwrap_or(GuestOp::Halt);
        match op {
            GuestOp::Read {
                address,
                size,
                expect,
            } => {
                self.pending_read = Some((address, expect));
                Ok(VcpuExit::MmioRead { address, size })
            }
            GuestOp::Write {
                address,
                value,
                size,
            } => {
                let bytes = value.to_le_bytes();
                Ok(VcpuExit::MmioWrite {
                    address,
                    data: bytes[..size.min(bytes.len())].to_vec(),
                })
            }
            GuestOp::Notify(token) => Ok(VcpuExit::IoEvent(token)),
            // A pending interrupt makes hlt fall straight through
            GuestOp::Halt if self.interrupts > 0 => {
                self.interrupts -= 1;
                Ok(VcpuExit::Interrupted)
            }
            GuestOp::Halt => Ok(VcpuExit::Halt),
            GuestOp::Shutdown => Ok(VcpuExit::Shutdown),
            GuestOp::Fault(reason) => Err(Error::vcpu_fault(self.index, reason)),
            GuestOp::Spin(duration) => {
                std::thread::sleep(duration);
                Ok(VcpuExit::Interrupted)
            }
            GuestOp::Yield => {
                std::thread::yield_now();
                Ok(VcpuExit::Interrupted)
            }
        }
    }

    fn complete_mmio_read(&mut self, data: &[u8]) -> Result<()> {
        let (address, expect) = self
            .pending_read
            .take()
            .ok_or_else(|| Error::vcpu_fault(self.index, "mmio read completed twice"))?;
        let value = crate::device::read_le(data);
        match expect {
            Some(expected) if expected != value => Err(Error::vcpu_fault(
                self.index,
                format!(
                    "mmio read at {:#x} returned {:#x}, expected {:#x}",
                    address, value, expected
                ),
            )),
            _ => Ok(()),
        }
    }

    fn inject_interrupt(&mut self) {
        self.interrupts += 1;
    }
}
