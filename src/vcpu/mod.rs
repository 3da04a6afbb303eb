//! Virtual CPUs.
//!
//! Each vCPU runs on its own OS thread and exclusively owns its execution
//! state. The control thread talks to it over two channels: a per-vCPU
//! command channel ([`VcpuCommand`]) and one report channel shared by all
//! vCPUs of a VM ([`VcpuReport`]). The vCPU only looks at its commands
//! between guest exits, so every state change happens on the vCPU's own
//! thread.

mod manager;
mod thread;

pub use manager::{ManagerEvent, VcpuManager};

use crate::error::Error;
use std::fmt;

/// Execution state of one vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Constructed, thread not started.
    Created,
    /// Thread started, waiting for the first `Run`.
    Runnable,
    /// Executing guest code.
    Running,
    /// Suspended by the control thread.
    Paused,
    /// Guest halted; blocked until an interrupt.
    Halted,
    /// Thread finished.
    Exited(ExitReason),
    /// Thread finished with an error.
    Crashed,
}

impl VcpuState {
    /// Whether the vCPU's thread has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VcpuState::Exited(_) | VcpuState::Crashed)
    }
}

impl fmt::Display for VcpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VcpuState::Created => f.write_str("created"),
            VcpuState::Runnable => f.write_str("runnable"),
            VcpuState::Running => f.write_str("running"),
            VcpuState::Paused => f.write_str("paused"),
            VcpuState::Halted => f.write_str("halted"),
            VcpuState::Exited(reason) => write!(f, "exited ({})", reason),
            VcpuState::Crashed => f.write_str("crashed"),
        }
    }
}

/// Why a vCPU exited cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The guest powered the vCPU off.
    GuestShutdown,
    /// The control thread asked it to stop.
    Stopped,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::GuestShutdown => f.write_str("guest shutdown"),
            ExitReason::Stopped => f.write_str("stopped"),
        }
    }
}

/// Control thread to vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuCommand {
    /// Leave `Runnable` and start executing.
    Run,
    /// Suspend at the next exit and acknowledge.
    Pause,
    /// Leave `Paused` and acknowledge.
    Resume,
    /// Raise an interrupt; wakes a halted vCPU.
    Interrupt,
    /// Exit the thread.
    Stop,
}

impl VcpuCommand {
    /// Command name, for timeouts and logs.
    pub fn name(&self) -> &'static str {
        match self {
            VcpuCommand::Run => "run",
            VcpuCommand::Pause => "pause",
            VcpuCommand::Resume => "resume",
            VcpuCommand::Interrupt => "interrupt",
            VcpuCommand::Stop => "stop",
        }
    }
}

/// vCPU to control thread.
#[derive(Debug)]
pub struct VcpuReport {
    /// Reporting vCPU.
    pub index: u32,
    /// What happened.
    pub event: VcpuEvent,
}

/// State change reported by a vCPU thread.
#[derive(Debug)]
pub enum VcpuEvent {
    /// Acknowledges `Run`.
    Started,
    /// Acknowledges `Pause`.
    Paused,
    /// Acknowledges `Resume`.
    Resumed,
    /// The guest halted.
    Halted,
    /// An interrupt woke a halted vCPU.
    Woken,
    /// The thread is about to return.
    Exited(ExitReason),
    /// The thread is about to return after an error.
    Crashed(Error),
}

impl VcpuEvent {
    /// State the vCPU is in after reporting this event.
    pub fn state(&self) -> VcpuState {
        match self {
            VcpuEvent::Started | VcpuEvent::Resumed | VcpuEvent::Woken => VcpuState::Running,
            VcpuEvent::Paused => VcpuState::Paused,
            VcpuEvent::Halted => VcpuState::Halted,
            VcpuEvent::Exited(reason) => VcpuState::Exited(*reason),
            VcpuEvent::Crashed(_) => VcpuState::Crashed,
        }
    }
}

/// Classification of the last guest exit a vCPU handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Load or store to a device window.
    MmioAccess,
    /// Queue notification.
    IoEventAccess,
    /// Halt instruction.
    Halt,
    /// Power off.
    Shutdown,
    /// Returned without a trap.
    Interrupted,
    /// Unhandled trap or failed dispatch.
    Error,
}
