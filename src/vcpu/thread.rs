//! The vCPU thread loop.

use super::{ExitKind, ExitReason, VcpuCommand, VcpuEvent, VcpuReport, VcpuState};
use crate::backend::{VcpuExecutor, VcpuExit};
use crate::device::{DeviceSet, MmioOp};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::Arc;

/// Next state handler to run.
enum Step {
    Running,
    Paused,
    Halted,
    Done,
}

/// One vCPU. Constructed on the control thread, then moved onto its own
/// thread, which is the only one that touches it afterwards.
pub(crate) struct Vcpu {
    index: u32,
    state: VcpuState,
    last_exit: Option<ExitKind>,
    executor: Box<dyn VcpuExecutor>,
    devices: Arc<DeviceSet>,
    commands: Receiver<VcpuCommand>,
    reports: Sender<VcpuReport>,
    pending_interrupt: bool,
    /// Set when the current pause began in `Halted`.
    paused_in_halt: bool,
}

impl Vcpu {
    pub(crate) fn new(
        index: u32,
        executor: Box<dyn VcpuExecutor>,
        devices: Arc<DeviceSet>,
        commands: Receiver<VcpuCommand>,
        reports: Sender<VcpuReport>,
    ) -> Self {
        Self {
            index,
            state: VcpuState::Created,
            last_exit: None,
            executor,
            devices,
            commands,
            reports,
            pending_interrupt: false,
            paused_in_halt: false,
        }
    }

    /// Thread body. Parks in `Runnable` until `Run`, then drives the state
    /// handlers until the vCPU exits or crashes.
    pub(crate) fn run(mut self) {
        self.state = VcpuState::Runnable;
        loop {
            match self.commands.recv() {
                Ok(VcpuCommand::Run) => break,
                Ok(VcpuCommand::Stop) | Err(_) => {
                    self.exit(ExitReason::Stopped);
                    return;
                }
                Ok(other) => {
                    tracing::trace!(vcpu = self.index, command = other.name(), "ignored before run");
                }
            }
        }

        self.state = VcpuState::Running;
        self.report(VcpuEvent::Started);
        tracing::debug!(vcpu = self.index, "vcpu started");

        let mut step = Step::Running;
        loop {
            step = match step {
                Step::Running => self.running(),
                Step::Paused => self.paused(),
                Step::Halted => self.halted(),
                Step::Done => break,
            };
        }
    }

    fn report(&self, event: VcpuEvent) {
        if self.reports.send(VcpuReport { index: self.index, event }).is_err() {
            tracing::trace!(vcpu = self.index, "report dropped, control thread gone");
        }
    }

    fn exit(&mut self, reason: ExitReason) -> Step {
        self.state = VcpuState::Exited(reason);
        tracing::debug!(vcpu = self.index, %reason, last_exit = ?self.last_exit, "vcpu exited");
        self.report(VcpuEvent::Exited(reason));
        Step::Done
    }

    fn crash(&mut self, error: Error) -> Step {
        self.state = VcpuState::Crashed;
        self.last_exit = Some(ExitKind::Error);
        tracing::error!(vcpu = self.index, error = %error, "vcpu crashed");
        self.report(VcpuEvent::Crashed(error));
        Step::Done
    }

    fn pause(&mut self, from_halt: bool) -> Step {
        self.paused_in_halt = from_halt;
        self.state = VcpuState::Paused;
        self.report(VcpuEvent::Paused);
        Step::Paused
    }

    fn running(&mut self) -> Step {
        // Commands are only observed here, between guest exits
        match self.commands.try_recv() {
            Ok(VcpuCommand::Pause) => return self.pause(false),
            Ok(VcpuCommand::Stop) | Err(TryRecvError::Disconnected) => {
                return self.exit(ExitReason::Stopped)
            }
            Ok(VcpuCommand::Resume) => self.report(VcpuEvent::Resumed),
            Ok(VcpuCommand::Interrupt) => self.pending_interrupt = true,
            Ok(VcpuCommand::Run) | Err(TryRecvError::Empty) => {}
        }

        if std::mem::take(&mut self.pending_interrupt) {
            self.executor.inject_interrupt();
        }

        let result = self.executor.run().and_then(|exit| self.handle_exit(exit));
        match result {
            Ok(step) => step,
            Err(e) => self.crash(e),
        }
    }

    fn handle_exit(&mut self, exit: VcpuExit) -> Result<Step> {
        match exit {
            VcpuExit::MmioRead { address, size } => {
                self.last_exit = Some(ExitKind::MmioAccess);
                let mut data = vec![0u8; size];
                self.devices
                    .dispatch_mmio(address, MmioOp::Read(&mut data))
                    .map_err(|e| Error::vcpu_fault(self.index, e.to_string()))?;
                self.executor.complete_mmio_read(&data)?;
                Ok(Step::Running)
            }
            VcpuExit::MmioWrite { address, data } => {
                self.last_exit = Some(ExitKind::MmioAccess);
                self.devices
                    .dispatch_mmio(address, MmioOp::Write(&data))
                    .map_err(|e| Error::vcpu_fault(self.index, e.to_string()))?;
                Ok(Step::Running)
            }
            VcpuExit::IoEvent(token) => {
                self.last_exit = Some(ExitKind::IoEventAccess);
                self.devices
                    .dispatch_ioevent(token)
                    .map_err(|e| Error::vcpu_fault(self.index, e.to_string()))?;
                Ok(Step::Running)
            }
            VcpuExit::Halt => {
                self.last_exit = Some(ExitKind::Halt);
                if std::mem::take(&mut self.pending_interrupt) {
                    self.executor.inject_interrupt();
                    return Ok(Step::Running);
                }
                self.state = VcpuState::Halted;
                self.report(VcpuEvent::Halted);
                tracing::trace!(vcpu = self.index, "vcpu halted");
                Ok(Step::Halted)
            }
            VcpuExit::Shutdown => {
                self.last_exit = Some(ExitKind::Shutdown);
                Ok(self.exit(ExitReason::GuestShutdown))
            }
            VcpuExit::Interrupted => {
                self.last_exit = Some(ExitKind::Interrupted);
                Ok(Step::Running)
            }
        }
    }

    fn paused(&mut self) -> Step {
        match self.commands.recv() {
            // A pause taken in hlt resumes in hlt unless an interrupt
            // arrived meanwhile; running() delivers it
            Ok(VcpuCommand::Resume) if self.paused_in_halt && !self.pending_interrupt => {
                self.resume_halted()
            }
            Ok(VcpuCommand::Resume) => {
                self.paused_in_halt = false;
                self.state = VcpuState::Running;
                self.report(VcpuEvent::Resumed);
                Step::Running
            }
            Ok(VcpuCommand::Pause) => {
                self.report(VcpuEvent::Paused);
                Step::Paused
            }
            Ok(VcpuCommand::Interrupt) => {
                self.pending_interrupt = true;
                Step::Paused
            }
            Ok(VcpuCommand::Run) => Step::Paused,
            Ok(VcpuCommand::Stop) | Err(_) => self.exit(ExitReason::Stopped),
        }
    }

    /// Acknowledge a resume without leaving hlt.
    fn resume_halted(&mut self) -> Step {
        self.paused_in_halt = false;
        self.state = VcpuState::Halted;
        self.report(VcpuEvent::Resumed);
        self.report(VcpuEvent::Halted);
        Step::Halted
    }

    fn halted(&mut self) -> Step {
        // Blocks without spinning until something can wake the guest
        match self.commands.recv() {
            Ok(VcpuCommand::Interrupt) => {
                self.executor.inject_interrupt();
                self.state = VcpuState::Running;
                self.report(VcpuEvent::Woken);
                Step::Running
            }
            Ok(VcpuCommand::Pause) => self.pause(true),
            Ok(VcpuCommand::Resume) => self.resume_halted(),
            Ok(VcpuCommand::Run) => Step::Halted,
            Ok(VcpuCommand::Stop) | Err(_) => self.exit(ExitReason::Stopped),
        }
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        // Reached without a final report only if the thread is unwinding
        if !self.state.is_terminal() && self.state != VcpuState::Created {
            self.state = VcpuState::Crashed;
            self.report(VcpuEvent::Crashed(Error::vcpu_fault(
                self.index,
                "vcpu thread terminated unexpectedly",
            )));
        }
    }
}
