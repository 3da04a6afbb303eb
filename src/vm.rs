//! One guest instance and its lifecycle.
//!
//! ```text
//! Configured -> Booting -> Running <-> Paused
//!                  |          |          |
//!                  |          +----+-----+
//!                  |               v
//!                  |         ShuttingDown -> Terminated
//!                  v               |
//!               Crashed <----------+  (also from Running / Paused)
//! ```
//!
//! All transitions happen on the thread that owns the [`Vm`]. vCPU threads
//! only report; [`Vm::wait`] turns their reports into transitions.

use crate::backend::ExecutionBackend;
use crate::boot::{self, BootInfo};
use crate::device::DeviceManager;
use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use crate::vcpu::{ManagerEvent, VcpuManager};
use shuairan_desc::VmDescription;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Description validated, nothing allocated.
    Configured,
    /// Memory, devices and images being set up.
    Booting,
    /// vCPU threads executing.
    Running,
    /// Every vCPU suspended.
    Paused,
    /// vCPUs being stopped and joined.
    ShuttingDown,
    /// Clean shutdown finished.
    Terminated,
    /// A fatal error ended the VM.
    Crashed,
}

impl VmState {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmState::Terminated | VmState::Crashed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Configured => "configured",
            VmState::Booting => "booting",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::ShuttingDown => "shutting down",
            VmState::Terminated => "terminated",
            VmState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// A guest instance.
pub struct Vm {
    description: VmDescription,
    state: VmState,
    devices: DeviceManager,
    vcpus: VcpuManager,
    backend: Arc<dyn ExecutionBackend>,
    memory: Option<Arc<GuestMemory>>,
    boot: Option<BootInfo>,
    crash_reason: Option<String>,
}

impl Vm {
    /// Create a VM in `Configured`. Nothing is allocated until [`Vm::start`].
    pub fn new(
        description: VmDescription,
        backend: Arc<dyn ExecutionBackend>,
        grace_period: Duration,
    ) -> Self {
        let vcpus = VcpuManager::new(description.cpu.count, grace_period);
        Self {
            description,
            state: VmState::Configured,
            devices: DeviceManager::new(),
            vcpus,
            backend,
            memory: None,
            boot: None,
            crash_reason: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> VmState {
        self.state
    }

    /// The description this VM was built from.
    pub fn description(&self) -> &VmDescription {
        &self.description
    }

    /// Device manager.
    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    /// vCPU manager.
    pub fn vcpus(&self) -> &VcpuManager {
        &self.vcpus
    }

    /// Message of the error that crashed the VM.
    pub fn crash_reason(&self) -> Option<&str> {
        self.crash_reason.as_deref()
    }

    /// Where the boot images were placed, once booted.
    pub fn boot_info(&self) -> Option<&BootInfo> {
        self.boot.as_ref()
    }

    /// Guest memory, once booted.
    pub fn memory(&self) -> Option<&Arc<GuestMemory>> {
        self.memory.as_ref()
    }

    fn transition(&mut self, to: VmState) {
        tracing::info!(from = %self.state, to = %to, "vm state transition");
        self.state = to;
    }

    fn expect_state(&self, allowed: &[VmState], expected: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::invalid_state(expected, self.state))
        }
    }

    /// Boot the VM: allocate memory, realize devices, load images and
    /// start every vCPU.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Configured], "configured")?;
        self.transition(VmState::Booting);
        match self.boot() {
            Ok(()) => {
                self.transition(VmState::Running);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn boot(&mut self) -> Result<()> {
        let memory = Arc::new(GuestMemory::new(self.description.memory.size_mib)?);
        let devices = self.devices.realize(&self.description.device)?;
        let boot = boot::load(&memory, &self.description.os)?;
        self.memory = Some(Arc::clone(&memory));
        self.boot = Some(boot);

        self.vcpus
            .spawn_all(self.backend.as_ref(), &devices, &memory, &boot)
    }

    /// Suspend every vCPU. Returns after all of them acknowledged.
    pub fn pause(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Running], "running")?;
        if let Err(e) = self.vcpus.pause_all() {
            return Err(self.fail(e));
        }
        self.transition(VmState::Paused);
        Ok(())
    }

    /// Resume a paused VM.
    pub fn resume(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Paused], "paused")?;
        if let Err(e) = self.vcpus.resume_all() {
            return Err(self.fail(e));
        }
        self.transition(VmState::Running);
        Ok(())
    }

    /// Stop every vCPU, then tear devices down.
    pub fn stop(&mut self) -> Result<()> {
        self.expect_state(&[VmState::Running, VmState::Paused], "running or paused")?;
        self.shut_down()
    }

    fn shut_down(&mut self) -> Result<()> {
        self.transition(VmState::ShuttingDown);
        if let Err(e) = self.vcpus.stop_all() {
            return Err(self.fail(e));
        }
        if let Err(e) = self.devices.teardown() {
            return Err(self.fail(e.into()));
        }
        self.transition(VmState::Terminated);
        Ok(())
    }

    /// Interrupt vCPU `index`, waking it if halted.
    pub fn interrupt(&mut self, index: u32) -> Result<()> {
        self.expect_state(&[VmState::Running, VmState::Paused], "running or paused")?;
        self.vcpus.inject_interrupt(index)
    }

    /// Block until every vCPU exited (the VM terminates) or one crashed (the
    /// VM crashes and the error is returned). A paused VM cannot make progress,
    /// so waiting on one without a timeout is rejected.
    pub fn wait(&mut self) -> Result<()> {
        self.wait_for(None).map(|_| ())
    }

    /// Like [`Vm::wait`] but gives up after `timeout`. Returns whether the
    /// VM reached `Terminated`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<bool> {
        self.wait_for(Some(timeout))
    }

    fn wait_for(&mut self, timeout: Option<Duration>) -> Result<bool> {
        match self.state {
            VmState::Terminated => return Ok(true),
            VmState::Crashed => {
                return Err(Error::VmCrashed {
                    reason: self.crash_reason.clone().unwrap_or_default(),
                })
            }
            VmState::Running => {}
            VmState::Paused if timeout.is_some() => {}
            other => return Err(Error::invalid_state("running", other)),
        }

        match self.vcpus.next_event(timeout) {
            Ok(None) => Ok(false),
            Ok(Some(ManagerEvent::AllExited)) => {
                tracing::info!("all vcpus exited");
                self.shut_down().map(|_| true)
            }
            Ok(Some(ManagerEvent::Crashed { index, error })) => {
                tracing::error!(vcpu = index, error = %error, "vcpu crashed, crashing vm");
                Err(self.fail(error))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Move to `Crashed`: stop what is still running, release devices if no
    /// vCPU can still reach them, and hand the error back.
    fn fail(&mut self, error: Error) -> Error {
        tracing::error!(state = %self.state, error = %error, "vm failed");
        self.transition(VmState::Crashed);

        if let Err(e) = self.vcpus.stop_all() {
            tracing::warn!(error = %e, "vcpu stop after crash failed");
        }
        if let Err(e) = self.devices.teardown() {
            tracing::warn!(error = %e, "device teardown after crash failed");
        }

        self.crash_reason = Some(error.to_string());
        error
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if matches!(self.state, VmState::Running | VmState::Paused) {
            if let Err(e) = self.shut_down() {
                tracing::warn!(error = %e, "vm shutdown on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GuestProgram, ScriptedBackend};
    use std::path::Path;

    fn description(dir: &Path, cpus: u32) -> VmDescription {
        let kernel = dir.join("vmlinux");
        let rootfs = dir.join("rootfs.img");
        std::fs::write(&kernel, [0x7f, b'E', b'L', b'F']).unwrap();
        std::fs::write(&rootfs, [0u8; 512]).unwrap();
        let text = serde_json::json!({
            "cpu": { "count": cpus },
            "memory": { "size_mib": 4 },
            "device": [],
            "os": {
                "type": "Linux",
                "specific": {
                    "kernel_path": kernel,
                    "rootfs_path": rootfs,
                    "cmd_args": "console=hvc0"
                }
            }
        })
        .to_string();
        VmDescription::parse(&text).unwrap()
    }

    fn vm(dir: &Path, cpus: u32, program: GuestProgram) -> Vm {
        Vm::new(
            description(dir, cpus),
            Arc::new(ScriptedBackend::uniform(program)),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_invalid_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm(dir.path(), 1, GuestProgram::new().halt());

        // (operation, result)
        let cases: Vec<(&str, Result<()>)> = vec![
            ("pause", vm.pause()),
            ("resume", vm.resume()),
            ("stop", vm.stop()),
            ("interrupt", vm.interrupt(0)),
            ("wait", vm.wait()),
        ];
        for (op, result) in cases {
            assert!(
                matches!(result, Err(Error::InvalidState { .. })),
                "{} should be rejected in configured",
                op
            );
        }
        assert_eq!(vm.state(), VmState::Configured);
    }

    #[test]
    fn test_start_pause_resume_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm(dir.path(), 2, GuestProgram::new().halt());

        vm.start().unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert!(vm.boot_info().is_some());
        assert!(vm.start().is_err());

        vm.pause().unwrap();
        assert_eq!(vm.state(), VmState::Paused);
        vm.resume().unwrap();
        assert_eq!(vm.vcpus().live_indices(), vec![0, 1]);

        vm.stop().unwrap();
        assert_eq!(vm.state(), VmState::Terminated);
        assert!(vm.devices().devices().is_none());
        assert!(vm.wait().is_ok());
    }

    #[test]
    fn test_guest_shutdown_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm(dir.path(), 2, GuestProgram::new().shutdown());
        vm.start().unwrap();
        vm.wait().unwrap();
        assert_eq!(vm.state(), VmState::Terminated);
        assert_eq!(vm.vcpus().live_count(), 0);
    }

    #[test]
    fn test_boot_failure_crashes() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm(dir.path(), 1, GuestProgram::new().halt());
        std::fs::remove_file(dir.path().join("vmlinux")).unwrap();

        let err = vm.start().unwrap_err();
        assert!(matches!(err, Error::BootFailed(_)), "{}", err);
        assert_eq!(vm.state(), VmState::Crashed);
        assert_eq!(vm.vcpus().live_count(), 0);
        assert!(vm.crash_reason().unwrap().contains("kernel"));
        assert!(matches!(vm.wait(), Err(Error::VmCrashed { .. })));
    }

    #[test]
    fn test_wait_timeout_while_halted() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm(dir.path(), 1, GuestProgram::new().halt().shutdown());
        vm.start().unwrap();

        assert!(!vm.wait_timeout(Duration::from_millis(50)).unwrap());
        vm.interrupt(0).unwrap();
        assert!(vm.wait_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(vm.state(), VmState::Terminated);
    }

    #[test]
    fn test_wait_rejects_paused_vm() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm(dir.path(), 1, GuestProgram::new().halt().shutdown());
        vm.start().unwrap();
        vm.pause().unwrap();

        assert!(matches!(vm.wait(), Err(Error::InvalidState { .. })));
        assert_eq!(vm.state(), VmState::Paused);
        assert!(!vm.wait_timeout(Duration::from_millis(50)).unwrap());

        vm.interrupt(0).unwrap();
        vm.resume().unwrap();
        vm.wait().unwrap();
        assert_eq!(vm.state(), VmState::Terminated);
    }
}
