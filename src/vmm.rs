//! Hypervisor-level context.
//!
//! One [`Vmm`] is created at process start and passed to whatever needs to
//! create or drive VMs. It is initialized once and never re-initialized
//! after shutdown.

use crate::backend::{default_backend, ExecutionBackend};
use crate::config::HypervisorSettings;
use crate::error::{Error, Result};
use crate::vm::{Vm, VmState};
use shuairan_desc::VmDescription;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// VM identifier, unique within one [`Vmm`].
pub type VmId = u32;

/// Hypervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmState {
    /// Constructed, not yet accepting VMs.
    Uninitialized,
    /// Accepting VMs.
    Ready,
    /// Shut down; final.
    ShuttingDown,
}

impl fmt::Display for VmmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmState::Uninitialized => f.write_str("uninitialized"),
            VmmState::Ready => f.write_str("ready"),
            VmmState::ShuttingDown => f.write_str("shutting down"),
        }
    }
}

/// The hypervisor context: settings, execution backend and live VMs.
pub struct Vmm {
    state: VmmState,
    settings: HypervisorSettings,
    backend: Arc<dyn ExecutionBackend>,
    vms: BTreeMap<VmId, Vm>,
    next_id: VmId,
}

impl Vmm {
    /// Create a hypervisor context using the default backend.
    pub fn new(settings: HypervisorSettings) -> Self {
        Self::with_backend(settings, default_backend())
    }

    /// Create a hypervisor context with a specific execution backend.
    pub fn with_backend(settings: HypervisorSettings, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            state: VmmState::Uninitialized,
            settings,
            backend,
            vms: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> VmmState {
        self.state
    }

    /// Settings in effect.
    pub fn settings(&self) -> &HypervisorSettings {
        &self.settings
    }

    /// Start accepting VMs.
    pub fn init(&mut self) -> Result<()> {
        if self.state != VmmState::Uninitialized {
            return Err(Error::invalid_state("uninitialized", self.state));
        }
        tracing::info!(
            backend = self.backend.name(),
            max_vms = self.settings.max_vms,
            grace_period = %humantime::format_duration(self.settings.grace_period()),
            "hypervisor ready"
        );
        self.state = VmmState::Ready;
        Ok(())
    }

    fn expect_ready(&self) -> Result<()> {
        if self.state == VmmState::Ready {
            Ok(())
        } else {
            Err(Error::invalid_state("ready", self.state))
        }
    }

    /// Register a VM for `description`. It starts in `Configured`.
    pub fn create_vm(&mut self, description: VmDescription) -> Result<VmId> {
        self.expect_ready()?;
        let live = self.vms.values().filter(|vm| !vm.state().is_terminal()).count();
        if live >= self.settings.max_vms {
            return Err(Error::Capacity(format!(
                "{} of {} vm slots in use",
                live, self.settings.max_vms
            )));
        }

        let id = self.next_id;
        self.next_id += 1;
        let vm = Vm::new(description, Arc::clone(&self.backend), self.settings.grace_period());
        tracing::info!(
            vm = id,
            vcpus = vm.description().cpu.count,
            memory_mib = vm.description().memory.size_mib,
            devices = vm.description().device.len(),
            "vm created"
        );
        self.vms.insert(id, vm);
        Ok(id)
    }

    /// Parse `text` and register the VM. Nothing is created if parsing fails.
    pub fn create_vm_from_str(&mut self, text: &str) -> Result<VmId> {
        let description = VmDescription::parse(text)?;
        self.create_vm(description)
    }

    /// Read and parse the description at `path` and register the VM.
    pub fn create_vm_from_file(&mut self, path: &Path) -> Result<VmId> {
        let description = VmDescription::from_file(path)?;
        self.create_vm(description)
    }

    /// The VM with `id`.
    pub fn vm(&self, id: VmId) -> Result<&Vm> {
        self.vms.get(&id).ok_or(Error::VmNotFound { id })
    }

    /// The VM with `id`, mutably.
    pub fn vm_mut(&mut self, id: VmId) -> Result<&mut Vm> {
        self.vms.get_mut(&id).ok_or(Error::VmNotFound { id })
    }

    /// Ids of every registered VM, ascending.
    pub fn vm_ids(&self) -> Vec<VmId> {
        self.vms.keys().copied().collect()
    }

    /// Boot VM `id`.
    pub fn launch(&mut self, id: VmId) -> Result<()> {
        self.expect_ready()?;
        self.vm_mut(id)?.start()
    }

    /// Boot VM `id` if needed and block until it terminates or crashes.
    pub fn run_to_completion(&mut self, id: VmId) -> Result<VmState> {
        self.expect_ready()?;
        let vm = self.vm_mut(id)?;
        if vm.state() == VmState::Configured {
            vm.start()?;
        }
        vm.wait()?;
        Ok(vm.state())
    }

    /// Unregister a VM that is not running.
    pub fn remove_vm(&mut self, id: VmId) -> Result<Vm> {
        let state = self.vm(id)?.state();
        if !state.is_terminal() && state != VmState::Configured {
            return Err(Error::invalid_state("configured, terminated or crashed", state));
        }
        self.vms.remove(&id).ok_or(Error::VmNotFound { id })
    }

    /// Stop every running VM and refuse further work. Every VM is visited;
    /// the first failure is returned.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == VmmState::ShuttingDown {
            return Ok(());
        }
        tracing::info!(vms = self.vms.len(), "hypervisor shutting down");
        self.state = VmmState::ShuttingDown;

        let mut first_error = None;
        for (id, vm) in self.vms.iter_mut() {
            if matches!(vm.state(), VmState::Running | VmState::Paused) {
                if let Err(e) = vm.stop() {
                    tracing::error!(vm = *id, error = %e, "vm stop failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Vmm {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "hypervisor shutdown on drop failed");
        }
    }
}
