//! Run command implementation.

use clap::Args;
use shuairan::config::HypervisorSettings;
use shuairan::Vmm;
use std::path::PathBuf;
use std::time::Duration;

/// Boot a VM from its description and wait until it shuts down.
#[derive(Args, Debug)]
pub struct RunCmd {
    /// Path to the VM description (JSON).
    pub config: PathBuf,

    /// How long to wait for vCPUs to acknowledge control commands
    /// (e.g. "500ms", "5s").
    #[arg(long, value_parser = humantime::parse_duration)]
    pub grace_period: Option<Duration>,
}

impl RunCmd {
    /// Execute the run command.
    pub fn run(self, mut settings: HypervisorSettings) -> shuairan::Result<()> {
        if let Some(grace_period) = self.grace_period {
            settings.set_grace_period(grace_period)?;
        }

        let mut vmm = Vmm::new(settings);
        vmm.init()?;

        // Parse before anything is allocated
        let id = vmm.create_vm_from_file(&self.config)?;
        let vm = vmm.vm(id)?;
        println!(
            "Booting VM from {} ({} vCPU(s), {} MiB, {} device(s))...",
            self.config.display(),
            vm.description().cpu.count,
            vm.description().memory.size_mib,
            vm.description().device.len()
        );

        let state = vmm.run_to_completion(id)?;
        vmm.shutdown()?;
        println!("VM {}", state);
        Ok(())
    }
}
