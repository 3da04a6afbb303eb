//! Validate command implementation.

use clap::Args;
use shuairan::VmDescription;
use std::path::PathBuf;

/// Check a VM description and print it in normalized form.
#[derive(Args, Debug)]
pub struct ValidateCmd {
    /// Path to the VM description (JSON).
    pub config: PathBuf,
}

impl ValidateCmd {
    /// Execute the validate command.
    pub fn run(self) -> shuairan::Result<()> {
        let description = VmDescription::from_file(&self.config)?;
        let normalized = description
            .to_json_pretty()
            .map_err(|e| shuairan::Error::config("serialize description", e.to_string()))?;
        println!("{}", normalized);
        Ok(())
    }
}
