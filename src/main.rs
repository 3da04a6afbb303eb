//! shuairan CLI entry point.

use clap::{Parser, Subcommand};
use shuairan::config::HypervisorSettings;
use shuairan::logging::init_logging;
use std::path::PathBuf;

mod cli;

/// shuairan - lightweight hypervisor
#[derive(Parser, Debug)]
#[command(name = "shuairan")]
#[command(about = "Lightweight hypervisor: boot a VM from a JSON description")]
#[command(version)]
struct Cli {
    /// Hypervisor settings file (TOML).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level for shuairan when RUST_LOG is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Boot a VM and wait until it terminates.
    Run(cli::run::RunCmd),

    /// Check a VM description without booting it.
    Validate(cli::validate::ValidateCmd),
}

fn main() {
    let cli = Cli::parse();

    // Load settings; an explicitly named file must be valid
    let mut settings = match HypervisorSettings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(level) = cli.log_level {
        settings.log.level = level;
    }
    if let Some(file) = cli.log_file {
        settings.log.file = Some(file);
    }
    settings.log.json |= cli.json_logs;

    if let Err(e) = init_logging(&settings.log) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    tracing::debug!(version = shuairan::VERSION, "starting shuairan");

    // Execute command
    let result = match cli.command {
        Commands::Run(cmd) => cmd.run(settings),
        Commands::Validate(cmd) => cmd.run(),
    };

    // Handle errors
    if let Err(e) = result {
        if e.is_fatal() {
            tracing::error!(error = %e, vcpu = ?e.vcpu_index(), "command failed");
        } else {
            tracing::warn!(error = %e, "command rejected");
        }
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
