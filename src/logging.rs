//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise shuairan's targets log at the level
//! from [`LogSettings`]. Output goes to stderr, or is appended to a file.

use crate::config::LogSettings;
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Build the filter used when `RUST_LOG` is not set.
fn default_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(format!("shuairan={}", level))
        .map_err(|e| Error::config("parse log level", format!("{}: {}", level, e)))
}

/// Install the global tracing subscriber.
pub fn init_logging(settings: &LogSettings) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(&settings.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true);

    let installed = match &settings.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::config("open log file", format!("{}: {}", path.display(), e)))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            if settings.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            if settings.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
    };

    installed.map_err(|e| Error::config("install log subscriber", e.to_string()))
}
