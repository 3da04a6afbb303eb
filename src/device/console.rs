//! Guest console.
//!
//! The guest writes bytes to the emergency write register in config space.
//! Complete lines are logged and kept in a bounded history; a serial console
//! also echoes them to stdout.

use super::virtio::{VirtioMmio, DEVICE_ID_CONSOLE};
use super::{write_le, Device, DeviceError, DeviceKind, DeviceResult, VIRTIO_CONFIG_OFFSET};
use parking_lot::Mutex;
use shuairan_desc::ConsoleConfig;
use std::collections::VecDeque;
use std::io::Write;
use std::str::FromStr;

const CONFIG_COLS: u64 = 0x0;
const CONFIG_ROWS: u64 = 0x2;
const CONFIG_EMERG_WR: u64 = 0x8;
const COLS: u64 = 80;
const ROWS: u64 = 25;

/// Lines retained per console.
const HISTORY_LINES: usize = 256;

/// Longest line kept; a guest that writes more without a newline gets it
/// split here.
const MAX_LINE_BYTES: usize = 4096;

/// Console flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleKind {
    /// Output mirrored to the host's stdout.
    Serial,
    /// Output only logged.
    Virtio,
}

impl FromStr for ConsoleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(ConsoleKind::Serial),
            "virtio" => Ok(ConsoleKind::Virtio),
            other => Err(format!("unknown console type: {}", other)),
        }
    }
}

#[derive(Default)]
struct Output {
    partial: Vec<u8>,
    lines: VecDeque<String>,
}

impl Output {
    fn push_line(&mut self, line: String) {
        if self.lines.len() == HISTORY_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

/// Console device.
pub struct ConsoleDevice {
    kind: ConsoleKind,
    regs: VirtioMmio,
    output: Mutex<Output>,
}

impl ConsoleDevice {
    /// Build a console from its description entry.
    pub fn new(config: &ConsoleConfig) -> DeviceResult<Self> {
        let kind = config.kind.parse().map_err(DeviceError::Backend)?;
        Ok(Self {
            kind,
            regs: VirtioMmio::new(DEVICE_ID_CONSOLE, 2),
            output: Mutex::new(Output::default()),
        })
    }

    /// Console flavour.
    pub fn console_kind(&self) -> ConsoleKind {
        self.kind
    }

    /// Completed output lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.output.lock().lines.iter().cloned().collect()
    }

    fn put_bytes(&self, data: &[u8]) {
        let mut output = self.output.lock();
        for &byte in data {
            if byte == b'\n' {
                self.flush_line(&mut output);
                continue;
            }
            output.partial.push(byte);
            if output.partial.len() >= MAX_LINE_BYTES {
                self.flush_line(&mut output);
            }
        }
    }

    fn flush_line(&self, output: &mut Output) {
        let line = String::from_utf8_lossy(&output.partial)
            .trim_end_matches('\r')
            .to_string();
        output.partial.clear();
        self.emit(&line);
        output.push_line(line);
    }

    fn emit(&self, line: &str) {
        tracing::info!(target: "shuairan::guest", console = ?self.kind, "{}", line);
        if self.kind == ConsoleKind::Serial {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
        }
    }
}

impl Device for ConsoleDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Console
    }

    fn queue_count(&self) -> u16 {
        self.regs.queues()
    }

    fn mmio_read(&self, offset: u64, data: &mut [u8]) -> DeviceResult<()> {
        if VirtioMmio::is_register(offset) {
            return self.regs.read(offset, data);
        }
        let value = match offset - VIRTIO_CONFIG_OFFSET {
            CONFIG_COLS => COLS,
            CONFIG_ROWS => ROWS,
            _ => 0,
        };
        write_le(data, value);
        Ok(())
    }

    fn mmio_write(&self, offset: u64, data: &[u8]) -> DeviceResult<()> {
        if VirtioMmio::is_register(offset) {
            return match self.regs.write(offset, data)? {
                Some(queue) => self.queue_notify(queue),
                None => Ok(()),
            };
        }
        match offset - VIRTIO_CONFIG_OFFSET {
            CONFIG_EMERG_WR => {
                self.put_bytes(data);
                Ok(())
            }
            other => Err(DeviceError::backend(format!(
                "console config offset {:#x} is read-only",
                other
            ))),
        }
    }

    fn queue_notify(&self, queue: u16) -> DeviceResult<()> {
        if self.regs.notify(queue)? {
            tracing::trace!(queue, "console queue kicked");
        }
        Ok(())
    }

    fn shutdown(&self) -> DeviceResult<()> {
        // Flush an unterminated last line
        let mut output = self.output.lock();
        if !output.partial.is_empty() {
            self.flush_line(&mut output);
        }
        Ok(())
    }
}
