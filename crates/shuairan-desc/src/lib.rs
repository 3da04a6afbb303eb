//! VM description types for shuairan.
//!
//! A VM description is the declarative JSON document a guest is booted from:
//!
//! ```json
//! {
//!   "cpu": { "count": 2 },
//!   "memory": { "size_mib": 512 },
//!   "device": [
//!     { "driver": "virtio-blk", "specific": { "source": "/var/lib/disk.img" } }
//!   ],
//!   "os": {
//!     "type": "Linux",
//!     "specific": { "kernel_path": "/boot/vmlinux", "rootfs_path": "/var/lib/rootfs.img" }
//!   },
//!   "vmm": {}
//! }
//! ```
//!
//! Parsing is a pure function of the input text. Serializing a parsed
//! description yields the same document shape, so a description survives a
//! parse/serialize/parse cycle unchanged.

#![warn(missing_docs)]

mod error;
mod parse;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use error::{ConfigError, ConfigErrorKind, ParseError};

/// Upper bound on `cpu.count`.
pub const MAX_VCPUS: u32 = 512;

/// A validated VM description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmDescription {
    /// CPU configuration.
    pub cpu: CpuConfig,
    /// Guest memory configuration.
    pub memory: MemoryConfig,
    /// Devices, in realization order.
    pub device: Vec<DeviceConfig>,
    /// Guest operating system boot configuration.
    pub os: OsConfig,
    /// Hypervisor-scoped hints.
    pub vmm: VmmConfig,
}

impl VmDescription {
    /// Parse and validate a description from JSON text.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        parse::parse_description(text)
    }

    /// Read and parse a description file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ParseError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text)
    }

    /// Serialize back into the description JSON format.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl FromStr for VmDescription {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// CPU configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuConfig {
    /// Number of vCPUs, `1..=MAX_VCPUS`.
    pub count: u32,
}

/// Guest memory configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryConfig {
    /// Guest memory size in MiB, at least 1.
    pub size_mib: u32,
}

/// One device entry, keyed by its `driver` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "driver", content = "specific")]
pub enum DeviceConfig {
    /// virtio block device backed by a host file.
    #[serde(rename = "virtio-blk")]
    VirtioBlk(BlockConfig),
    /// virtio network device.
    #[serde(rename = "virtio-net")]
    VirtioNet(NetConfig),
    /// Host device passthrough.
    #[serde(rename = "vfio")]
    Vfio(VfioConfig),
    /// Guest console.
    #[serde(rename = "console")]
    Console(ConsoleConfig),
}

impl DeviceConfig {
    /// Driver names accepted in the `driver` field.
    pub const DRIVERS: &'static [&'static str] = &["virtio-blk", "virtio-net", "vfio", "console"];

    /// The `driver` tag of this entry.
    pub fn driver(&self) -> &'static str {
        match self {
            DeviceConfig::VirtioBlk(_) => "virtio-blk",
            DeviceConfig::VirtioNet(_) => "virtio-net",
            DeviceConfig::Vfio(_) => "vfio",
            DeviceConfig::Console(_) => "console",
        }
    }
}

/// `specific` payload of a `virtio-blk` device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockConfig {
    /// Backing file on the host.
    pub source: PathBuf,
    /// Expose the disk read-only.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

/// `specific` payload of a `virtio-net` device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetConfig {
    /// Guest MAC address, `xx:xx:xx:xx:xx:xx`.
    pub mac: String,
    /// Host tap interface name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
}

/// `specific` payload of a `vfio` device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VfioConfig {
    /// Host device identifier, a PCI BDF such as `0000:00:1f.2`.
    pub source: String,
}

/// `specific` payload of a `console` device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleConfig {
    /// Terminal kind.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Guest operating system, keyed by its `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "specific")]
pub enum OsConfig {
    /// Linux kernel boot.
    Linux(LinuxConfig),
}

impl OsConfig {
    /// OS type names accepted in the `type` field.
    pub const TYPES: &'static [&'static str] = &["Linux"];
}

/// Linux boot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinuxConfig {
    /// Kernel image.
    pub kernel_path: PathBuf,
    /// Initial ramdisk.
    pub initrd_path: Option<PathBuf>,
    /// Root filesystem image, required unless booting from an initrd.
    pub rootfs_path: Option<PathBuf>,
    /// Kernel command line, passed through verbatim.
    pub cmd_args: String,
}

/// Hypervisor-scoped hints. Reserved; the object is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct VmmConfig(pub serde_json::Map<String, serde_json::Value>);
