//! Virtual devices.
//!
//! Every device variant implements [`Device`]. The [`DeviceManager`] builds
//! one device per description entry and publishes them as an immutable
//! [`DeviceSet`], which vCPU threads share to route their exits.
//!
//! Guest address map: device `i` owns the MMIO window
//! `MMIO_BASE + i * MMIO_WINDOW_SIZE .. + MMIO_WINDOW_SIZE`. Queue
//! notifications arrive as ioevents whose token encodes the device index
//! and queue number.

mod block;
mod console;
mod manager;
mod net;
mod vfio;
mod virtio;

pub use block::BlockDevice;
pub use console::{ConsoleDevice, ConsoleKind};
pub use manager::{create_device, DeviceInfo, DeviceManager, DeviceSet};
pub use net::{MacAddr, NetDevice};
pub use vfio::{PciAddress, VfioDevice, SYSFS_PCI_DEVICES};
pub use virtio::{
    DEVICE_ID_BLOCK, DEVICE_ID_CONSOLE, DEVICE_ID_NET, REG_DEVICE_ID, REG_MAGIC, REG_QUEUE_NOTIFY,
    REG_STATUS, REG_VERSION, STATUS_DRIVER_OK, VIRTIO_CONFIG_OFFSET, VIRTIO_MMIO_MAGIC,
};

use std::fmt;
use thiserror::Error;

/// Guest physical address of the first device MMIO window.
pub const MMIO_BASE: u64 = 0xd000_0000;

/// Size of each device's MMIO window.
pub const MMIO_WINDOW_SIZE: u64 = 0x1000;

/// MMIO window of the device at `index`.
pub const fn mmio_window(index: usize) -> MmioRange {
    MmioRange {
        base: MMIO_BASE + index as u64 * MMIO_WINDOW_SIZE,
        size: MMIO_WINDOW_SIZE,
    }
}

/// Result type for device operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors raised by device construction and dispatch.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A device could not be constructed; nothing was registered.
    #[error("device realization failed: device[{index}] ({driver}): {reason}")]
    Realize {
        /// Description index of the failing entry.
        index: usize,
        /// Driver of the failing entry.
        driver: &'static str,
        /// Constructor message.
        reason: String,
    },

    /// A guest access hit no device window.
    #[error("unmapped mmio access: {len} bytes at {address:#x}")]
    UnmappedAccess {
        /// Guest physical address.
        address: u64,
        /// Access length.
        len: usize,
    },

    /// An ioevent token no device registered.
    #[error("unknown ioevent: {token}")]
    UnknownIoEvent {
        /// The unmatched token.
        token: IoEventToken,
    },

    /// A device rejected an access routed to it.
    #[error("device access failed: device[{index}] ({driver}): {reason}")]
    Access {
        /// Device index.
        index: usize,
        /// Device driver.
        driver: &'static str,
        /// Device message.
        reason: String,
    },

    /// A device failed while shutting down.
    #[error("device teardown failed: device[{index}] ({driver}): {reason}")]
    Teardown {
        /// Device index.
        index: usize,
        /// Device driver.
        driver: &'static str,
        /// Device message.
        reason: String,
    },

    /// The device set is still referenced by running vCPUs.
    #[error("device teardown failed: device set still shared by {holders} holder(s)")]
    InUse {
        /// Number of other references.
        holders: usize,
    },

    /// Dispatch was attempted before devices were realized.
    #[error("device dispatch failed: devices not realized")]
    NotRealized,

    /// Failure inside a device backend, before the manager attaches an index.
    #[error("device backend failed: {0}")]
    Backend(String),
}

impl DeviceError {
    /// Create a device backend error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }

    /// Message of a backend error, or the full message otherwise.
    pub(crate) fn reason(&self) -> String {
        match self {
            DeviceError::Backend(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Device variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// virtio block.
    Block,
    /// virtio network.
    Net,
    /// PCI passthrough.
    Vfio,
    /// Console.
    Console,
}

impl DeviceKind {
    /// Description `driver` tag for this kind.
    pub fn driver(&self) -> &'static str {
        match self {
            DeviceKind::Block => "virtio-blk",
            DeviceKind::Net => "virtio-net",
            DeviceKind::Vfio => "vfio",
            DeviceKind::Console => "console",
        }
    }

    /// Whether the device speaks virtio-mmio.
    pub fn is_virtio(&self) -> bool {
        !matches!(self, DeviceKind::Vfio)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.driver())
    }
}

/// A guest physical address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRange {
    /// First address.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
}

impl MmioRange {
    /// Offset of `address` within this range if `len` bytes fit.
    pub fn offset_of(&self, address: u64, len: usize) -> Option<u64> {
        let offset = address.checked_sub(self.base)?;
        let end = offset.checked_add(len as u64)?;
        (end <= self.size).then_some(offset)
    }
}

/// One MMIO access as seen by a device.
#[derive(Debug)]
pub enum MmioOp<'a> {
    /// Guest load; the device fills the buffer.
    Read(&'a mut [u8]),
    /// Guest store.
    Write(&'a [u8]),
}

impl MmioOp<'_> {
    /// Access width in bytes.
    pub fn len(&self) -> usize {
        match self {
            MmioOp::Read(data) => data.len(),
            MmioOp::Write(data) => data.len(),
        }
    }

    /// Whether the access is zero-width.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration token for an event-driven queue notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoEventToken(pub u64);

impl IoEventToken {
    /// Token for `queue` of the device at `device`.
    pub const fn new(device: usize, queue: u16) -> Self {
        Self(((device as u64) << 16) | queue as u64)
    }

    /// Device index encoded in the token.
    pub const fn device(&self) -> usize {
        (self.0 >> 16) as usize
    }

    /// Queue number encoded in the token.
    pub const fn queue(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Display for IoEventToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// PCI configuration space access.
pub trait PciConfigSpace: Send + Sync {
    /// Read `data.len()` bytes at `offset`.
    fn config_read(&self, offset: u16, data: &mut [u8]) -> DeviceResult<()>;

    /// Write `data` at `offset`.
    fn config_write(&self, offset: u16, data: &[u8]) -> DeviceResult<()>;
}

/// A virtual device.
///
/// Devices may be entered concurrently from several vCPU threads, so every
/// implementation serializes its own mutable state. Methods take `&self`.
pub trait Device: Send + Sync {
    /// Device variant.
    fn kind(&self) -> DeviceKind;

    /// Number of virtqueues, each registered as one ioevent.
    fn queue_count(&self) -> u16 {
        0
    }

    /// Handle a load at `offset` within the device's MMIO window.
    fn mmio_read(&self, offset: u64, data: &mut [u8]) -> DeviceResult<()>;

    /// Handle a store at `offset` within the device's MMIO window.
    fn mmio_write(&self, offset: u64, data: &[u8]) -> DeviceResult<()>;

    /// Handle a notification on `queue`.
    fn queue_notify(&self, queue: u16) -> DeviceResult<()> {
        Err(DeviceError::backend(format!("queue {} not supported", queue)))
    }

    /// PCI configuration space, for devices that have one.
    fn pci_config(&self) -> Option<&dyn PciConfigSpace> {
        None
    }

    /// Release host resources.
    fn shutdown(&self) -> DeviceResult<()> {
        Ok(())
    }
}

/// Copy the low `data.len()` bytes of `value` into `data`.
pub(crate) fn write_le(data: &mut [u8], value: u64) {
    let bytes = value.to_le_bytes();
    let len = data.len().min(bytes.len());
    data[..len].copy_from_slice(&bytes[..len]);
}

/// Little-endian value of up to 8 bytes.
pub(crate) fn read_le(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let len = data.len().min(bytes.len());
    bytes[..len].copy_from_slice(&data[..len]);
    u64::from_le_bytes(bytes)
}
