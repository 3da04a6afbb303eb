//! virtio-mmio common register file.

use super::{read_le, write_le, DeviceError, DeviceResult};
use parking_lot::Mutex;

/// "virt" in little endian.
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;

/// Magic value register.
pub const REG_MAGIC: u64 = 0x000;
/// Version register.
pub const REG_VERSION: u64 = 0x004;
/// Device id register.
pub const REG_DEVICE_ID: u64 = 0x008;
/// Vendor id register.
pub const REG_VENDOR_ID: u64 = 0x00c;
/// Queue notify register.
pub const REG_QUEUE_NOTIFY: u64 = 0x050;
/// Device status register.
pub const REG_STATUS: u64 = 0x070;
/// Start of the device-specific configuration space.
pub const VIRTIO_CONFIG_OFFSET: u64 = 0x100;

/// virtio device id of a network card.
pub const DEVICE_ID_NET: u32 = 1;
/// virtio device id of a block device.
pub const DEVICE_ID_BLOCK: u32 = 2;
/// virtio device id of a console.
pub const DEVICE_ID_CONSOLE: u32 = 3;

/// Status bit set by the driver once the device is live.
pub const STATUS_DRIVER_OK: u32 = 0x4;

const MMIO_VERSION: u32 = 2;
const VENDOR_ID: u32 = 0x5348_5241;

struct VirtioState {
    status: u32,
    notifications: Vec<u64>,
}

/// Register file shared by the virtio device models.
pub(crate) struct VirtioMmio {
    device_id: u32,
    queues: u16,
    state: Mutex<VirtioState>,
}

impl VirtioMmio {
    pub(crate) fn new(device_id: u32, queues: u16) -> Self {
        Self {
            device_id,
            queues,
            state: Mutex::new(VirtioState {
                status: 0,
                notifications: vec![0; queues as usize],
            }),
        }
    }

    pub(crate) fn queues(&self) -> u16 {
        self.queues
    }

    /// Whether `offset` addresses the common registers rather than config space.
    pub(crate) fn is_register(offset: u64) -> bool {
        offset < VIRTIO_CONFIG_OFFSET
    }

    fn check_width(offset: u64, len: usize) -> DeviceResult<()> {
        if len != 4 || offset % 4 != 0 {
            return Err(DeviceError::backend(format!(
                "register access at {:#x} must be 4 bytes and aligned, got {} bytes",
                offset, len
            )));
        }
        Ok(())
    }

    pub(crate) fn read(&self, offset: u64, data: &mut [u8]) -> DeviceResult<()> {
        Self::check_width(offset, data.len())?;
        let value = match offset {
            REG_MAGIC => VIRTIO_MMIO_MAGIC,
            REG_VERSION => MMIO_VERSION,
            REG_DEVICE_ID => self.device_id,
            REG_VENDOR_ID => VENDOR_ID,
            REG_STATUS => self.state.lock().status,
            _ => 0,
        };
        write_le(data, u64::from(value));
        Ok(())
    }

    /// Apply a register write. Returns the queue number for queue-notify
    /// writes so the device can run its queue handler.
    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> DeviceResult<Option<u16>> {
        Self::check_width(offset, data.len())?;
        let value = read_le(data) as u32;
        match offset {
            REG_STATUS => {
                let mut state = self.state.lock();
                if value == 0 {
                    // Device reset
                    state.notifications.iter_mut().for_each(|n| *n = 0);
                }
                state.status = value;
                Ok(None)
            }
            REG_QUEUE_NOTIFY => Ok(Some(value as u16)),
            _ => Ok(None),
        }
    }

    /// Record a notification on `queue`. Returns false when the driver has
    /// not finished initialization and the kick is dropped.
    pub(crate) fn notify(&self, queue: u16) -> DeviceResult<bool> {
        if queue >= self.queues {
            return Err(DeviceError::backend(format!(
                "queue {} out of range ({} queues)",
                queue, self.queues
            )));
        }
        let mut state = self.state.lock();
        if state.status & STATUS_DRIVER_OK == 0 {
            return Ok(false);
        }
        state.notifications[queue as usize] += 1;
        Ok(true)
    }

    pub(crate) fn status(&self) -> u32 {
        self.state.lock().status
    }

    pub(crate) fn notifications(&self, queue: u16) -> u64 {
        self.state
            .lock()
            .notifications
            .get(queue as usize)
            .copied()
            .unwrap_or(0)
    }
}
