//! Device realization, dispatch and teardown.

use super::{
    mmio_window, BlockDevice, ConsoleDevice, Device, DeviceError, DeviceKind, DeviceResult,
    IoEventToken, MmioOp, MmioRange, NetDevice, VfioDevice, MMIO_BASE, MMIO_WINDOW_SIZE,
};
use shuairan_desc::DeviceConfig;
use std::sync::Arc;

/// Construct the device for one description entry.
pub fn create_device(config: &DeviceConfig) -> DeviceResult<Box<dyn Device>> {
    let device: Box<dyn Device> = match config {
        DeviceConfig::VirtioBlk(block) => Box::new(BlockDevice::open(block)?),
        DeviceConfig::VirtioNet(net) => Box::new(NetDevice::new(net)?),
        DeviceConfig::Vfio(vfio) => Box::new(VfioDevice::open(vfio)?),
        DeviceConfig::Console(console) => Box::new(ConsoleDevice::new(console)?),
    };
    Ok(device)
}

/// Summary of one realized device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Description index.
    pub index: usize,
    /// Device variant.
    pub kind: DeviceKind,
    /// Guest MMIO window.
    pub mmio: MmioRange,
    /// Registered ioevent queues.
    pub queues: u16,
}

struct DeviceEntry {
    mmio: MmioRange,
    device: Box<dyn Device>,
}

/// The realized devices of one VM.
///
/// Structure is fixed once built. Lookups take `&self` and never lock;
/// each device serializes its own state.
pub struct DeviceSet {
    entries: Vec<DeviceEntry>,
}

impl DeviceSet {
    /// Build one device per entry, in order. If entry `k` fails, devices
    /// `0..k` are shut down and nothing is returned.
    pub fn build(configs: &[DeviceConfig]) -> DeviceResult<Self> {
        let mut entries: Vec<DeviceEntry> = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            match create_device(config) {
                Ok(device) => {
                    let mmio = mmio_window(index);
                    tracing::debug!(
                        device = index,
                        driver = config.driver(),
                        base = format_args!("{:#x}", mmio.base),
                        queues = device.queue_count(),
                        "device realized"
                    );
                    entries.push(DeviceEntry { mmio, device });
                }
                Err(e) => {
                    let partial = DeviceSet { entries };
                    if let Err(teardown) = partial.shutdown() {
                        tracing::warn!(error = %teardown, "partial device set teardown failed");
                    }
                    return Err(DeviceError::Realize {
                        index,
                        driver: config.driver(),
                        reason: e.reason(),
                    });
                }
            }
        }
        Ok(Self { entries })
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no devices.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-device summary in index order.
    pub fn info(&self) -> Vec<DeviceInfo> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| DeviceInfo {
                index,
                kind: entry.device.kind(),
                mmio: entry.mmio,
                queues: entry.device.queue_count(),
            })
            .collect()
    }

    /// Device at `index`.
    pub fn device(&self, index: usize) -> Option<&dyn Device> {
        self.entries.get(index).map(|entry| entry.device.as_ref())
    }

    fn access_error(&self, index: usize, e: DeviceError) -> DeviceError {
        DeviceError::Access {
            index,
            driver: self.entries[index].device.kind().driver(),
            reason: e.reason(),
        }
    }

    /// Route a guest MMIO access to the device whose window contains it.
    pub fn dispatch_mmio(&self, address: u64, op: MmioOp<'_>) -> DeviceResult<()> {
        let unmapped = DeviceError::UnmappedAccess {
            address,
            len: op.len(),
        };
        let index = match address.checked_sub(MMIO_BASE) {
            Some(offset) => (offset / MMIO_WINDOW_SIZE) as usize,
            None => return Err(unmapped),
        };
        let entry = match self.entries.get(index) {
            Some(entry) => entry,
            None => return Err(unmapped),
        };
        let offset = match entry.mmio.offset_of(address, op.len()) {
            Some(offset) => offset,
            None => return Err(unmapped),
        };

        let result = match op {
            MmioOp::Read(data) => entry.device.mmio_read(offset, data),
            MmioOp::Write(data) => entry.device.mmio_write(offset, data),
        };
        result.map_err(|e| self.access_error(index, e))
    }

    /// Route a queue notification to the device that registered `token`.
    pub fn dispatch_ioevent(&self, token: IoEventToken) -> DeviceResult<()> {
        let index = token.device();
        let entry = self
            .entries
            .get(index)
            .filter(|entry| token.queue() < entry.device.queue_count())
            .ok_or(DeviceError::UnknownIoEvent { token })?;
        entry
            .device
            .queue_notify(token.queue())
            .map_err(|e| self.access_error(index, e))
    }

    fn pci_device(&self, index: usize) -> DeviceResult<&dyn super::PciConfigSpace> {
        let entry = self.entries.get(index).ok_or_else(|| {
            DeviceError::backend(format!("no device at index {}", index))
        })?;
        entry.device.pci_config().ok_or_else(|| DeviceError::Access {
            index,
            driver: entry.device.kind().driver(),
            reason: "no pci configuration space".to_string(),
        })
    }

    /// Read the PCI configuration space of the device at `index`.
    pub fn pci_config_read(&self, index: usize, offset: u16, data: &mut [u8]) -> DeviceResult<()> {
        self.pci_device(index)?
            .config_read(offset, data)
            .map_err(|e| self.access_error(index, e))
    }

    /// Write the PCI configuration space of the device at `index`.
    pub fn pci_config_write(&self, index: usize, offset: u16, data: &[u8]) -> DeviceResult<()> {
        self.pci_device(index)?
            .config_write(offset, data)
            .map_err(|e| self.access_error(index, e))
    }

    /// Shut every device down in reverse order. All devices are visited;
    /// the first failure is returned.
    fn shutdown(&self) -> DeviceResult<()> {
        let mut first_error = None;
        for (index, entry) in self.entries.iter().enumerate().rev() {
            let driver = entry.device.kind().driver();
            match entry.device.shutdown() {
                Ok(()) => tracing::debug!(device = index, driver, "device shut down"),
                Err(e) => {
                    tracing::warn!(device = index, driver, error = %e, "device shutdown failed");
                    first_error.get_or_insert(DeviceError::Teardown {
                        index,
                        driver,
                        reason: e.reason(),
                    });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Owns the realized [`DeviceSet`] of one VM.
#[derive(Default)]
pub struct DeviceManager {
    set: Option<Arc<DeviceSet>>,
}

impl DeviceManager {
    /// Create a manager with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Realize `configs` and publish the resulting set. Fails without
    /// registering anything if any constructor fails.
    pub fn realize(&mut self, configs: &[DeviceConfig]) -> DeviceResult<Arc<DeviceSet>> {
        if self.set.is_some() {
            return Err(DeviceError::backend("devices already realized"));
        }
        let set = Arc::new(DeviceSet::build(configs)?);
        tracing::info!(devices = set.len(), "devices realized");
        self.set = Some(Arc::clone(&set));
        Ok(set)
    }

    /// The realized set, if any.
    pub fn devices(&self) -> Option<&Arc<DeviceSet>> {
        self.set.as_ref()
    }

    fn realized(&self) -> DeviceResult<&DeviceSet> {
        self.set.as_deref().ok_or(DeviceError::NotRealized)
    }

    /// See [`DeviceSet::dispatch_mmio`].
    pub fn dispatch_mmio(&self, address: u64, op: MmioOp<'_>) -> DeviceResult<()> {
        self.realized()?.dispatch_mmio(address, op)
    }

    /// See [`DeviceSet::dispatch_ioevent`].
    pub fn dispatch_ioevent(&self, token: IoEventToken) -> DeviceResult<()> {
        self.realized()?.dispatch_ioevent(token)
    }

    /// Shut every device down and drop the set. Refused while any vCPU
    /// still holds the set.
    pub fn teardown(&mut self) -> DeviceResult<()> {
        let set = match self.set.take() {
            Some(set) => set,
            None => return Ok(()),
        };
        let set = match Arc::try_unwrap(set) {
            Ok(set) => set,
            Err(shared) => {
                let holders = Arc::strong_count(&shared) - 1;
                self.set = Some(shared);
                return Err(DeviceError::InUse { holders });
            }
        };
        let result = set.shutdown();
        tracing::info!(devices = set.len(), "devices torn down");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{REG_DEVICE_ID, REG_MAGIC, REG_STATUS, STATUS_DRIVER_OK, VIRTIO_MMIO_MAGIC};
    use shuairan_desc::{BlockConfig, ConsoleConfig, NetConfig};
    use std::path::PathBuf;

    fn console() -> DeviceConfig {
        DeviceConfig::Console(ConsoleConfig {
            kind: "virtio".into(),
        })
    }

    fn net(mac: &str) -> DeviceConfig {
        DeviceConfig::VirtioNet(NetConfig {
            mac: mac.into(),
            tap: None,
        })
    }

    fn read_u32(devices: &DeviceSet, address: u64) -> DeviceResult<u32> {
        let mut data = [0u8; 4];
        devices.dispatch_mmio(address, MmioOp::Read(&mut data))?;
        Ok(u32::from_le_bytes(data))
    }

    #[test]
    fn test_realize_in_order() {
        let mut manager = DeviceManager::new();
        let set = manager.realize(&[console(), net("52:54:00:00:00:01")]).unwrap();

        let info = set.info();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].kind, DeviceKind::Console);
        assert_eq!(info[1].kind, DeviceKind::Net);
        assert_eq!(info[1].mmio.base, MMIO_BASE + MMIO_WINDOW_SIZE);
        assert_eq!(info[1].queues, 2);

        assert_eq!(read_u32(&set, MMIO_BASE + REG_MAGIC).unwrap(), VIRTIO_MMIO_MAGIC);
        assert_eq!(read_u32(&set, info[1].mmio.base + REG_DEVICE_ID).unwrap(), 1);
    }

    #[test]
    fn test_realize_failure_reports_index() {
        let mut manager = DeviceManager::new();
        let configs = [
            console(),
            DeviceConfig::VirtioBlk(BlockConfig {
                source: PathBuf::from("/nonexistent/disk.img"),
                read_only: false,
            }),
            console(),
        ];
        let err = manager.realize(&configs).err().unwrap();
        match err {
            DeviceError::Realize { index, driver, .. } => {
                assert_eq!(index, 1);
                assert_eq!(driver, "virtio-blk");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(manager.devices().is_none());
        assert!(matches!(
            manager.dispatch_mmio(MMIO_BASE, MmioOp::Read(&mut [0u8; 4])),
            Err(DeviceError::NotRealized)
        ));
    }

    #[test]
    fn test_unmapped_accesses() {
        let set = DeviceSet::build(&[console()]).unwrap();

        let cases = [MMIO_BASE - 4, MMIO_BASE + MMIO_WINDOW_SIZE, MMIO_BASE + MMIO_WINDOW_SIZE - 2, 0];
        for address in cases {
            let err = read_u32(&set, address).unwrap_err();
            assert!(
                matches!(err, DeviceError::UnmappedAccess { address: a, .. } if a == address),
                "{:#x}: {}",
                address,
                err
            );
        }
    }

    #[test]
    fn test_ioevent_dispatch() {
        let set = DeviceSet::build(&[net("52:54:00:00:00:01")]).unwrap();
        set.dispatch_mmio(MMIO_BASE + REG_STATUS, MmioOp::Write(&STATUS_DRIVER_OK.to_le_bytes()))
            .unwrap();

        assert!(set.dispatch_ioevent(IoEventToken::new(0, 1)).is_ok());
        assert!(matches!(
            set.dispatch_ioevent(IoEventToken::new(0, 2)),
            Err(DeviceError::UnknownIoEvent { .. })
        ));
        assert!(matches!(
            set.dispatch_ioevent(IoEventToken::new(1, 0)),
            Err(DeviceError::UnknownIoEvent { .. })
        ));
    }

    #[test]
    fn test_device_errors_carry_index() {
        let set = DeviceSet::build(&[console(), console()]).unwrap();
        let base = mmio_window(1).base;
        let err = set
            .dispatch_mmio(base + REG_MAGIC, MmioOp::Read(&mut [0u8; 2]))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Access { index: 1, .. }), "{}", err);

        let err = set.pci_config_read(0, 0, &mut [0u8; 4]).unwrap_err();
        assert!(err.to_string().contains("no pci configuration space"), "{}", err);
    }

    #[test]
    fn test_teardown_waits_for_holders() {
        let mut manager = DeviceManager::new();
        let set = manager.realize(&[console()]).unwrap();

        assert!(matches!(manager.teardown(), Err(DeviceError::InUse { holders: 1 })));
        assert!(manager.devices().is_some());

        drop(set);
        manager.teardown().unwrap();
        assert!(manager.devices().is_none());
        // Idempotent
        manager.teardown().unwrap();
    }
}
