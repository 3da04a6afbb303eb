//! PCI passthrough device.
//!
//! The host function is located through sysfs and its configuration space
//! is snapshotted at realization. The guest sees that snapshot; only the
//! command register is writable.

use super::{read_le, write_le, Device, DeviceError, DeviceKind, DeviceResult, PciConfigSpace};
use parking_lot::Mutex;
use shuairan_desc::VfioConfig;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where the host exposes PCI functions.
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

const PCI_CONFIG_SIZE: usize = 256;
const PCI_COMMAND: usize = 0x4;
const BAR_SIZE: usize = 0x1000;

/// A PCI function address, `domain:bus:device.function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    /// PCI domain.
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Device number, below 32.
    pub device: u8,
    /// Function number, below 8.
    pub function: u8,
}

impl FromStr for PciAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || format!("malformed pci address: {}", s);
        let parts: Vec<&str> = s.split(':').collect();
        let (domain, bus, slot) = match parts.as_slice() {
            [domain, bus, slot] => (u16::from_str_radix(domain, 16).map_err(|_| malformed())?, *bus, *slot),
            [bus, slot] => (0, *bus, *slot),
            _ => return Err(malformed()),
        };
        let bus = u8::from_str_radix(bus, 16).map_err(|_| malformed())?;
        let (device, function) = slot.split_once('.').ok_or_else(malformed)?;
        let device = u8::from_str_radix(device, 16).map_err(|_| malformed())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| malformed())?;
        if device >= 32 || function >= 8 {
            return Err(malformed());
        }
        Ok(Self {
            domain,
            bus,
            device,
            function,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// Passthrough of one host PCI function.
pub struct VfioDevice {
    address: PciAddress,
    sysfs_path: PathBuf,
    config: Mutex<[u8; PCI_CONFIG_SIZE]>,
    bar: Mutex<Vec<u8>>,
}

impl VfioDevice {
    /// Open the host function named by `config` under [`SYSFS_PCI_DEVICES`].
    pub fn open(config: &VfioConfig) -> DeviceResult<Self> {
        Self::open_in(Path::new(SYSFS_PCI_DEVICES), config)
    }

    /// Open the host function named by `config` under `sysfs_root`.
    pub fn open_in(sysfs_root: &Path, config: &VfioConfig) -> DeviceResult<Self> {
        let address: PciAddress = config.source.parse().map_err(DeviceError::Backend)?;
        let sysfs_path = sysfs_root.join(address.to_string());
        let snapshot = std::fs::read(sysfs_path.join("config")).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                DeviceError::backend(format!("host device not found: {}", address))
            }
            _ => DeviceError::backend(format!("read config of {}: {}", address, e)),
        })?;

        let mut space = [0u8; PCI_CONFIG_SIZE];
        let len = snapshot.len().min(PCI_CONFIG_SIZE);
        space[..len].copy_from_slice(&snapshot[..len]);

        tracing::debug!(%address, path = %sysfs_path.display(), "vfio device opened");

        Ok(Self {
            address,
            sysfs_path,
            config: Mutex::new(space),
            bar: Mutex::new(vec![0; BAR_SIZE]),
        })
    }

    /// Host PCI address.
    pub fn address(&self) -> PciAddress {
        self.address
    }

    /// sysfs directory of the host function.
    pub fn sysfs_path(&self) -> &Path {
        &self.sysfs_path
    }

    fn bar_range(offset: u64, len: usize) -> DeviceResult<std::ops::Range<usize>> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= BAR_SIZE => Ok(start..end),
            _ => Err(DeviceError::backend(format!("bar access past end: {:#x}+{}", offset, len))),
        }
    }
}

impl PciConfigSpace for VfioDevice {
    fn config_read(&self, offset: u16, data: &mut [u8]) -> DeviceResult<()> {
        let start = offset as usize;
        let config = self.config.lock();
        let bytes = config
            .get(start..start + data.len())
            .ok_or_else(|| DeviceError::backend(format!("pci config read past end: {:#x}", offset)))?;
        data.copy_from_slice(bytes);
        Ok(())
    }

    fn config_write(&self, offset: u16, data: &[u8]) -> DeviceResult<()> {
        let start = offset as usize;
        if start != PCI_COMMAND || data.len() != 2 {
            // Everything but the command register is read-only; drop the write
            tracing::trace!(address = %self.address, offset, "ignored pci config write");
            return Ok(());
        }
        let mut config = self.config.lock();
        write_le(&mut config[PCI_COMMAND..PCI_COMMAND + 2], read_le(data));
        Ok(())
    }
}

impl Device for VfioDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Vfio
    }

    fn mmio_read(&self, offset: u64, data: &mut [u8]) -> DeviceResult<()> {
        let range = Self::bar_range(offset, data.len())?;
        data.copy_from_slice(&self.bar.lock()[range]);
        Ok(())
    }

    fn mmio_write(&self, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let range = Self::bar_range(offset, data.len())?;
        self.bar.lock()[range].copy_from_slice(data);
        Ok(())
    }

    fn pci_config(&self) -> Option<&dyn PciConfigSpace> {
        Some(self)
    }

    fn shutdown(&self) -> DeviceResult<()> {
        // Leave the function with memory and bus mastering disabled
        self.config.lock()[PCI_COMMAND..PCI_COMMAND + 2].fill(0);
        tracing::debug!(address = %self.address, "vfio device released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(address: &str) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(address);
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = vec![0u8; 64];
        config[..4].copy_from_slice(&[0x86, 0x80, 0x3a, 0x15]);
        std::fs::write(dir.join("config"), config).unwrap();
        root
    }

    fn vfio(source: &str) -> VfioConfig {
        VfioConfig {
            source: source.to_string(),
        }
    }

    #[test]
    fn test_pci_address_parsing() {
        let cases = [
            ("0000:00:1f.2", Some("0000:00:1f.2")),
            ("00:1f.2", Some("0000:00:1f.2")),
            ("0001:3b:00.0", Some("0001:3b:00.0")),
            ("00:20.0", None),
            ("00:1f.8", None),
            ("00:1f", None),
            ("garbage", None),
        ];
        for (input, expected) in cases {
            let parsed = input.parse::<PciAddress>().ok().map(|a| a.to_string());
            assert_eq!(parsed.as_deref(), expected, "{}", input);
        }
    }

    #[test]
    fn test_open_reads_config_snapshot() {
        let root = fake_sysfs("0000:00:1f.2");
        let dev = VfioDevice::open_in(root.path(), &vfio("00:1f.2")).unwrap();

        let mut ids = [0u8; 4];
        dev.config_read(0, &mut ids).unwrap();
        assert_eq!(ids, [0x86, 0x80, 0x3a, 0x15]);
        assert_eq!(dev.queue_count(), 0);
        assert!(dev.pci_config().is_some());
    }

    #[test]
    fn test_only_command_register_is_writable() {
        let root = fake_sysfs("0000:00:1f.2");
        let dev = VfioDevice::open_in(root.path(), &vfio("0000:00:1f.2")).unwrap();

        dev.config_write(0, &[0xff, 0xff]).unwrap();
        dev.config_write(PCI_COMMAND as u16, &[0x06, 0x00]).unwrap();

        let mut data = [0u8; 2];
        dev.config_read(0, &mut data).unwrap();
        assert_eq!(data, [0x86, 0x80]);
        dev.config_read(PCI_COMMAND as u16, &mut data).unwrap();
        assert_eq!(data, [0x06, 0x00]);

        dev.shutdown().unwrap();
        dev.config_read(PCI_COMMAND as u16, &mut data).unwrap();
        assert_eq!(data, [0, 0]);
    }

    #[test]
    fn test_missing_host_device() {
        let root = tempfile::tempdir().unwrap();
        let err = VfioDevice::open_in(root.path(), &vfio("0000:00:1f.2")).err().unwrap();
        assert!(err.reason().contains("host device not found"), "{}", err);
    }

    #[test]
    fn test_bar_shadow() {
        let root = fake_sysfs("0000:00:1f.2");
        let dev = VfioDevice::open_in(root.path(), &vfio("0000:00:1f.2")).unwrap();
        dev.mmio_write(0x10, &[1, 2, 3, 4]).unwrap();
        let mut data = [0u8; 4];
        dev.mmio_read(0x10, &mut data).unwrap();
        assert_eq!(data, [1, 2, 3, 4]);
        assert!(dev.mmio_read(BAR_SIZE as u64 - 2, &mut data).is_err());
    }
}
