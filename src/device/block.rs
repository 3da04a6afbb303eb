//! virtio block device backed by a host file.

use super::virtio::{VirtioMmio, DEVICE_ID_BLOCK};
use super::{write_le, Device, DeviceError, DeviceKind, DeviceResult};
use parking_lot::Mutex;
use shuairan_desc::BlockConfig;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Sector size exposed to the guest.
pub const SECTOR_SIZE: u64 = 512;

/// Config space: capacity in sectors (u64), then the read-only flag (u32).
const CONFIG_CAPACITY: u64 = 0x0;
const CONFIG_READ_ONLY: u64 = 0x8;
const CONFIG_SIZE: u64 = 0xc;

/// virtio block device.
pub struct BlockDevice {
    source: PathBuf,
    read_only: bool,
    capacity_sectors: u64,
    regs: VirtioMmio,
    /// Backing file; request processing holds this lock.
    file: Mutex<Option<File>>,
}

impl BlockDevice {
    /// Open the backing file described by `config`.
    pub fn open(config: &BlockConfig) -> DeviceResult<Self> {
        let source = &config.source;
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(source)
            .map_err(|e| DeviceError::backend(format!("open {}: {}", source.display(), e)))?;
        let len = file
            .metadata()
            .map_err(|e| DeviceError::backend(format!("stat {}: {}", source.display(), e)))?
            .len();

        tracing::debug!(
            source = %source.display(),
            read_only = config.read_only,
            bytes = len,
            "block device opened"
        );

        Ok(Self {
            source: source.clone(),
            read_only: config.read_only,
            capacity_sectors: len / SECTOR_SIZE,
            regs: VirtioMmio::new(DEVICE_ID_BLOCK, 1),
            file: Mutex::new(Some(file)),
        })
    }

    /// Backing file path.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Capacity in 512-byte sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    /// Notifications received on the request queue.
    pub fn notifications(&self) -> u64 {
        self.regs.notifications(0)
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) -> DeviceResult<()> {
        let end = offset + data.len() as u64;
        if end > CONFIG_SIZE {
            return Err(DeviceError::backend(format!(
                "config read past end: {:#x}+{}",
                offset,
                data.len()
            )));
        }
        let mut config = [0u8; CONFIG_SIZE as usize];
        write_le(&mut config[CONFIG_CAPACITY as usize..8], self.capacity_sectors);
        write_le(&mut config[CONFIG_READ_ONLY as usize..], u64::from(self.read_only));
        data.copy_from_slice(&config[offset as usize..end as usize]);
        Ok(())
    }
}

impl Device for BlockDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Block
    }

    fn queue_count(&self) -> u16 {
        self.regs.queues()
    }

    fn mmio_read(&self, offset: u64, data: &mut [u8]) -> DeviceResult<()> {
        if VirtioMmio::is_register(offset) {
            self.regs.read(offset, data)
        } else {
            self.config_read(offset - super::VIRTIO_CONFIG_OFFSET, data)
        }
    }

    fn mmio_write(&self, offset: u64, data: &[u8]) -> DeviceResult<()> {
        if !VirtioMmio::is_register(offset) {
            return Err(DeviceError::backend("block config space is read-only"));
        }
        match self.regs.write(offset, data)? {
            Some(queue) => self.queue_notify(queue),
            None => Ok(()),
        }
    }

    fn queue_notify(&self, queue: u16) -> DeviceResult<()> {
        let file = self.file.lock();
        if file.is_none() {
            return Err(DeviceError::backend("block device already shut down"));
        }
        if self.regs.notify(queue)? {
            tracing::trace!(source = %self.source.display(), queue, "block request queue kicked");
        }
        Ok(())
    }

    fn shutdown(&self) -> DeviceResult<()> {
        if let Some(file) = self.file.lock().take() {
            if !self.read_only {
                file.sync_all()
                    .map_err(|e| DeviceError::backend(format!("sync {}: {}", self.source.display(), e)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{REG_STATUS, STATUS_DRIVER_OK, VIRTIO_CONFIG_OFFSET};

    fn disk(bytes: usize) -> (tempfile::NamedTempFile, BlockConfig) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(bytes as u64).unwrap();
        let config = BlockConfig {
            source: file.path().to_path_buf(),
            read_only: false,
        };
        (file, config)
    }

    #[test]
    fn test_capacity_in_config_space() {
        let (_file, config) = disk(8 * 512);
        let dev = BlockDevice::open(&config).unwrap();
        assert_eq!(dev.capacity_sectors(), 8);

        let mut data = [0u8; 8];
        dev.mmio_read(VIRTIO_CONFIG_OFFSET, &mut data).unwrap();
        assert_eq!(u64::from_le_bytes(data), 8);
    }

    #[test]
    fn test_missing_source_fails() {
        let config = BlockConfig {
            source: PathBuf::from("/nonexistent/disk.img"),
            read_only: true,
        };
        let err = BlockDevice::open(&config).err().unwrap();
        assert!(err.reason().contains("/nonexistent/disk.img"));
    }

    #[test]
    fn test_notify_after_shutdown_fails() {
        let (_file, config) = disk(512);
        let dev = BlockDevice::open(&config).unwrap();
        dev.mmio_write(REG_STATUS, &STATUS_DRIVER_OK.to_le_bytes()).unwrap();
        dev.queue_notify(0).unwrap();
        assert_eq!(dev.notifications(), 1);

        dev.shutdown().unwrap();
        assert!(dev.queue_notify(0).is_err());
    }
}
