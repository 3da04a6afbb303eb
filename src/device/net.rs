//! virtio network device.

use super::virtio::{VirtioMmio, DEVICE_ID_NET};
use super::{write_le, Device, DeviceError, DeviceKind, DeviceResult, VIRTIO_CONFIG_OFFSET};
use shuairan_desc::NetConfig;
use std::fmt;
use std::str::FromStr;

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

/// Config space: mac (6 bytes), then link status (u16).
const CONFIG_STATUS: usize = 6;
const CONFIG_SIZE: usize = 8;
const LINK_UP: u64 = 1;

/// An Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("malformed mac address: {}", s))?;
            if part.len() != 2 {
                return Err(format!("malformed mac address: {}", s));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("malformed mac address: {}", s))?;
        }
        if parts.next().is_some() {
            return Err(format!("malformed mac address: {}", s));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

/// virtio network device with an rx and a tx queue.
pub struct NetDevice {
    mac: MacAddr,
    tap: Option<String>,
    regs: VirtioMmio,
}

impl NetDevice {
    /// Build a network device from its description entry.
    pub fn new(config: &NetConfig) -> DeviceResult<Self> {
        let mac: MacAddr = config.mac.parse().map_err(DeviceError::Backend)?;
        if let Some(tap) = &config.tap {
            if tap.is_empty() || tap.len() > 15 {
                return Err(DeviceError::backend(format!("invalid tap name: {:?}", tap)));
            }
        }
        tracing::debug!(%mac, tap = ?config.tap, "net device created");
        Ok(Self {
            mac,
            tap: config.tap.clone(),
            regs: VirtioMmio::new(DEVICE_ID_NET, 2),
        })
    }

    /// Guest MAC address.
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    /// Host tap interface, if attached.
    pub fn tap(&self) -> Option<&str> {
        self.tap.as_deref()
    }

    /// Notifications received on the transmit queue.
    pub fn tx_notifications(&self) -> u64 {
        self.regs.notifications(TX_QUEUE)
    }

    fn config_space(&self) -> [u8; CONFIG_SIZE] {
        let mut config = [0u8; CONFIG_SIZE];
        config[..6].copy_from_slice(&self.mac.0);
        write_le(&mut config[CONFIG_STATUS..], LINK_UP);
        config
    }
}

impl Device for NetDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Net
    }

    fn queue_count(&self) -> u16 {
        self.regs.queues()
    }

    fn mmio_read(&self, offset: u64, data: &mut [u8]) -> DeviceResult<()> {
        if VirtioMmio::is_register(offset) {
            return self.regs.read(offset, data);
        }
        let start = (offset - VIRTIO_CONFIG_OFFSET) as usize;
        let config = self.config_space();
        let bytes = config
            .get(start..start + data.len())
            .ok_or_else(|| DeviceError::backend(format!("config read past end: {:#x}", offset)))?;
        data.copy_from_slice(bytes);
        Ok(())
    }

    fn mmio_write(&self, offset: u64, data: &[u8]) -> DeviceResult<()> {
        if !VirtioMmio::is_register(offset) {
            return Err(DeviceError::backend("net config space is read-only"));
        }
        match self.regs.write(offset, data)? {
            Some(queue) => self.queue_notify(queue),
            None => Ok(()),
        }
    }

    fn queue_notify(&self, queue: u16) -> DeviceResult<()> {
        if self.regs.notify(queue)? {
            let direction = if queue == RX_QUEUE { "rx" } else { "tx" };
            tracing::trace!(mac = %self.mac, direction, "net queue kicked");
        }
        Ok(())
    }
}
