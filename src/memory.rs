//! Guest physical memory.

use crate::error::{Error, Result};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

/// Bytes per MiB.
pub const MIB: u64 = 1 << 20;

/// A single guest physical memory region starting at 0, backed by an
/// anonymous mapping. Pages are committed by the host only when touched, so
/// a large guest costs nothing until it writes.
pub struct GuestMemory {
    size: u64,
    mmap: GuestMemoryMmap,
}

impl GuestMemory {
    /// Map `size_mib` MiB of guest memory.
    pub fn new(size_mib: u32) -> Result<Self> {
        let size = u64::from(size_mib) * MIB;
        let len = usize::try_from(size).map_err(|_| {
            Error::boot_failed(format!("{} MiB of guest memory is not addressable", size_mib))
        })?;

        let mmap = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), len)]).map_err(|e| {
            Error::boot_failed(format!("map {} MiB of guest memory: {}", size_mib, e))
        })?;

        Ok(Self { size, mmap })
    }

    /// Region size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The underlying mapping, for loaders that write into guest memory
    /// directly.
    pub fn mmap(&self) -> &GuestMemoryMmap {
        &self.mmap
    }

    fn check(&self, addr: u64, len: usize) -> Result<GuestAddress> {
        match addr.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(GuestAddress(addr)),
            _ => Err(self.out_of_bounds(addr, len)),
        }
    }

    fn out_of_bounds(&self, addr: u64, len: usize) -> Error {
        Error::GuestMemory {
            addr,
            len,
            size: self.size,
        }
    }

    /// Copy `data` into guest memory at `addr`.
    pub fn write_at(&self, addr: u64, data: &[u8]) -> Result<()> {
        let guest_addr = self.check(addr, data.len())?;
        self.mmap.write_slice(data, guest_addr).map_err(|e| {
            tracing::debug!(addr, len = data.len(), error = %e, "guest memory write failed");
            self.out_of_bounds(addr, data.len())
        })
    }

    /// Fill `buf` from guest memory at `addr`.
    pub fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let guest_addr = self.check(addr, buf.len())?;
        let len = buf.len();
        self.mmap.read_slice(buf, guest_addr).map_err(|e| {
            tracing::debug!(addr, len, error = %e, "guest memory read failed");
            self.out_of_bounds(addr, len)
        })
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory").field("size", &self.size).finish()
    }
}
