//! Linux guest image loading.
//!
//! Guest physical layout:
//!
//! ```text
//! 0x0000_7000  zero page (x86_64 boot_params)
//! 0x0002_0000  kernel command line (NUL-terminated)
//! 0x0010_0000  kernel image
//! ...
//! top of RAM   initrd (page aligned, growing down, below 4 GiB)
//! ```
//!
//! The kernel image is placed flat at [`KERNEL_LOAD_ADDR`]; execution
//! backends decide how to enter it.

use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use linux_loader::cmdline::Cmdline;
use linux_loader::loader::load_cmdline;
use shuairan_desc::{LinuxConfig, OsConfig};
use std::path::Path;
use vm_memory::GuestAddress;

#[cfg(target_arch = "x86_64")]
use linux_loader::{
    bootparam::boot_params,
    configurator::linux::LinuxBootConfigurator,
    configurator::{BootConfigurator, BootParams},
};
#[cfg(target_arch = "x86_64")]
use vm_memory::Bytes;

/// Guest address of the boot parameters block.
pub const BOOT_PARAMS_ADDR: u64 = 0x0000_7000;

/// Guest address of the kernel command line.
pub const CMDLINE_ADDR: u64 = 0x0002_0000;

/// Longest accepted command line, excluding the terminating NUL.
pub const CMDLINE_MAX: usize = 2048;

/// Guest address the kernel image is loaded at.
pub const KERNEL_LOAD_ADDR: u64 = 0x0010_0000;

const PAGE_SIZE: u64 = 4096;

/// The zero page records the initrd in 32-bit fields.
const INITRD_ADDR_MAX: u64 = 1 << 32;

#[cfg(target_arch = "x86_64")]
mod zero_page {
    pub const BOOT_FLAG: u16 = 0xaa55;
    /// "HdrS"
    pub const HEADER_MAGIC: u32 = 0x5372_6448;
    pub const KERNEL_ALIGNMENT: u32 = 0x0100_0000;
    /// Undefined loader id.
    pub const TYPE_OF_LOADER: u8 = 0xff;
    pub const E820_RAM: u32 = 1;
    /// End of conventional memory below the EBDA.
    pub const LOW_RAM_END: u64 = 0x0009_fc00;
    pub const HIGH_RAM_START: u64 = 0x0010_0000;
}

/// Where the loader placed each boot artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// Kernel entry point.
    pub entry: u64,
    /// Size of the loaded kernel image.
    pub kernel_size: u64,
    /// Command line length, excluding the NUL.
    pub cmdline_len: usize,
    /// Initrd placement as (address, size).
    pub initrd: Option<(u64, u64)>,
}

impl BootInfo {
    /// Initial register state for a vCPU. Only vCPU 0 boots the kernel; the
    /// rest wait to be brought up by the guest.
    pub fn registers(&self, index: u32) -> BootRegisters {
        BootRegisters {
            entry: self.entry,
            boot_params: BOOT_PARAMS_ADDR,
            bootstrap: index == 0,
        }
    }
}

/// Initial register state handed to an execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRegisters {
    /// Instruction pointer.
    pub entry: u64,
    /// Pointer to the boot parameters block.
    pub boot_params: u64,
    /// Whether this is the bootstrap processor.
    pub bootstrap: bool,
}

/// Load the guest OS images described by `os` into `memory`.
pub fn load(memory: &GuestMemory, os: &OsConfig) -> Result<BootInfo> {
    match os {
        OsConfig::Linux(linux) => load_linux(memory, linux),
    }
}

fn read_image(kind: &str, path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::boot_failed(format!("read {} {}: {}", kind, path.display(), e)))?;
    if bytes.is_empty() {
        return Err(Error::boot_failed(format!("{} {} is empty", kind, path.display())));
    }
    Ok(bytes)
}

fn place(memory: &GuestMemory, kind: &str, addr: u64, bytes: &[u8]) -> Result<()> {
    memory.write_at(addr, bytes).map_err(|_| {
        Error::boot_failed(format!(
            "{} of {} bytes does not fit in {} bytes of guest memory at {:#x}",
            kind,
            bytes.len(),
            memory.size(),
            addr
        ))
    })
}

/// Load a Linux kernel, optional initrd and command line.
pub fn load_linux(memory: &GuestMemory, linux: &LinuxConfig) -> Result<BootInfo> {
    if let Some(rootfs) = &linux.rootfs_path {
        if !rootfs.exists() {
            return Err(Error::boot_failed(format!("rootfs not found: {}", rootfs.display())));
        }
    }

    if linux.cmd_args.len() > CMDLINE_MAX {
        return Err(Error::boot_failed(format!(
            "kernel command line is {} bytes (max {})",
            linux.cmd_args.len(),
            CMDLINE_MAX
        )));
    }
    let cmdline = build_cmdline(&linux.cmd_args)?;

    let kernel = read_image("kernel", &linux.kernel_path)?;
    place(memory, "kernel", KERNEL_LOAD_ADDR, &kernel)?;
    let kernel_end = KERNEL_LOAD_ADDR + kernel.len() as u64;

    load_cmdline(memory.mmap(), GuestAddress(CMDLINE_ADDR), &cmdline)
        .map_err(|e| Error::boot_failed(format!("write kernel command line: {}", e)))?;
    let cmdline_len = cmdline
        .as_cstring()
        .map_err(|e| Error::boot_failed(format!("kernel command line: {}", e)))?
        .as_bytes()
        .len();

    let initrd = match &linux.initrd_path {
        Some(path) => {
            let image = read_image("initrd", path)?;
            let size = image.len() as u64;
            let addr = memory
                .size()
                .min(INITRD_ADDR_MAX)
                .checked_sub(size)
                .map(|top| top & !(PAGE_SIZE - 1))
                .filter(|addr| *addr >= kernel_end)
                .ok_or_else(|| {
                    Error::boot_failed(format!(
                        "initrd of {} bytes does not fit above the kernel",
                        size
                    ))
                })?;
            place(memory, "initrd", addr, &image)?;
            Some((addr, size))
        }
        None => None,
    };

    let info = BootInfo {
        entry: KERNEL_LOAD_ADDR,
        kernel_size: kernel.len() as u64,
        cmdline_len,
        initrd,
    };
    write_boot_params(memory, &info)?;

    tracing::debug!(
        kernel = %linux.kernel_path.display(),
        kernel_size = info.kernel_size,
        initrd = ?info.initrd,
        cmdline_len = info.cmdline_len,
        "guest images loaded"
    );

    Ok(info)
}

fn build_cmdline(args: &str) -> Result<Cmdline> {
    let mut cmdline = Cmdline::new(CMDLINE_MAX + 1)
        .map_err(|e| Error::boot_failed(format!("kernel command line: {}", e)))?;
    let args = args.trim();
    if !args.is_empty() {
        cmdline
            .insert_str(args)
            .map_err(|e| Error::boot_failed(format!("kernel command line: {}", e)))?;
    }
    Ok(cmdline)
}

/// Write the zero page describing the loaded images and the RAM layout.
#[cfg(target_arch = "x86_64")]
fn write_boot_params(memory: &GuestMemory, info: &BootInfo) -> Result<()> {
    use zero_page::*;

    let mut params = boot_params::default();
    params.hdr.boot_flag = BOOT_FLAG;
    params.hdr.header = HEADER_MAGIC;
    params.hdr.kernel_alignment = KERNEL_ALIGNMENT;
    params.hdr.type_of_loader = TYPE_OF_LOADER;
    params.hdr.cmd_line_ptr = CMDLINE_ADDR as u32;
    params.hdr.cmdline_size = info.cmdline_len as u32 + 1;
    if let Some((addr, size)) = info.initrd {
        // Placement keeps both below 4 GiB
        params.hdr.ramdisk_image = addr as u32;
        params.hdr.ramdisk_size = size as u32;
    }

    let low_end = memory.size().min(LOW_RAM_END);
    params.e820_table[0].addr = 0;
    params.e820_table[0].size = low_end;
    params.e820_table[0].type_ = E820_RAM;
    params.e820_entries = 1;

    let high_size = memory.size().saturating_sub(HIGH_RAM_START);
    if high_size > 0 {
        params.e820_table[1].addr = HIGH_RAM_START;
        params.e820_table[1].size = high_size;
        params.e820_table[1].type_ = E820_RAM;
        params.e820_entries = 2;
    }

    let zero_page = BootParams::new::<boot_params>(&params, GuestAddress(BOOT_PARAMS_ADDR));
    LinuxBootConfigurator::write_bootparams(&zero_page, memory.mmap())
        .map_err(|e| Error::boot_failed(format!("write boot parameters: {}", e)))
}

/// Only x86_64 guests take a zero page.
#[cfg(not(target_arch = "x86_64"))]
fn write_boot_params(_memory: &GuestMemory, _info: &BootInfo) -> Result<()> {
    Ok(())
}

/// Check that `addr` holds a zero page written by [`load_linux`].
#[cfg(target_arch = "x86_64")]
pub fn check_boot_params(memory: &GuestMemory, addr: u64) -> Result<()> {
    let params: boot_params = memory
        .mmap()
        .read_obj(GuestAddress(addr))
        .map_err(|e| Error::boot_failed(format!("read boot parameters at {:#x}: {}", addr, e)))?;

    // boot_params is packed; copy fields out before comparing
    let boot_flag = params.hdr.boot_flag;
    let header = params.hdr.header;
    if boot_flag != zero_page::BOOT_FLAG || header != zero_page::HEADER_MAGIC {
        return Err(Error::boot_failed(format!("no boot parameters at {:#x}", addr)));
    }
    Ok(())
}

/// Only x86_64 guests take a zero page.
#[cfg(not(target_arch = "x86_64"))]
pub fn check_boot_params(_memory: &GuestMemory, _addr: u64) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn linux(kernel: PathBuf, initrd: Option<PathBuf>, rootfs: Option<PathBuf>) -> LinuxConfig {
        LinuxConfig {
            kernel_path: kernel,
            initrd_path: initrd,
            rootfs_path: rootfs,
            cmd_args: "console=ttyS0".to_string(),
        }
    }

    #[test]
    fn test_load_kernel_cmdline_and_initrd() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = write_file(dir.path(), "vmlinux", &[0x7f, b'E', b'L', b'F']);
        let initrd = write_file(dir.path(), "initrd", &[0xaa; 5000]);

        let memory = GuestMemory::new(4).unwrap();
        let info = load_linux(&memory, &linux(kernel, Some(initrd), None)).unwrap();

        assert_eq!(info.entry, KERNEL_LOAD_ADDR);
        assert_eq!(info.kernel_size, 4);

        let mut head = [0u8; 4];
        memory.read_at(KERNEL_LOAD_ADDR, &mut head).unwrap();
        assert_eq!(head, [0x7f, b'E', b'L', b'F']);

        let mut cmdline = [0u8; 14];
        memory.read_at(CMDLINE_ADDR, &mut cmdline).unwrap();
        assert_eq!(&cmdline, b"console=ttyS0\0");

        let (addr, size) = info.initrd.unwrap();
        assert_eq!(size, 5000);
        assert_eq!(addr % PAGE_SIZE, 0);
        assert!(addr + size <= memory.size());

        assert_eq!(info.cmdline_len, 13);
        check_boot_params(&memory, BOOT_PARAMS_ADDR).unwrap();
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_zero_page_describes_images() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = write_file(dir.path(), "vmlinux", &[0x90; 16]);
        let initrd = write_file(dir.path(), "initrd", &[0xaa; 100]);

        let memory = GuestMemory::new(4).unwrap();
        assert!(check_boot_params(&memory, BOOT_PARAMS_ADDR).is_err());
        let info = load_linux(&memory, &linux(kernel, Some(initrd), None)).unwrap();

        let params: boot_params = memory.mmap().read_obj(GuestAddress(BOOT_PARAMS_ADDR)).unwrap();
        let (cmd_line_ptr, ramdisk_image, ramdisk_size) = (
            params.hdr.cmd_line_ptr,
            params.hdr.ramdisk_image,
            params.hdr.ramdisk_size,
        );
        let (initrd_addr, initrd_size) = info.initrd.unwrap();
        assert_eq!(u64::from(cmd_line_ptr), CMDLINE_ADDR);
        assert_eq!(u64::from(ramdisk_image), initrd_addr);
        assert_eq!(u64::from(ramdisk_size), initrd_size);

        let entries = params.e820_entries;
        let table = params.e820_table;
        let high = table[1];
        let (high_addr, high_size) = (high.addr, high.size);
        assert_eq!(entries, 2);
        assert_eq!(high_addr, zero_page::HIGH_RAM_START);
        assert_eq!(high_addr + high_size, memory.size());
    }

    #[test]
    fn test_only_vcpu0_is_bootstrap() {
        let info = BootInfo {
            entry: KERNEL_LOAD_ADDR,
            kernel_size: 1,
            cmdline_len: 0,
            initrd: None,
        };
        assert!(info.registers(0).bootstrap);
        assert!(!info.registers(1).bootstrap);
        assert_eq!(info.registers(1).boot_params, BOOT_PARAMS_ADDR);
    }

    #[test]
    fn test_load_failures() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = write_file(dir.path(), "vmlinux", &[1, 2, 3]);
        let empty = write_file(dir.path(), "empty", &[]);
        let rootfs = write_file(dir.path(), "rootfs.img", &[0]);
        let huge = write_file(dir.path(), "huge", &vec![0u8; 2 * 1024 * 1024]);
        let memory = GuestMemory::new(2).unwrap();
        let mut long_cmdline = linux(kernel.clone(), None, None);
        long_cmdline.cmd_args = "a".repeat(CMDLINE_MAX + 1);
        let mut bad_cmdline = linux(kernel.clone(), None, None);
        bad_cmdline.cmd_args = "console=ttyS0\tquiet".to_string();

        // (config, expected message fragment)
        let cases = [
            (linux(dir.path().join("missing"), None, Some(rootfs.clone())), "read kernel"),
            (linux(empty, None, Some(rootfs.clone())), "is empty"),
            (linux(kernel.clone(), None, Some(dir.path().join("nope"))), "rootfs not found"),
            (linux(huge.clone(), None, Some(rootfs.clone())), "does not fit"),
            (linux(kernel, Some(huge), None), "initrd"),
            (long_cmdline, "command line"),
            (bad_cmdline, "command line"),
        ];

        for (config, fragment) in cases {
            let err = load_linux(&memory, &config).unwrap_err();
            assert!(matches!(err, Error::BootFailed(_)), "{}", err);
            assert!(err.to_string().contains(fragment), "{} should mention {}", err, fragment);
        }
    }
}
