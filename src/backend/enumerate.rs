//! Default backend: enumerate devices, then power off.
//!
//! Each vCPU checks the boot parameters block and reads every device
//! window. vCPU 0 additionally brings every virtio device to DRIVER_OK,
//! kicks each queue once and reports on the consoles. Then every vCPU shuts
//! down, so a healthy VM terminates cleanly.

use super::scripted::ScriptedExecutor;
use super::{ExecutionBackend, GuestProgram, VcpuExecutor, VcpuExit};
use crate::boot::{self, BootRegisters};
use crate::device::{
    DeviceKind, DeviceSet, IoEventToken, REG_MAGIC, REG_STATUS, VIRTIO_CONFIG_OFFSET,
    VIRTIO_MMIO_MAGIC,
};
use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use std::sync::Arc;

/// ACKNOWLEDGE | DRIVER | DRIVER_OK | FEATURES_OK
const STATUS_READY: u64 = 0xf;

/// Console config register that takes output bytes.
const CONSOLE_EMERG_WR: u64 = VIRTIO_CONFIG_OFFSET + 0x8;

/// Device-enumerating backend used by the CLI.
#[derive(Debug, Default)]
pub struct EnumerateBackend;

impl EnumerateBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }

    fn program(index: u32, devices: &DeviceSet) -> GuestProgram {
        let info = devices.info();
        let mut program = GuestProgram::new();

        for dev in &info {
            let expect = dev.kind.is_virtio().then_some(u64::from(VIRTIO_MMIO_MAGIC));
            program = match expect {
                Some(magic) => program.read_expect(dev.mmio.base + REG_MAGIC, 4, magic),
                None => program.read(dev.mmio.base + REG_MAGIC, 4),
            };
        }

        if index == 0 {
            for dev in info.iter().filter(|dev| dev.kind.is_virtio()) {
                program = program.write(dev.mmio.base + REG_STATUS, STATUS_READY, 4);
                for queue in 0..dev.queues {
                    program = program.notify(IoEventToken::new(dev.index, queue));
                }
            }
            let banner = format!("shuairan: found {} device(s)\n", info.len());
            for dev in info.iter().filter(|dev| dev.kind == DeviceKind::Console) {
                for byte in banner.bytes() {
                    program = program.write(dev.mmio.base + CONSOLE_EMERG_WR, u64::from(byte), 1);
                }
            }
        }

        program.shutdown()
    }
}

impl ExecutionBackend for EnumerateBackend {
    fn name(&self) -> &'static str {
        "enumerate"
    }

    fn create_executor(
        &self,
        index: u32,
        devices: &DeviceSet,
        memory: &Arc<GuestMemory>,
    ) -> Result<Box<dyn VcpuExecutor>> {
        Ok(Box::new(EnumerateExecutor {
            index,
            memory: Arc::clone(memory),
            inner: ScriptedExecutor::new(index, Self::program(index, devices)),
        }))
    }
}

struct EnumerateExecutor {
    index: u32,
    memory: Arc<GuestMemory>,
    inner: ScriptedExecutor,
}

impl VcpuExecutor for EnumerateExecutor {
    fn set_boot_registers(&mut self, regs: BootRegisters) -> Result<()> {
        boot::check_boot_params(&self.memory, regs.boot_params)
            .map_err(|e| Error::vcpu_creation(self.index, e.to_string()))?;
        self.inner.set_boot_registers(regs)
    }

    fn run(&mut self) -> Result<VcpuExit> {
        self.inner.run()
    }

    fn complete_mmio_read(&mut self, data: &[u8]) -> Result<()> {
        self.inner.complete_mmio_read(data)
    }

    fn inject_interrupt(&mut self) {
        self.inner.inject_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::BOOT_PARAMS_ADDR;
    use shuairan_desc::{ConsoleConfig, DeviceConfig, LinuxConfig};

    /// Guest memory with a kernel and zero page loaded.
    fn booted_memory() -> (tempfile::TempDir, Arc<GuestMemory>) {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("vmlinux");
        std::fs::write(&kernel, [0x90; 16]).unwrap();
        let memory = Arc::new(GuestMemory::new(2).unwrap());
        let linux = LinuxConfig {
            kernel_path: kernel,
            initrd_path: None,
            rootfs_path: None,
            cmd_args: "console=hvc0".to_string(),
        };
        boot::load_linux(&memory, &linux).unwrap();
        (dir, memory)
    }

    fn run_to_shutdown(exec: &mut dyn VcpuExecutor, devices: &DeviceSet) -> usize {
        let mut exits = 0;
        loop {
            exits += 1;
            match exec.run().unwrap() {
                VcpuExit::MmioRead { address, size } => {
                    let mut data = vec![0u8; size];
                    devices
                        .dispatch_mmio(address, crate::device::MmioOp::Read(&mut data))
                        .unwrap();
                    exec.complete_mmio_read(&data).unwrap();
                }
                VcpuExit::MmioWrite { address, data } => {
                    devices
                        .dispatch_mmio(address, crate::device::MmioOp::Write(&data))
                        .unwrap();
                }
                VcpuExit::IoEvent(token) => devices.dispatch_ioevent(token).unwrap(),
                VcpuExit::Shutdown => return exits,
                other => panic!("unexpected exit: {:?}", other),
            }
        }
    }

    #[test]
    fn test_enumeration_runs_against_devices() {
        let devices = DeviceSet::build(&[DeviceConfig::Console(ConsoleConfig {
            kind: "virtio".into(),
        })])
        .unwrap();
        let (_dir, memory) = booted_memory();
        let regs = BootRegisters {
            entry: 0x10_0000,
            boot_params: BOOT_PARAMS_ADDR,
            bootstrap: true,
        };

        let backend = EnumerateBackend::new();
        let mut exec = backend.create_executor(0, &devices, &memory).unwrap();
        exec.set_boot_registers(regs).unwrap();
        run_to_shutdown(exec.as_mut(), &devices);

        let console = devices.info()[0];
        let mut status = [0u8; 4];
        devices
            .dispatch_mmio(console.mmio.base + REG_STATUS, crate::device::MmioOp::Read(&mut status))
            .unwrap();
        assert_eq!(u32::from_le_bytes(status), STATUS_READY as u32);

        // Secondary vCPUs only read the magic values
        let mut exec = backend.create_executor(1, &devices, &memory).unwrap();
        exec.set_boot_registers(regs).unwrap();
        assert_eq!(run_to_shutdown(exec.as_mut(), &devices), 2);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_missing_boot_params_rejected() {
        let devices = DeviceSet::build(&[]).unwrap();
        let memory = Arc::new(GuestMemory::new(1).unwrap());
        let mut exec = EnumerateBackend::new().create_executor(0, &devices, &memory).unwrap();
        let err = exec
            .set_boot_registers(BootRegisters {
                entry: 0,
                boot_params: BOOT_PARAMS_ADDR,
                bootstrap: true,
            })
            .unwrap_err();
        assert!(matches!(err, Error::VcpuCreation { index: 0, .. }), "{}", err);
    }
}
