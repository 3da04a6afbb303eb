//! Control-thread side of the vCPUs.

use super::thread::Vcpu;
use super::{ExitReason, VcpuCommand, VcpuEvent, VcpuReport, VcpuState};
use crate::backend::ExecutionBackend;
use crate::boot::BootInfo;
use crate::device::DeviceSet;
use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Aggregated outcome observed by the receive loop.
#[derive(Debug)]
pub enum ManagerEvent {
    /// Every vCPU exited cleanly.
    AllExited,
    /// A vCPU crashed; the others have been told to stop.
    Crashed {
        /// Crashed vCPU.
        index: u32,
        /// Its error.
        error: Error,
    },
}

struct VcpuHandle {
    commands: Sender<VcpuCommand>,
    state: VcpuState,
}

/// Owns the vCPU threads of one VM.
///
/// Invariant: `threads` holds exactly the vCPUs whose mirrored state is not
/// terminal. A thread is joined as soon as its final report is absorbed.
pub struct VcpuManager {
    count: u32,
    grace_period: Duration,
    handles: BTreeMap<u32, VcpuHandle>,
    threads: BTreeMap<u32, JoinHandle<()>>,
    report_tx: Sender<VcpuReport>,
    report_rx: Receiver<VcpuReport>,
    pending: VecDeque<ManagerEvent>,
    crashed: bool,
}

impl VcpuManager {
    /// Create a manager for `count` vCPUs. `grace_period` bounds every wait
    /// for an acknowledgement.
    pub fn new(count: u32, grace_period: Duration) -> Self {
        let (report_tx, report_rx) = unbounded();
        Self {
            count,
            grace_period,
            handles: BTreeMap::new(),
            threads: BTreeMap::new(),
            report_tx,
            report_rx,
            pending: VecDeque::new(),
            crashed: false,
        }
    }

    /// Target vCPU count.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Grace period for acknowledgements.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Number of vCPU threads still running.
    pub fn live_count(&self) -> usize {
        self.threads.len()
    }

    /// Indices of vCPU threads still running, ascending.
    pub fn live_indices(&self) -> Vec<u32> {
        self.threads.keys().copied().collect()
    }

    /// Last state reported by vCPU `index`.
    pub fn vcpu_state(&self, index: u32) -> Option<VcpuState> {
        self.handles.get(&index).map(|handle| handle.state)
    }

    /// Create and start one thread per vCPU, then release them all into
    /// guest execution. Either every thread is started or none is left
    /// behind.
    pub fn spawn_all(
        &mut self,
        backend: &dyn ExecutionBackend,
        devices: &Arc<DeviceSet>,
        memory: &Arc<GuestMemory>,
        boot: &BootInfo,
    ) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(Error::invalid_state("no vcpus spawned", format!("{} vcpus", self.handles.len())));
        }

        for index in 0..self.count {
            if let Err(e) = self.spawn_one(index, backend, devices, memory, boot) {
                tracing::warn!(vcpu = index, error = %e, "vcpu spawn failed, stopping started vcpus");
                self.abort_spawn();
                return Err(e);
            }
        }
        tracing::debug!(vcpus = self.count, backend = backend.name(), "vcpu threads spawned");

        let all: BTreeSet<u32> = self.threads.keys().copied().collect();
        for index in &all {
            self.send(*index, VcpuCommand::Run);
        }
        if let Err(e) = self.await_acks(all, |event| matches!(event, VcpuEvent::Started), "run") {
            tracing::warn!(error = %e, "vcpu run rendezvous failed, stopping vcpus");
            if let Err(stop) = self.stop_all() {
                tracing::warn!(error = %stop, "vcpu stop after failed run failed");
            }
            return Err(e);
        }
        tracing::info!(vcpus = self.count, "vcpus running");
        Ok(())
    }

    fn spawn_one(
        &mut self,
        index: u32,
        backend: &dyn ExecutionBackend,
        devices: &Arc<DeviceSet>,
        memory: &Arc<GuestMemory>,
        boot: &BootInfo,
    ) -> Result<()> {
        let mut executor = backend.create_executor(index, devices, memory)?;
        executor.set_boot_registers(boot.registers(index))?;

        let (cmd_tx, cmd_rx) = unbounded();
        let vcpu = Vcpu::new(index, executor, Arc::clone(devices), cmd_rx, self.report_tx.clone());
        let thread = std::thread::Builder::new()
            .name(format!("vcpu-{}", index))
            .spawn(move || vcpu.run())
            .map_err(|e| Error::ThreadSpawn {
                index,
                reason: e.to_string(),
            })?;

        self.handles.insert(
            index,
            VcpuHandle {
                commands: cmd_tx,
                state: VcpuState::Runnable,
            },
        );
        self.threads.insert(index, thread);
        Ok(())
    }

    /// Stop and join every thread started so far. They are all parked in
    /// `Runnable`, so `Stop` is seen immediately.
    fn abort_spawn(&mut self) {
        for handle in self.handles.values() {
            let _ = handle.commands.send(VcpuCommand::Stop);
        }
        for (index, thread) in std::mem::take(&mut self.threads) {
            if thread.join().is_err() {
                tracing::warn!(vcpu = index, "vcpu thread panicked during abort");
            }
        }
        self.handles.clear();
        while self.report_rx.try_recv().is_ok() {}
    }

    fn send(&self, index: u32, command: VcpuCommand) {
        if let Some(handle) = self.handles.get(&index) {
            // A closed channel means the thread already exited; its final
            // report is in the queue.
            if handle.commands.send(command).is_err() {
                tracing::trace!(vcpu = index, command = command.name(), "command to exited vcpu");
            }
        }
    }

    /// Apply a report to the mirrored state, joining the thread on a final
    /// report.
    fn absorb(&mut self, report: VcpuReport) -> Option<ManagerEvent> {
        let VcpuReport { index, event } = report;
        let state = event.state();
        if let Some(handle) = self.handles.get_mut(&index) {
            handle.state = state;
        }
        tracing::trace!(vcpu = index, %state, "vcpu report");

        if !state.is_terminal() {
            return None;
        }
        if let Some(thread) = self.threads.remove(&index) {
            if thread.join().is_err() {
                tracing::warn!(vcpu = index, "vcpu thread panicked");
            }
            tracing::debug!(vcpu = index, %state, "vcpu thread joined");
        }

        match event {
            VcpuEvent::Crashed(error) => {
                self.crashed = true;
                Some(ManagerEvent::Crashed { index, error })
            }
            _ if self.threads.is_empty() && !self.crashed => Some(ManagerEvent::AllExited),
            _ => None,
        }
    }

    /// Wait until every vCPU in `targets` reported an event accepted by
    /// `acked`, or exited. Fails on a crash of an awaited vCPU or when the
    /// grace period runs out.
    fn await_acks(
        &mut self,
        mut targets: BTreeSet<u32>,
        acked: fn(&VcpuEvent) -> bool,
        command: &'static str,
    ) -> Result<()> {
        let deadline = Instant::now() + self.grace_period;
        while let Some(&first) = targets.iter().next() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let report = match self.report_rx.recv_timeout(remaining) {
                Ok(report) => report,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::error!(vcpu = first, command, "vcpu did not acknowledge");
                    return Err(Error::ControlTimeout {
                        index: first,
                        command,
                        waited: self.grace_period,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::ChannelClosed("vcpu reports".to_string()))
                }
            };

            let index = report.index;
            let awaited = targets.contains(&index);
            if acked(&report.event) || matches!(report.event, VcpuEvent::Exited(_)) {
                targets.remove(&index);
            }
            match self.absorb(report) {
                Some(ManagerEvent::Crashed { error, .. }) if awaited => {
                    self.signal_stop();
                    return Err(error);
                }
                Some(event) => self.pending.push_back(event),
                None => {}
            }
        }
        Ok(())
    }

    fn signal_stop(&self) {
        for index in self.threads.keys() {
            self.send(*index, VcpuCommand::Stop);
        }
    }

    fn targets(&self, states: &[VcpuState]) -> BTreeSet<u32> {
        self.threads
            .keys()
            .copied()
            .filter(|index| {
                self.handles
                    .get(index)
                    .map_or(false, |handle| states.contains(&handle.state))
            })
            .collect()
    }

    /// Suspend every running or halted vCPU and wait for all of them to
    /// acknowledge.
    pub fn pause_all(&mut self) -> Result<()> {
        let targets = self.targets(&[VcpuState::Running, VcpuState::Halted]);
        for index in &targets {
            self.send(*index, VcpuCommand::Pause);
        }
        self.await_acks(targets, |event| matches!(event, VcpuEvent::Paused), "pause")?;
        tracing::debug!(vcpus = self.live_count(), "vcpus paused");
        Ok(())
    }

    /// Resume every paused vCPU and wait for all of them to acknowledge.
    pub fn resume_all(&mut self) -> Result<()> {
        let targets = self.targets(&[VcpuState::Paused]);
        for index in &targets {
            self.send(*index, VcpuCommand::Resume);
        }
        self.await_acks(targets, |event| matches!(event, VcpuEvent::Resumed), "resume")?;
        tracing::debug!(vcpus = self.live_count(), "vcpus resumed");
        Ok(())
    }

    /// Stop every live vCPU and join its thread.
    ///
    /// Threads that do not exit within the grace period are detached, never
    /// killed, and marked crashed. Returns the first crash seen (including
    /// one already queued) or the timeout.
    pub fn stop_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for event in self.pending.drain(..) {
            if let ManagerEvent::Crashed { error, .. } = event {
                first_error.get_or_insert(error);
            }
        }

        self.signal_stop();
        let deadline = Instant::now() + self.grace_period;
        while !self.threads.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.report_rx.recv_timeout(remaining) {
                Ok(report) => {
                    if let Some(ManagerEvent::Crashed { error, .. }) = self.absorb(report) {
                        first_error.get_or_insert(error);
                    }
                }
                Err(_) => break,
            }
        }

        let unresponsive = std::mem::take(&mut self.threads);
        for (index, thread) in unresponsive {
            tracing::error!(vcpu = index, "vcpu did not stop within grace period, detaching");
            drop(thread);
            if let Some(handle) = self.handles.get_mut(&index) {
                handle.state = VcpuState::Crashed;
            }
            self.crashed = true;
            first_error.get_or_insert(Error::ControlTimeout {
                index,
                command: "stop",
                waited: self.grace_period,
            });
        }

        match first_error {
            Some(error) => Err(error),
            None => {
                tracing::debug!("vcpus stopped");
                Ok(())
            }
        }
    }

    /// Next aggregated event. Waits at most `timeout` when given; `Ok(None)`
    /// means it elapsed. A crash makes every other vCPU stop before the
    /// event is returned.
    pub fn next_event(&mut self, timeout: Option<Duration>) -> Result<Option<ManagerEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.threads.is_empty() {
                return Ok(Some(ManagerEvent::AllExited));
            }
            let received = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.report_rx.recv_timeout(remaining) {
                        Ok(report) => report,
                        Err(RecvTimeoutError::Timeout) => return Ok(None),
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(Error::ChannelClosed("vcpu reports".to_string()))
                        }
                    }
                }
                None => self
                    .report_rx
                    .recv()
                    .map_err(|_| Error::ChannelClosed("vcpu reports".to_string()))?,
            };
            match self.absorb(received) {
                Some(event @ ManagerEvent::Crashed { .. }) => {
                    self.signal_stop();
                    return Ok(Some(event));
                }
                Some(event) => return Ok(Some(event)),
                None => {}
            }
        }
    }

    /// Raise an interrupt on vCPU `index`.
    pub fn inject_interrupt(&mut self, index: u32) -> Result<()> {
        if !self.threads.contains_key(&index) {
            let state = self
                .vcpu_state(index)
                .map_or_else(|| "absent".to_string(), |state| state.to_string());
            return Err(Error::invalid_state("live vcpu", format!("vcpu {} {}", index, state)));
        }
        self.send(index, VcpuCommand::Interrupt);
        Ok(())
    }

    /// Whether every spawned vCPU exited because the guest shut it down.
    pub fn all_guest_shutdown(&self) -> bool {
        !self.handles.is_empty()
            && self
                .handles
                .values()
                .all(|handle| handle.state == VcpuState::Exited(ExitReason::GuestShutdown))
    }
}

impl Drop for VcpuManager {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            if let Err(e) = self.stop_all() {
                tracing::warn!(error = %e, "vcpu shutdown on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GuestProgram, ScriptedBackend};
    use crate::boot::{BootInfo, KERNEL_LOAD_ADDR};

    struct Fixture {
        devices: Arc<DeviceSet>,
        memory: Arc<GuestMemory>,
        boot: BootInfo,
    }

    fn fixture() -> Fixture {
        Fixture {
            devices: Arc::new(DeviceSet::build(&[]).unwrap()),
            memory: Arc::new(GuestMemory::new(1).unwrap()),
            boot: BootInfo {
                entry: KERNEL_LOAD_ADDR,
                kernel_size: 1,
                cmdline_len: 0,
                initrd: None,
            },
        }
    }

    fn spawn(count: u32, backend: &ScriptedBackend, grace: Duration) -> (VcpuManager, Result<()>) {
        let f = fixture();
        let mut manager = VcpuManager::new(count, grace);
        let result = manager.spawn_all(backend, &f.devices, &f.memory, &f.boot);
        (manager, result)
    }

    fn idle() -> GuestProgram {
        GuestProgram::new().spin(Duration::from_millis(1)).looping()
    }

    #[test]
    fn test_spawn_n_threads() {
        let (mut manager, result) = spawn(4, &ScriptedBackend::uniform(idle()), Duration::from_secs(5));
        result.unwrap();
        assert_eq!(manager.live_indices(), vec![0, 1, 2, 3]);
        for index in 0..4 {
            assert_eq!(manager.vcpu_state(index), Some(VcpuState::Running));
        }

        manager.stop_all().unwrap();
        assert_eq!(manager.live_count(), 0);
        assert_eq!(
            manager.vcpu_state(2),
            Some(VcpuState::Exited(ExitReason::Stopped))
        );
    }

    #[test]
    fn test_spawn_failure_leaves_no_threads() {
        let backend = ScriptedBackend::uniform(idle()).fail_create(2);
        let (manager, result) = spawn(4, &backend, Duration::from_secs(5));
        assert!(matches!(result, Err(Error::VcpuCreation { index: 2, .. })));
        assert_eq!(manager.live_count(), 0);
        assert_eq!(manager.vcpu_state(0), None);
    }

    #[test]
    fn test_pause_resume_keeps_threads() {
        let programs = vec![idle(), GuestProgram::new().halt()];
        let (mut manager, result) = spawn(2, &ScriptedBackend::per_vcpu(programs), Duration::from_secs(5));
        result.unwrap();

        manager.pause_all().unwrap();
        assert_eq!(manager.vcpu_state(0), Some(VcpuState::Paused));
        assert_eq!(manager.vcpu_state(1), Some(VcpuState::Paused));

        manager.resume_all().unwrap();
        assert_eq!(manager.live_indices(), vec![0, 1]);
        assert_eq!(manager.vcpu_state(0), Some(VcpuState::Running));
        manager.stop_all().unwrap();
    }

    #[test]
    fn test_failed_run_rendezvous_leaves_no_threads() {
        // A zero grace period makes the Started wait expire almost always
        let (manager, result) = spawn(8, &ScriptedBackend::uniform(idle()), Duration::ZERO);
        if result.is_err() {
            assert_eq!(manager.live_count(), 0);
            for index in 0..8 {
                let state = manager.vcpu_state(index).unwrap();
                assert!(state.is_terminal(), "vcpu {} left {}", index, state);
            }
        }
    }

    #[test]
    fn test_resume_keeps_halted_vcpu_halted() {
        let (mut manager, result) = spawn(
            1,
            &ScriptedBackend::uniform(GuestProgram::new().halt().shutdown()),
            Duration::from_secs(5),
        );
        result.unwrap();
        assert!(manager.next_event(Some(Duration::from_millis(100))).unwrap().is_none());
        assert_eq!(manager.vcpu_state(0), Some(VcpuState::Halted));

        manager.pause_all().unwrap();
        manager.resume_all().unwrap();
        assert!(manager.next_event(Some(Duration::from_millis(200))).unwrap().is_none());
        assert_eq!(manager.vcpu_state(0), Some(VcpuState::Halted));

        // An interrupt raised while paused is delivered on resume
        manager.pause_all().unwrap();
        manager.inject_interrupt(0).unwrap();
        manager.resume_all().unwrap();
        let event = manager.next_event(Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(event, Some(ManagerEvent::AllExited)));
        assert!(manager.all_guest_shutdown());
    }

    #[test]
    fn test_crash_stops_the_others() {
        let programs = vec![
            GuestProgram::new().spin(Duration::from_millis(20)).fault("bad opcode"),
            idle(),
        ];
        let (mut manager, result) = spawn(2, &ScriptedBackend::per_vcpu(programs), Duration::from_secs(5));
        result.unwrap();

        match manager.next_event(None).unwrap() {
            Some(ManagerEvent::Crashed { index, error }) => {
                assert_eq!(index, 0);
                assert!(error.to_string().contains("bad opcode"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        manager.stop_all().unwrap();
        assert_eq!(manager.live_count(), 0);
        assert_eq!(manager.vcpu_state(0), Some(VcpuState::Crashed));
        assert_eq!(
            manager.vcpu_state(1),
            Some(VcpuState::Exited(ExitReason::Stopped))
        );
    }

    #[test]
    fn test_all_exited_after_guest_shutdown() {
        let (mut manager, result) = spawn(
            3,
            &ScriptedBackend::uniform(GuestProgram::new().shutdown()),
            Duration::from_secs(5),
        );
        result.unwrap();
        let event = manager.next_event(Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(event, Some(ManagerEvent::AllExited)));
        assert!(manager.all_guest_shutdown());
    }

    #[test]
    fn test_unresponsive_vcpu_times_out() {
        let programs = vec![idle(), GuestProgram::new().spin(Duration::from_secs(2))];
        let (mut manager, result) =
            spawn(2, &ScriptedBackend::per_vcpu(programs), Duration::from_millis(100));
        result.unwrap();

        let err = manager.pause_all().unwrap_err();
        assert!(
            matches!(err, Error::ControlTimeout { index: 1, command: "pause", .. }),
            "{}",
            err
        );

        let err = manager.stop_all().unwrap_err();
        assert!(matches!(err, Error::ControlTimeout { index: 1, .. }), "{}", err);
        assert_eq!(manager.live_count(), 0);
        assert_eq!(manager.vcpu_state(1), Some(VcpuState::Crashed));
    }

    #[test]
    fn test_next_event_timeout_and_interrupt() {
        let (mut manager, result) = spawn(
            1,
            &ScriptedBackend::uniform(GuestProgram::new().halt().shutdown()),
            Duration::from_secs(5),
        );
        result.unwrap();

        assert!(manager.next_event(Some(Duration::from_millis(200))).unwrap().is_none());
        assert_eq!(manager.vcpu_state(0), Some(VcpuState::Halted));

        manager.inject_interrupt(0).unwrap();
        let event = manager.next_event(Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(event, Some(ManagerEvent::AllExited)));
        assert!(manager.inject_interrupt(0).is_err());
    }
}
