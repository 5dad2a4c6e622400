//! Per-CPU state table
//!
//! One [`CpuData`] record per processor: identity, online state, the TSC
//! calibration pair the clock needs, the currently running thread, the
//! need-resched flag set from timer context, and the per-CPU scheduler and
//! timer-wheel records. The table is instantiable so tests can model any
//! CPU count; the kernel keeps one global table sized [`MAX_CPUS`].

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::arch;
use crate::error::SchedError;
use crate::sched::queue::SchedCpu;
use crate::time::timer::TimerWheel;

/// Upper bound on supported processors.
pub const MAX_CPUS: usize = 8;

/// Identifier of a CPU; the boot CPU is 0.
pub type CpuId = u8;

/// Per-CPU state record.
pub struct CpuData {
    /// CPU id, equal to its table index
    pub id: CpuId,
    /// Whether the CPU has been brought online
    online: AtomicBool,
    /// TSC ticks per microsecond, calibrated at bring-up
    pub cycles_per_us: AtomicU64,
    /// Cycle-counter reading taken at bring-up; the clock's zero point
    pub system_time_offset: AtomicU64,
    /// Raw id of the thread currently on this CPU (0 = none)
    current_thread: AtomicU64,
    /// Set from timer context to request a reschedule at interrupt return
    pub need_resched: AtomicBool,
    /// Per-CPU scheduler record
    pub sched: Mutex<SchedCpu>,
    /// Per-CPU one-shot timers
    pub timers: Mutex<TimerWheel>,
}

impl CpuData {
    fn new(id: CpuId) -> Self {
        Self {
            id,
            online: AtomicBool::new(false),
            cycles_per_us: AtomicU64::new(0),
            system_time_offset: AtomicU64::new(0),
            current_thread: AtomicU64::new(0),
            need_resched: AtomicBool::new(false),
            sched: Mutex::new(SchedCpu::new()),
            timers: Mutex::new(TimerWheel::new()),
        }
    }

    /// Whether the CPU is online and runnable.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Raw id of the thread currently on this CPU (0 when none).
    pub fn current_raw(&self) -> u64 {
        self.current_thread.load(Ordering::Acquire)
    }

    /// Record the thread now running on this CPU.
    pub fn set_current_raw(&self, raw: u64) {
        self.current_thread.store(raw, Ordering::Release);
    }
}

/// Table of per-CPU records.
pub struct CpuTable {
    cpus: Vec<CpuData>,
}

impl CpuTable {
    /// Build a table of `ncpus` offline CPUs.
    pub fn new(ncpus: usize) -> Self {
        assert!(ncpus >= 1 && ncpus <= MAX_CPUS);
        Self {
            cpus: (0..ncpus as CpuId).map(CpuData::new).collect(),
        }
    }

    /// Number of slots in the table (online or not).
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Whether the table is empty (it never is; kept for completeness).
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Look up a CPU record.
    pub fn get(&self, id: CpuId) -> Result<&CpuData, SchedError> {
        self.cpus.get(id as usize).ok_or(SchedError::NoSuchCpu)
    }

    /// The record for the CPU executing this code.
    pub fn current(&self) -> &CpuData {
        &self.cpus[current_cpu_id() as usize]
    }

    /// Iterate over online CPUs in id order.
    pub fn running(&self) -> impl Iterator<Item = &CpuData> {
        self.cpus.iter().filter(|c| c.is_online())
    }

    /// Number of online CPUs.
    pub fn running_count(&self) -> usize {
        self.running().count()
    }

    /// Bring a CPU online: capture its cycle-counter zero point, record the
    /// calibration, and log the probed identity.
    pub fn bring_up(&self, id: CpuId, cycles_per_us: u64) -> Result<(), SchedError> {
        let cpu = self.get(id)?;
        assert!(cycles_per_us > 0);
        cpu.cycles_per_us.store(cycles_per_us, Ordering::Release);
        cpu.system_time_offset
            .store(arch::rdtsc(), Ordering::Release);
        cpu.online.store(true, Ordering::Release);

        let features = arch::cpu_features();
        log::info!(
            "cpu {} online: {} (stepping {}, {}/{} addr bits)",
            id,
            features.vendor,
            features.stepping,
            features.phys_addr_bits,
            features.virt_addr_bits
        );
        Ok(())
    }
}

/// Id of the CPU executing this code.
///
/// The boot CPU is 0; reading the real local-APIC id is the interrupt
/// controller collaborator's job and lands here once SMP bring-up exists.
pub fn current_cpu_id() -> CpuId {
    0
}
