//! Priority-preemptive multiprocessor scheduler
//!
//! Threads are keyed by id in a table; each CPU owns an active/expired pair
//! of 32-priority run-queue banks with an occupancy bitmap. Admission picks
//! a CPU by load balancing, reschedule picks the head of the lowest
//! non-empty priority of the active bank (swapping banks when it runs dry),
//! quantum expiry demotes onto the expired bank so equal-priority threads
//! round-robin, and dead threads ride an inbox to the reaper for final
//! release. See [`scheduler::Scheduler`] for the state machine.

pub mod queue;
pub mod scheduler;
pub mod thread;

pub use queue::{RunQueue, SchedCpu};
pub use scheduler::Scheduler;
pub use thread::{Thread, ThreadId, ThreadState};

/// Number of priority levels; 0 is highest, `NR_PRIORITIES - 1` lowest.
pub const NR_PRIORITIES: usize = 32;

/// Priority idle threads run at.
pub const IDLE_PRIORITY: u8 = (NR_PRIORITIES - 1) as u8;

/// Timer ticks a thread may run before mandatory reschedule.
pub const THREAD_QUANTUM: u32 = 32;

/// Kernel stack size for every thread.
pub const KSTACK_SIZE: usize = 16 * 1024;

lazy_static::lazy_static! {
    /// The kernel-wide scheduler instance.
    ///
    /// Hosted tests build private [`Scheduler`] values instead; this
    /// singleton is what interrupt-return paths and kernel threads use.
    pub static ref SCHEDULER: Scheduler = Scheduler::new(crate::smp::MAX_CPUS);
}

/// Reaper thread body: drain dead threads forever, yielding in between.
pub fn reaper_entry(_arg: usize) {
    loop {
        SCHEDULER.reap();
        SCHEDULER.yield_cpu(crate::smp::current_cpu_id());
    }
}

/// Idle thread body: reschedule, then halt until the next interrupt.
pub fn idle_entry(_arg: usize) {
    loop {
        SCHEDULER.yield_cpu(crate::smp::current_cpu_id());
        crate::arch::halt();
    }
}
