//! Architecture layer
//!
//! The core consumes the platform through this module: cycle counter,
//! interrupt control, CPUID probing and the context/address-space switch
//! primitives. The model assumes one hardware platform (x86) providing a
//! monotonic cycle counter, a programmable one-shot timer, page mapping and
//! IPIs; on hosted targets the switch primitives degrade to recording stubs
//! so the scheduler state machine can be driven by unit tests.

use alloc::string::String;

pub mod context;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Identity and limits probed from the CPU at bring-up.
#[derive(Debug, Clone, Default)]
pub struct CpuFeatures {
    /// Processor brand string, or a placeholder when none is reported
    pub vendor: String,
    /// Stepping id
    pub stepping: u8,
    /// Maximum physical address bits
    pub phys_addr_bits: u8,
    /// Maximum virtual address bits
    pub virt_addr_bits: u8,
    /// Standard feature flags (ECX of CPUID leaf 1)
    pub standard_ecx: u32,
    /// Standard feature flags (EDX of CPUID leaf 1)
    pub standard_edx: u32,
}

/// Probe the current CPU's identity and limits.
pub fn cpu_features() -> CpuFeatures {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::probe_features()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        CpuFeatures {
            vendor: String::from("Unknown vendor"),
            phys_addr_bits: 36,
            virt_addr_bits: 48,
            ..CpuFeatures::default()
        }
    }
}

/// Read the monotonic cycle counter.
#[cfg(target_arch = "x86_64")]
pub fn rdtsc() -> u64 {
    x86_64::rdtsc()
}

/// Fallback for hosted non-x86 targets: a virtual counter that advances on
/// every read, which is enough for the clock arithmetic under test.
#[cfg(not(target_arch = "x86_64"))]
pub fn rdtsc() -> u64 {
    use core::sync::atomic::{AtomicU64, Ordering};
    static VIRTUAL_TSC: AtomicU64 = AtomicU64::new(0);
    VIRTUAL_TSC.fetch_add(1000, Ordering::Relaxed)
}

/// Halt the CPU until the next interrupt.
#[cfg(target_os = "none")]
pub fn halt() {
    ::x86_64::instructions::hlt();
}

/// Hosted stand-in for `hlt`.
#[cfg(not(target_os = "none"))]
pub fn halt() {
    core::hint::spin_loop();
}

/// Disable interrupts, returning whether they were previously enabled.
///
/// The reschedule path calls this before touching per-CPU state and hands
/// the returned state to [`irq_restore`] after the switch completes.
#[cfg(target_os = "none")]
pub fn irq_disable() -> bool {
    let enabled = ::x86_64::instructions::interrupts::are_enabled();
    ::x86_64::instructions::interrupts::disable();
    enabled
}

/// Restore a previously saved interrupt state.
#[cfg(target_os = "none")]
pub fn irq_restore(state: bool) {
    if state {
        ::x86_64::instructions::interrupts::enable();
    }
}

// Hosted builds have no interrupt flag; the pair still brackets critical
// sections so the call sites read the same on both targets.
#[cfg(not(target_os = "none"))]
pub fn irq_disable() -> bool {
    true
}

#[cfg(not(target_os = "none"))]
pub fn irq_restore(_state: bool) {}
