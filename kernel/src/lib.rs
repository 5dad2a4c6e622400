//! Matrix Kernel Core
//!
//! Execution and resource core of the Matrix teaching kernel: the
//! priority-preemptive multiprocessor scheduler, the virtual filesystem
//! layer and the hole-coalescing kernel heap, together with the clock and
//! software-timer plumbing they depend on.
//!
//! The crate is `no_std` and targets bare-metal x86. On hosted targets it
//! links `std` and the system allocator so the standard `#[test]` harness
//! can exercise the core directly; platform services (page mapping, context
//! switching, the CMOS clock) are consumed through the traits and hooks in
//! [`arch`] and [`mm::mapper`].

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: use the system allocator so unit tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod arch;
pub mod error;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sched;
pub mod smp;
pub mod time;

pub use error::{KernelError, KernelResult};

/// Panic handler for bare-metal builds.
///
/// Corruption-class failures (heap magic mismatch, ref-count underflow,
/// queue invariant violations) funnel here and never return.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("KERNEL PANIC: {}", info);
    loop {
        arch::halt();
    }
}

/// Allocation-failure handler for bare-metal builds.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
