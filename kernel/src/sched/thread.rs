//! Thread descriptors and the id-keyed thread table

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{boxed::Box, collections::BTreeMap, string::String, vec};
use spin::RwLock;

use super::{KSTACK_SIZE, NR_PRIORITIES, THREAD_QUANTUM};
use crate::arch::context::ThreadContext;
use crate::error::{KernelResult, SchedError};
use crate::process::ProcessId;
use crate::smp::CpuId;

/// Identifier of a thread. 0 is never allocated, so a raw 0 in the CPU
/// table means "no thread yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Thread lifecycle state.
///
/// ```text
///     ready --pick--> running --quantum/yield--> ready
///       ^                |               |
///       |                +--block--> sleeping --wake--> ready
///       |                +--exit---> dead --reaper--> (freed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Sleeping,
    Dead,
}

/// Kernel thread entry point; the argument travels in a callee-saved
/// register across the first switch.
pub type ThreadEntry = fn(usize);

/// Thread descriptor.
pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    /// Owning process
    pub process: ProcessId,
    /// 0 highest .. 31 lowest
    pub priority: u8,
    /// Remaining quantum in timer ticks
    pub quantum: u32,
    pub state: ThreadState,
    /// CPU this thread last ran on; admission fixes it, wakeups honour it
    pub cpu: CpuId,
    /// Saved register frame; boxed so its address survives table reshuffles
    pub context: Box<ThreadContext>,
    /// Kernel stack, released by the reaper along with the descriptor
    kstack: Box<[u8]>,
}

impl Thread {
    /// Build a ready thread with a fresh kernel stack.
    pub fn new(
        id: ThreadId,
        name: &str,
        process: ProcessId,
        priority: u8,
        entry: Option<(ThreadEntry, usize)>,
    ) -> Self {
        assert!((priority as usize) < NR_PRIORITIES);
        let kstack = vec![0u8; KSTACK_SIZE].into_boxed_slice();
        // Keep the initial stack pointer 16-byte aligned for the ABI.
        let stack_top = (kstack.as_ptr() as usize + KSTACK_SIZE) & !0xF;
        let mut context = match entry {
            Some((f, _)) => ThreadContext::new(f as usize, stack_top),
            None => ThreadContext::new(0, stack_top),
        };
        if let Some((_, arg)) = entry {
            // First-switch calling convention: the entry shim finds its
            // argument in r12.
            context.r12 = arg as u64;
        }
        Self {
            id,
            name: String::from(name),
            process,
            priority,
            quantum: THREAD_QUANTUM,
            state: ThreadState::Ready,
            cpu: 0,
            context: Box::new(context),
            kstack,
        }
    }

    /// Top of this thread's kernel stack (16-byte aligned).
    pub fn stack_top(&self) -> usize {
        (self.kstack.as_ptr() as usize + KSTACK_SIZE) & !0xF
    }
}

/// Id-keyed table of live threads.
pub struct ThreadTable {
    threads: RwLock<BTreeMap<ThreadId, Thread>>,
    next_id: AtomicU64,
}

impl ThreadTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve a fresh thread id.
    pub fn allocate_id(&self) -> ThreadId {
        ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert a freshly built thread.
    pub fn insert(&self, thread: Thread) {
        let prior = self.threads.write().insert(thread.id, thread);
        assert!(prior.is_none(), "thread id reused");
    }

    /// Remove a thread, handing its descriptor to the caller (the reaper).
    pub fn remove(&self, tid: ThreadId) -> Option<Thread> {
        self.threads.write().remove(&tid)
    }

    /// Run `f` against a thread.
    pub fn with<R>(&self, tid: ThreadId, f: impl FnOnce(&Thread) -> R) -> KernelResult<R> {
        let threads = self.threads.read();
        let t = threads.get(&tid).ok_or(SchedError::ThreadNotFound)?;
        Ok(f(t))
    }

    /// Run `f` against a thread, mutably.
    pub fn with_mut<R>(&self, tid: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> KernelResult<R> {
        let mut threads = self.threads.write();
        let t = threads.get_mut(&tid).ok_or(SchedError::ThreadNotFound)?;
        Ok(f(t))
    }

    /// Whether `tid` names a live thread.
    pub fn contains(&self, tid: ThreadId) -> bool {
        self.threads.read().contains_key(&tid)
    }

    /// Number of live threads.
    pub fn count(&self) -> usize {
        self.threads.read().len()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_thread_is_ready_with_full_quantum() {
        let t = Thread::new(ThreadId(1), "worker", ProcessId::KERNEL, 7, None);
        assert_eq!(t.state, ThreadState::Ready);
        assert_eq!(t.quantum, THREAD_QUANTUM);
        assert_eq!(t.priority, 7);
        assert_eq!(t.stack_top() % 16, 0);
    }

    #[test]
    fn test_entry_argument_lands_in_context() {
        fn entry(_arg: usize) {}
        let t = Thread::new(
            ThreadId(2),
            "worker",
            ProcessId::KERNEL,
            7,
            Some((entry, 0xABCD)),
        );
        assert_eq!(t.context.r12, 0xABCD);
        assert_eq!(t.context.rip, entry as usize as u64);
    }

    #[test]
    fn test_table_insert_lookup_remove() {
        let table = ThreadTable::new();
        let id = table.allocate_id();
        table.insert(Thread::new(id, "t", ProcessId::KERNEL, 3, None));
        assert!(table.contains(id));
        assert_eq!(table.with(id, |t| t.priority).unwrap(), 3);

        let t = table.remove(id).unwrap();
        assert_eq!(t.id, id);
        assert!(!table.contains(id));
        assert_eq!(
            table.with(id, |_| ()),
            Err(crate::error::KernelError::SchedError(
                SchedError::ThreadNotFound
            ))
        );
    }
}
