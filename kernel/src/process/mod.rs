//! Process table
//!
//! A process is the resource container threads run in: an address-space
//! handle, a file-descriptor table, the root/cwd VFS nodes anchoring its
//! path lookups, and the list of threads it owns. The kernel process (id 0)
//! exists from table creation and owns the idle and reaper threads.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{collections::BTreeMap, string::String, vec::Vec};
use spin::RwLock;

use crate::arch::context::AddressSpaceId;
use crate::error::{KernelResult, SchedError};
use crate::fs::{NodeHandle, NodeType, Vfs};
use crate::sched::thread::ThreadId;

/// Identifier of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl ProcessId {
    /// The kernel process.
    pub const KERNEL: ProcessId = ProcessId(0);
}

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Dead,
}

/// One open file: a referenced node plus cursor and open flags.
#[derive(Debug, Clone, Copy)]
pub struct FileDescriptor {
    pub node: NodeHandle,
    pub offset: u64,
    pub flags: u32,
}

/// Small-integer file-descriptor table.
#[derive(Debug, Default)]
pub struct FdTable {
    slots: Vec<Option<FileDescriptor>>,
}

impl FdTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Install `fd` in the lowest free slot and return its number.
    pub fn allocate(&mut self, fd: FileDescriptor) -> usize {
        if let Some(i) = self.slots.iter().position(Option::is_none) {
            self.slots[i] = Some(fd);
            i
        } else {
            self.slots.push(Some(fd));
            self.slots.len() - 1
        }
    }

    /// Release slot `n`, returning what it held.
    pub fn release(&mut self, n: usize) -> Option<FileDescriptor> {
        self.slots.get_mut(n).and_then(Option::take)
    }

    /// Look up slot `n`.
    pub fn get(&self, n: usize) -> Option<&FileDescriptor> {
        self.slots.get(n).and_then(Option::as_ref)
    }

    /// Look up slot `n` for update (cursor movement).
    pub fn get_mut(&mut self, n: usize) -> Option<&mut FileDescriptor> {
        self.slots.get_mut(n).and_then(Option::as_mut)
    }

    /// Number of live descriptors.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether no descriptor is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process descriptor.
pub struct Process {
    pub id: ProcessId,
    pub name: String,
    pub address_space: AddressSpaceId,
    pub fds: FdTable,
    /// Root directory for absolute lookups (a referenced node)
    pub root: Option<NodeHandle>,
    /// Working directory anchoring relative lookups (a referenced node)
    pub cwd: Option<NodeHandle>,
    pub threads: Vec<ThreadId>,
    pub state: ProcessState,
    pub status: i32,
}

/// Id-keyed table of processes.
pub struct ProcessTable {
    procs: RwLock<BTreeMap<ProcessId, Process>>,
    next_id: AtomicU64,
}

impl ProcessTable {
    /// Create a table holding only the kernel process.
    pub fn new() -> Self {
        let mut procs = BTreeMap::new();
        procs.insert(
            ProcessId::KERNEL,
            Process {
                id: ProcessId::KERNEL,
                name: String::from("kernel"),
                address_space: AddressSpaceId::KERNEL,
                fds: FdTable::new(),
                root: None,
                cwd: None,
                threads: Vec::new(),
                state: ProcessState::Running,
                status: 0,
            },
        );
        Self {
            procs: RwLock::new(procs),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a process and return its id.
    pub fn create(&self, name: &str, address_space: AddressSpaceId) -> ProcessId {
        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.procs.write().insert(
            id,
            Process {
                id,
                name: String::from(name),
                address_space,
                fds: FdTable::new(),
                root: None,
                cwd: None,
                threads: Vec::new(),
                state: ProcessState::Running,
                status: 0,
            },
        );
        id
    }

    /// Run `f` against a process.
    pub fn with<R>(&self, id: ProcessId, f: impl FnOnce(&Process) -> R) -> KernelResult<R> {
        let procs = self.procs.read();
        let p = procs.get(&id).ok_or(SchedError::ProcessNotFound)?;
        Ok(f(p))
    }

    /// Run `f` against a process, mutably.
    pub fn with_mut<R>(
        &self,
        id: ProcessId,
        f: impl FnOnce(&mut Process) -> R,
    ) -> KernelResult<R> {
        let mut procs = self.procs.write();
        let p = procs.get_mut(&id).ok_or(SchedError::ProcessNotFound)?;
        Ok(f(p))
    }

    /// Address space installed when a thread of `id` is scheduled.
    pub fn address_space_of(&self, id: ProcessId) -> AddressSpaceId {
        self.with(id, |p| p.address_space)
            .unwrap_or(AddressSpaceId::KERNEL)
    }

    /// Record that `tid` belongs to process `id`.
    pub fn attach(&self, id: ProcessId, tid: ThreadId) -> KernelResult<()> {
        self.with_mut(id, |p| p.threads.push(tid))
    }

    /// Remove `tid` from its owner; a non-kernel process whose last thread
    /// detaches becomes dead.
    pub fn detach(&self, id: ProcessId, tid: ThreadId) -> KernelResult<()> {
        self.with_mut(id, |p| {
            p.threads.retain(|&t| t != tid);
            if p.threads.is_empty() && p.id != ProcessId::KERNEL {
                p.state = ProcessState::Dead;
            }
        })
    }

    /// Record an exit status.
    pub fn set_exit_status(&self, id: ProcessId, status: i32) -> KernelResult<()> {
        self.with_mut(id, |p| p.status = status)
    }

    /// Install a process's root and working directories.
    ///
    /// The handles become the process's references (typically fresh from
    /// `vfs.lookup`); any previously held ones are released.
    pub fn set_io_context(
        &self,
        vfs: &Vfs,
        id: ProcessId,
        root: Option<NodeHandle>,
        cwd: Option<NodeHandle>,
    ) -> KernelResult<()> {
        let (old_root, old_cwd) = self.with_mut(id, |p| {
            let old = (p.root, p.cwd);
            p.root = root;
            p.cwd = cwd;
            old
        })?;
        if let Some(h) = old_root {
            let _ = vfs.deref(h);
        }
        if let Some(h) = old_cwd {
            let _ = vfs.deref(h);
        }
        Ok(())
    }

    /// Resolve `path` on behalf of process `id`: relative paths anchor at
    /// its working directory, absolute ones at the namespace root.
    pub fn lookup(
        &self,
        vfs: &Vfs,
        id: ProcessId,
        path: &str,
        expected: Option<NodeType>,
    ) -> KernelResult<NodeHandle> {
        let cwd = self.with(id, |p| p.cwd)?;
        vfs.lookup_at(cwd, path, expected)
    }

    /// Number of processes in the table.
    pub fn count(&self) -> usize {
        self.procs.read().len()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_process_exists() {
        let table = ProcessTable::new();
        assert_eq!(table.count(), 1);
        table
            .with(ProcessId::KERNEL, |p| assert_eq!(p.name, "kernel"))
            .unwrap();
    }

    #[test]
    fn test_attach_detach_marks_dead_when_empty() {
        let table = ProcessTable::new();
        let pid = table.create("worker", AddressSpaceId(7));
        let tid = ThreadId(42);

        table.attach(pid, tid).unwrap();
        table
            .with(pid, |p| assert_eq!(p.state, ProcessState::Running))
            .unwrap();

        table.detach(pid, tid).unwrap();
        table
            .with(pid, |p| assert_eq!(p.state, ProcessState::Dead))
            .unwrap();
    }

    #[test]
    fn test_kernel_process_never_dies_on_detach() {
        let table = ProcessTable::new();
        let tid = ThreadId(1);
        table.attach(ProcessId::KERNEL, tid).unwrap();
        table.detach(ProcessId::KERNEL, tid).unwrap();
        table
            .with(ProcessId::KERNEL, |p| {
                assert_eq!(p.state, ProcessState::Running)
            })
            .unwrap();
    }

    #[test]
    fn test_io_context_anchors_relative_lookups() {
        let vfs = Vfs::new();
        vfs.register_type(alloc::sync::Arc::new(crate::fs::ramfs::RamFs))
            .unwrap();
        vfs.mount(None, "/", "ramfs", None).unwrap();

        let home = vfs.create(None, "/home", NodeType::Directory).unwrap();
        let f = vfs.create(None, "/home/rc", NodeType::File).unwrap();
        vfs.close(f).unwrap();

        let table = ProcessTable::new();
        let root = vfs.lookup("/", Some(NodeType::Directory)).unwrap();
        table
            .set_io_context(&vfs, ProcessId::KERNEL, Some(root), Some(home))
            .unwrap();

        let h = table
            .lookup(&vfs, ProcessId::KERNEL, "rc", Some(NodeType::File))
            .unwrap();
        assert_eq!(
            vfs.with_node(h, |n| n.name.clone()).unwrap(),
            "rc"
        );
        vfs.close(h).unwrap();

        // Swapping the context releases the old references.
        table
            .set_io_context(&vfs, ProcessId::KERNEL, None, None)
            .unwrap();
        assert_eq!(vfs.cached_node_count(), 1);
    }

    #[test]
    fn test_fd_table_reuses_lowest_slot() {
        let mut fds = FdTable::new();
        let h = NodeHandle {
            mount: crate::fs::MountId(1),
            ino: 9,
        };
        let fd = FileDescriptor {
            node: h,
            offset: 0,
            flags: 0,
        };
        assert_eq!(fds.allocate(fd), 0);
        assert_eq!(fds.allocate(fd), 1);
        fds.release(0).unwrap();
        assert_eq!(fds.allocate(fd), 0);
        assert_eq!(fds.len(), 2);
    }
}
