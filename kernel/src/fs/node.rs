//! VFS nodes and the filesystem capability traits
//!
//! A node is a value owned by its mount's cache; the rest of the kernel
//! holds `(mount, inode)` handles and explicit reference counts, resolved
//! through the mount table. Filesystems plug in through three traits:
//! [`FilesystemType`] (the registry entry that performs mounts),
//! [`MountOps`] (per-mount node loading) and [`NodeOps`] (per-node
//! operations). Operations a filesystem does not provide fall through to
//! the trait defaults, which report not-supported.

use alloc::{string::String, sync::Arc};

use crate::error::{KernelError, KernelResult};

/// Inode number: a node's identity within a single mount.
pub type Ino = u64;

/// Index of a mount in the mount table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MountId(pub u32);

/// A `(mount, inode)` pair naming one node. Holding a handle implies
/// holding one reference obtained via lookup/create and released with
/// `deref`/`close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle {
    pub mount: MountId,
    pub ino: Ino,
}

/// Node types with their stable on-wire integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeType {
    File = 1,
    Directory = 2,
    CharDevice = 3,
    BlockDevice = 4,
    Pipe = 5,
    Symlink = 6,
    MountPoint = 8,
}

impl NodeType {
    /// The stable integer code.
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Decode a stable integer code.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(NodeType::File),
            2 => Some(NodeType::Directory),
            3 => Some(NodeType::CharDevice),
            4 => Some(NodeType::BlockDevice),
            5 => Some(NodeType::Pipe),
            6 => Some(NodeType::Symlink),
            8 => Some(NodeType::MountPoint),
            _ => None,
        }
    }
}

/// One directory entry as reported by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: Ino,
}

/// Stat record reported for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u32,
    pub ino: Ino,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
}

/// A filesystem node, owned by its mount's cache.
pub struct VfsNode {
    /// Identity within the owning mount
    pub ino: Ino,
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    /// Owning mount
    pub mount: MountId,
    /// Set on a directory covered by another mount's root
    pub mounted: Option<MountId>,
    /// Per-node operations vtable
    pub ops: Arc<dyn NodeOps>,
    /// Filesystem-private scalar
    pub private: u64,
    /// Live references; the node is freed (and leaves the cache) at zero
    ref_count: i32,
}

impl VfsNode {
    /// Build a node with no references yet; the VFS refers it when it
    /// enters a cache.
    pub fn new(
        ino: Ino,
        name: &str,
        node_type: NodeType,
        size: u64,
        mount: MountId,
        ops: Arc<dyn NodeOps>,
    ) -> Self {
        Self {
            ino,
            name: String::from(name),
            node_type,
            size,
            mount,
            mounted: None,
            ops,
            private: 0,
            ref_count: 0,
        }
    }

    /// Take a reference. Panics on a corrupted (negative) count.
    pub fn refer(&mut self) -> i32 {
        assert!(
            self.ref_count >= 0,
            "vfs node {}:{} ref-count corrupted",
            self.name,
            self.ino
        );
        self.ref_count += 1;
        self.ref_count
    }

    /// Drop a reference, returning the remaining count. Panics on
    /// underflow; the caller removes the node from its cache at zero.
    pub fn deref(&mut self) -> i32 {
        assert!(
            self.ref_count > 0,
            "vfs node {}:{} ref-count underflow",
            self.name,
            self.ino
        );
        self.ref_count -= 1;
        self.ref_count
    }

    /// Current reference count.
    pub fn refs(&self) -> i32 {
        self.ref_count
    }
}

/// Per-node operations provided by a filesystem.
///
/// Every method receives the node value so implementations can key their
/// own state off `ino`/`private` without back-pointers.
pub trait NodeOps: Send + Sync {
    /// Read from the node at `offset`; returns bytes read (short reads at
    /// end of file are normal).
    fn read(&self, _node: &VfsNode, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported { operation: "read" })
    }

    /// Write to the node at `offset`; returns bytes written.
    fn write(&self, _node: &VfsNode, _offset: u64, _data: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported { operation: "write" })
    }

    /// Directory entry at position `index`, or `None` past the end.
    fn readdir(&self, _node: &VfsNode, _index: usize) -> KernelResult<Option<DirEntry>> {
        Err(KernelError::NotSupported {
            operation: "readdir",
        })
    }

    /// Map a child name to its inode number.
    fn finddir(&self, _node: &VfsNode, _name: &str) -> KernelResult<Ino> {
        Err(KernelError::NotSupported {
            operation: "finddir",
        })
    }

    /// Create a child of `parent`; returns the new inode number.
    fn create(&self, _parent: &VfsNode, _name: &str, _node_type: NodeType) -> KernelResult<Ino> {
        Err(KernelError::NotSupported { operation: "create" })
    }

    /// Release hook invoked by `close`.
    fn close(&self, _node: &VfsNode) -> KernelResult<()> {
        Ok(())
    }

    /// Current data size of the node (files may grow behind the cached
    /// value; the VFS refreshes it after writes).
    fn size_of(&self, node: &VfsNode) -> u64 {
        node.size
    }
}

/// Per-mount operations: loading nodes into the cache.
pub trait MountOps: Send + Sync {
    /// Materialise the node `ino` of this mount.
    fn read_node(&self, mount: MountId, ino: Ino) -> KernelResult<VfsNode>;
}

/// What a successful `FilesystemType::mount` hands back to the VFS.
pub struct MountedFs {
    /// Node-loading operations for the new mount
    pub ops: Arc<dyn MountOps>,
    /// Root node; the VFS interns it with the mount's own reference
    pub root: VfsNode,
}

/// A registrable filesystem type.
pub trait FilesystemType: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &'static str;

    /// Human-readable description.
    fn description(&self) -> &'static str;

    /// Instantiate the filesystem for a new mount. `root.node_type` must be
    /// [`NodeType::Directory`].
    fn mount(
        &self,
        mount: MountId,
        device: Option<&str>,
        data: Option<&[u8]>,
    ) -> KernelResult<MountedFs>;

    /// Tear-down hook run by a successful unmount.
    fn unmount(&self, _mount: MountId) -> KernelResult<()> {
        Ok(())
    }
}

/// Registry entry pairing a type with its live-mount count.
pub struct RegisteredType {
    pub fstype: Arc<dyn FilesystemType>,
    pub mounts: usize,
}

impl RegisteredType {
    pub fn new(fstype: Arc<dyn FilesystemType>) -> Self {
        Self { fstype, mounts: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;

    #[test]
    fn test_node_type_codes_are_stable() {
        assert_eq!(NodeType::File.as_raw(), 1);
        assert_eq!(NodeType::Directory.as_raw(), 2);
        assert_eq!(NodeType::CharDevice.as_raw(), 3);
        assert_eq!(NodeType::BlockDevice.as_raw(), 4);
        assert_eq!(NodeType::Pipe.as_raw(), 5);
        assert_eq!(NodeType::Symlink.as_raw(), 6);
        assert_eq!(NodeType::MountPoint.as_raw(), 8);
        assert_eq!(NodeType::from_raw(7), None);
        assert_eq!(NodeType::from_raw(2), Some(NodeType::Directory));
    }

    struct NoOps;
    impl NodeOps for NoOps {}

    #[test]
    fn test_ref_count_discipline() {
        let mut n = VfsNode::new(
            1,
            "n",
            NodeType::File,
            0,
            MountId(0),
            Arc::new(NoOps),
        );
        assert_eq!(n.refs(), 0);
        assert_eq!(n.refer(), 1);
        assert_eq!(n.refer(), 2);
        assert_eq!(n.deref(), 1);
        assert_eq!(n.deref(), 0);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_deref_underflow_is_fatal() {
        let mut n = VfsNode::new(
            1,
            "n",
            NodeType::File,
            0,
            MountId(0),
            Arc::new(NoOps),
        );
        let _ = n.deref();
    }

    #[test]
    fn test_default_ops_report_not_supported() {
        let n = VfsNode::new(1, "n", NodeType::File, 0, MountId(0), Arc::new(NoOps));
        let ops: &dyn NodeOps = &NoOps;
        assert!(matches!(
            ops.read(&n, 0, &mut []),
            Err(KernelError::NotSupported { .. })
        ));
        assert!(matches!(
            ops.finddir(&n, "x"),
            Err(KernelError::NotSupported { .. })
        ));
        assert_eq!(
            ops.write(&n, 0, b"x"),
            Err(KernelError::NotSupported { operation: "write" })
        );
    }

    #[test]
    fn test_fs_error_conversion() {
        let e: KernelError = FsError::NotFound.into();
        assert_eq!(e, KernelError::FsError(FsError::NotFound));
    }
}
