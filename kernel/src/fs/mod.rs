//! Virtual filesystem layer
//!
//! Mount-composed namespace over reference-counted nodes. Each mount owns a
//! node cache keyed by inode number; the rest of the kernel holds
//! `(mount, inode)` handles and explicit references. The resolver walks
//! path components through `finddir`, interning nodes into the owning
//! mount's cache on first use and crossing mount boundaries through the
//! covered directory's mount id. Filesystem types live in a name-unique
//! registry and are instantiated per mount.
//!
//! Locking: the type registry and the mount table each have a global lock;
//! every mount guards its own cache with its own lock. Lookup never holds
//! two mount locks at once (boundary crossings finish with one mount
//! before locking the next).

pub mod initrd;
pub mod node;
pub mod ramfs;

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::{collections::BTreeMap, sync::Arc};
use spin::{Mutex, RwLock};

use crate::error::{FsError, KernelError, KernelResult};

pub use node::{
    DirEntry, FilesystemType, Ino, MountId, MountOps, MountedFs, NodeHandle, NodeOps, NodeType,
    RegisteredType, Stat, VfsNode,
};

/// A live mount: one filesystem instance bound into the namespace.
pub struct Mount {
    pub id: MountId,
    /// Registry name of the filesystem type
    pub type_name: &'static str,
    /// Node-loading operations
    pub ops: Arc<dyn MountOps>,
    /// Inode of this mount's root directory
    pub root: Ino,
    /// The covered directory in the parent filesystem (`None` for root)
    pub mnt_point: Option<NodeHandle>,
    /// Per-mount node cache, ordered by inode for O(log n) lookup
    nodes: BTreeMap<Ino, VfsNode>,
}

impl Mount {
    fn node(&self, ino: Ino) -> KernelResult<&VfsNode> {
        self.nodes.get(&ino).ok_or(FsError::NotFound.into())
    }

    fn node_mut(&mut self, ino: Ino) -> KernelResult<&mut VfsNode> {
        self.nodes.get_mut(&ino).ok_or(FsError::NotFound.into())
    }

    /// Number of nodes currently interned in the cache.
    pub fn cached_nodes(&self) -> usize {
        self.nodes.len()
    }
}

/// Outcome of a cache probe during resolution.
enum Probe {
    /// A plain node, already referenced
    Node(NodeHandle),
    /// The component is covered by another mount
    Covered(MountId),
}

/// The virtual filesystem: type registry, mount table, resolver.
pub struct Vfs {
    /// Registered filesystem types (global registry lock)
    types: Mutex<alloc::vec::Vec<RegisteredType>>,
    /// Mount table (global table lock; each mount has its own lock)
    mounts: RwLock<BTreeMap<MountId, Mutex<Mount>>>,
    /// Serializes mount/umount against each other
    mount_op: Mutex<()>,
    /// The first mount at "/", if any
    root_mount: Mutex<Option<MountId>>,
    next_mount_id: AtomicU32,
}

impl Vfs {
    /// Create an empty namespace.
    pub fn new() -> Self {
        Self {
            types: Mutex::new(alloc::vec::Vec::new()),
            mounts: RwLock::new(BTreeMap::new()),
            mount_op: Mutex::new(()),
            root_mount: Mutex::new(None),
            next_mount_id: AtomicU32::new(1),
        }
    }

    // ----- type registry -------------------------------------------------

    /// Register a filesystem type; names are unique.
    pub fn register_type(&self, fstype: Arc<dyn FilesystemType>) -> KernelResult<()> {
        let mut types = self.types.lock();
        if types.iter().any(|t| t.fstype.name() == fstype.name()) {
            return Err(FsError::AlreadyExists.into());
        }
        log::debug!("registered filesystem type {}", fstype.name());
        types.push(RegisteredType::new(fstype));
        Ok(())
    }

    /// Unregister a type; fails while any mount of it lives.
    pub fn unregister_type(&self, name: &str) -> KernelResult<()> {
        let mut types = self.types.lock();
        let i = types
            .iter()
            .position(|t| t.fstype.name() == name)
            .ok_or(FsError::UnknownType)?;
        if types[i].mounts > 0 {
            return Err(FsError::Busy.into());
        }
        types.remove(i);
        Ok(())
    }

    fn type_by_name(&self, name: &str) -> KernelResult<Arc<dyn FilesystemType>> {
        let types = self.types.lock();
        types
            .iter()
            .find(|t| t.fstype.name() == name)
            .map(|t| t.fstype.clone())
            .ok_or(FsError::UnknownType.into())
    }

    fn bump_type_mounts(&self, name: &str, delta: isize) {
        let mut types = self.types.lock();
        if let Some(t) = types.iter_mut().find(|t| t.fstype.name() == name) {
            t.mounts = (t.mounts as isize + delta) as usize;
        }
    }

    // ----- node access helpers -------------------------------------------

    fn with_mount<R>(
        &self,
        id: MountId,
        f: impl FnOnce(&mut Mount) -> KernelResult<R>,
    ) -> KernelResult<R> {
        let mounts = self.mounts.read();
        let m = mounts.get(&id).ok_or(FsError::NotFound)?;
        let mut guard = m.lock();
        f(&mut guard)
    }

    /// Run `f` against the node behind `h`.
    pub fn with_node<R>(&self, h: NodeHandle, f: impl FnOnce(&VfsNode) -> R) -> KernelResult<R> {
        self.with_mount(h.mount, |m| Ok(f(m.node(h.ino)?)))
    }

    /// Take an additional reference on `h`.
    pub fn refer(&self, h: NodeHandle) -> KernelResult<i32> {
        self.with_mount(h.mount, |m| Ok(m.node_mut(h.ino)?.refer()))
    }

    /// Release one reference on `h`; at zero the node leaves its mount's
    /// cache and is freed.
    pub fn deref(&self, h: NodeHandle) -> KernelResult<i32> {
        self.with_mount(h.mount, |m| {
            let left = m.node_mut(h.ino)?.deref();
            if left == 0 {
                let node = m.nodes.remove(&h.ino).expect("node vanished under its lock");
                log::trace!("freed vfs node {}:{}", node.name, node.ino);
            }
            Ok(left)
        })
    }

    /// Reference count of the node behind `h`.
    pub fn node_refs(&self, h: NodeHandle) -> KernelResult<i32> {
        self.with_node(h, |n| n.refs())
    }

    /// Mount id of the root mount.
    pub fn root_mount_id(&self) -> Option<MountId> {
        *self.root_mount.lock()
    }

    fn root_handle(&self) -> KernelResult<NodeHandle> {
        let id = self.root_mount.lock().ok_or(FsError::NoRootMount)?;
        let root = self.with_mount(id, |m| Ok(m.root))?;
        Ok(NodeHandle { mount: id, ino: root })
    }

    /// Total nodes interned across all mount caches (leak census).
    pub fn cached_node_count(&self) -> usize {
        let mounts = self.mounts.read();
        mounts.values().map(|m| m.lock().cached_nodes()).sum()
    }

    /// Number of live mounts.
    pub fn mount_count(&self) -> usize {
        self.mounts.read().len()
    }

    // ----- resolution ----------------------------------------------------

    /// Resolve `path` to a referenced node handle.
    ///
    /// Absolute paths re-anchor at the namespace root regardless of `base`;
    /// relative paths descend from `base` (the caller's cwd). Every early
    /// return releases the reference currently held, so failures leak
    /// nothing.
    fn lookup_internal(
        &self,
        base: Option<NodeHandle>,
        path: &str,
    ) -> KernelResult<NodeHandle> {
        let (mut current, rest) = if let Some(stripped) = path.strip_prefix('/') {
            let rest = stripped.trim_start_matches('/');
            let root = self.root_handle()?;
            self.refer(root)?;
            (root, rest)
        } else {
            let b = base.ok_or(KernelError::InvalidArgument {
                what: "relative path without a base directory",
            })?;
            if !self.with_node(b, |n| n.node_type == NodeType::Directory)? {
                return Err(FsError::NotADirectory.into());
            }
            self.refer(b)?;
            (b, path)
        };

        for token in rest.split('/') {
            if token.is_empty() {
                continue;
            }

            if !self.with_node(current, |n| n.node_type == NodeType::Directory)? {
                let _ = self.deref(current);
                return Err(FsError::NotADirectory.into());
            }

            // Map the component to an inode in the current directory.
            let ino = match self.with_mount(current.mount, |m| {
                let dir = m.node(current.ino)?;
                let ops = dir.ops.clone();
                ops.finddir(dir, token)
            }) {
                Ok(ino) => ino,
                Err(e) => {
                    let _ = self.deref(current);
                    return Err(e);
                }
            };

            // Probe the mount's node cache under its lock; load the node
            // from the filesystem on a miss.
            let probe = self.with_mount(current.mount, |m| {
                if let Some(n) = m.nodes.get_mut(&ino) {
                    if let Some(sub) = n.mounted {
                        Ok(Probe::Covered(sub))
                    } else {
                        n.refer();
                        Ok(Probe::Node(NodeHandle { mount: m.id, ino }))
                    }
                } else {
                    let ops = m.ops.clone();
                    let mut loaded = ops.read_node(m.id, ino)?;
                    assert_eq!(loaded.ino, ino, "filesystem returned a mislabelled node");
                    loaded.mount = m.id;
                    loaded.refer();
                    m.nodes.insert(ino, loaded);
                    Ok(Probe::Node(NodeHandle { mount: m.id, ino }))
                }
            });

            let next = match probe {
                Ok(Probe::Node(h)) => h,
                Ok(Probe::Covered(sub)) => {
                    // Cross the boundary: the caller sees the mounted root,
                    // never the covered directory.
                    match self.with_mount(sub, |sm| {
                        let root = sm.root;
                        let n = sm.node_mut(root)?;
                        assert_eq!(n.node_type, NodeType::Directory);
                        n.refer();
                        Ok(NodeHandle { mount: sub, ino: root })
                    }) {
                        Ok(h) => h,
                        Err(e) => {
                            let _ = self.deref(current);
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    let _ = self.deref(current);
                    return Err(e);
                }
            };

            let _ = self.deref(current);
            current = next;
        }

        Ok(current)
    }

    /// Resolve an absolute `path`, optionally requiring a node type.
    /// Returns a referenced handle the caller must `deref` (or `close`).
    pub fn lookup(&self, path: &str, expected: Option<NodeType>) -> KernelResult<NodeHandle> {
        self.lookup_at(None, path, expected)
    }

    /// Resolve `path` from `base` (the caller's cwd for relative paths).
    pub fn lookup_at(
        &self,
        base: Option<NodeHandle>,
        path: &str,
        expected: Option<NodeType>,
    ) -> KernelResult<NodeHandle> {
        if path.is_empty() {
            return Err(KernelError::InvalidArgument { what: "empty path" });
        }
        let h = self.lookup_internal(base, path)?;
        if let Some(want) = expected {
            let actual = self.with_node(h, |n| n.node_type)?;
            if actual != want {
                let _ = self.deref(h);
                return Err(FsError::NotFound.into());
            }
        }
        Ok(h)
    }

    // ----- mounting -------------------------------------------------------

    /// Mount a filesystem of registered type `type_name` at `path`.
    ///
    /// The first successful mount at `"/"` becomes the root mount. Any
    /// later mount requires `path` to resolve to an existing directory that
    /// is not already a mount root; that directory is covered until
    /// `umount`.
    pub fn mount(
        &self,
        device: Option<&str>,
        path: &str,
        type_name: &str,
        data: Option<&[u8]>,
    ) -> KernelResult<MountId> {
        if path.is_empty() {
            return Err(KernelError::InvalidArgument { what: "empty mount path" });
        }
        let _serial = self.mount_op.lock();

        let is_first = self.root_mount.lock().is_none();
        let cover = if is_first {
            if path != "/" {
                return Err(FsError::NoRootMount.into());
            }
            None
        } else {
            let n = self.lookup(path, Some(NodeType::Directory))?;
            let is_mount_root = self.with_mount(n.mount, |m| Ok(m.root == n.ino))?;
            if is_mount_root {
                let _ = self.deref(n);
                return Err(FsError::Busy.into());
            }
            Some(n)
        };

        let fstype = match self.type_by_name(type_name) {
            Ok(t) => t,
            Err(e) => {
                if let Some(c) = cover {
                    let _ = self.deref(c);
                }
                return Err(e);
            }
        };

        let id = MountId(self.next_mount_id.fetch_add(1, Ordering::Relaxed));
        let MountedFs { ops, mut root } = match fstype.mount(id, device, data) {
            Ok(m) => m,
            Err(e) => {
                if let Some(c) = cover {
                    let _ = self.deref(c);
                }
                return Err(e);
            }
        };

        assert_eq!(
            root.node_type,
            NodeType::Directory,
            "mount with a non-directory root"
        );
        root.mount = id;
        // The mount's own reference: the root can never be freed from
        // under a live mount.
        root.refer();
        let root_ino = root.ino;

        let mut nodes = BTreeMap::new();
        nodes.insert(root_ino, root);
        self.mounts.write().insert(
            id,
            Mutex::new(Mount {
                id,
                type_name: fstype.name(),
                ops,
                root: root_ino,
                mnt_point: cover,
                nodes,
            }),
        );

        if let Some(c) = cover {
            // The covered directory keeps the reference taken by the lookup
            // above for as long as the mount lives.
            self.with_mount(c.mount, |m| {
                m.node_mut(c.ino)?.mounted = Some(id);
                Ok(())
            })?;
        }

        if is_first {
            *self.root_mount.lock() = Some(id);
        }
        self.bump_type_mounts(type_name, 1);
        log::info!("mounted {} at {}", type_name, path);
        Ok(id)
    }

    /// Unmount the filesystem whose root `path` resolves to.
    ///
    /// Refuses while any reference beyond the mount's own root reference
    /// is outstanding. Zero-reference cache entries cannot exist (they are
    /// evicted on their last deref), so a busy cache means live handles.
    pub fn umount(&self, path: &str) -> KernelResult<()> {
        let _serial = self.mount_op.lock();

        let h = self.lookup(path, Some(NodeType::Directory))?;
        let (is_mount_root, mnt_point, type_name) =
            self.with_mount(h.mount, |m| Ok((m.root == h.ino, m.mnt_point, m.type_name)))?;

        if !is_mount_root {
            let _ = self.deref(h);
            return Err(KernelError::InvalidArgument {
                what: "path is not a mount root",
            });
        }
        let cover = match mnt_point {
            Some(c) => c,
            None => {
                // The root filesystem stays for the kernel's lifetime.
                let _ = self.deref(h);
                return Err(FsError::Busy.into());
            }
        };

        // Our lookup holds one reference on the root; the mount itself
        // holds the other. Anything further is an outstanding user.
        let busy = self.with_mount(h.mount, |m| {
            Ok(m.node(m.root)?.refs() != 2 || m.nodes.len() != 1)
        })?;
        if busy {
            let _ = self.deref(h);
            return Err(FsError::Busy.into());
        }

        if let Ok(fstype) = self.type_by_name(type_name) {
            if let Err(e) = fstype.unmount(h.mount) {
                let _ = self.deref(h);
                return Err(e);
            }
        }

        // Dropping the mount drops its cache; the root's two remaining
        // references (ours and the mount's) die with it.
        self.mounts.write().remove(&h.mount);

        self.with_mount(cover.mount, |m| {
            m.node_mut(cover.ino)?.mounted = None;
            Ok(())
        })?;
        // Release the mnt_point reference the mount held since creation.
        self.deref(cover)?;
        self.bump_type_mounts(type_name, -1);
        log::info!("unmounted {} from {}", type_name, path);
        Ok(())
    }

    // ----- node operations ------------------------------------------------

    /// Read from a node at `offset`.
    pub fn read(&self, h: NodeHandle, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.with_mount(h.mount, |m| {
            let n = m.node(h.ino)?;
            let ops = n.ops.clone();
            ops.read(n, offset, buf)
        })
    }

    /// Write to a node at `offset`, refreshing its cached size.
    pub fn write(&self, h: NodeHandle, offset: u64, data: &[u8]) -> KernelResult<usize> {
        self.with_mount(h.mount, |m| {
            let n = m.node_mut(h.ino)?;
            let ops = n.ops.clone();
            let written = ops.write(n, offset, data)?;
            n.size = ops.size_of(n);
            Ok(written)
        })
    }

    /// Directory entry at `index`, or `None` past the end.
    pub fn readdir(&self, h: NodeHandle, index: usize) -> KernelResult<Option<DirEntry>> {
        self.with_mount(h.mount, |m| {
            let n = m.node(h.ino)?;
            if n.node_type != NodeType::Directory {
                return Err(FsError::NotADirectory.into());
            }
            let ops = n.ops.clone();
            ops.readdir(n, index)
        })
    }

    /// Map `name` to an inode within directory `h`.
    pub fn finddir(&self, h: NodeHandle, name: &str) -> KernelResult<Ino> {
        self.with_mount(h.mount, |m| {
            let n = m.node(h.ino)?;
            if n.node_type != NodeType::Directory {
                return Err(FsError::NotADirectory.into());
            }
            let ops = n.ops.clone();
            ops.finddir(n, name)
        })
    }

    /// Create a node at `path` (absolute, or relative to `base`).
    ///
    /// The leaf names `.` and `..` are rejected; the parent must resolve to
    /// a directory whose filesystem supports `create`. Returns a referenced
    /// handle to the new node.
    pub fn create(
        &self,
        base: Option<NodeHandle>,
        path: &str,
        node_type: NodeType,
    ) -> KernelResult<NodeHandle> {
        let (dir_part, leaf) = match path.rfind('/') {
            Some(0) => ("/", &path[1..]),
            Some(pos) => (&path[..pos], &path[pos + 1..]),
            None => ("", path),
        };
        if leaf.is_empty() || leaf == "." || leaf == ".." {
            return Err(KernelError::InvalidArgument {
                what: "invalid leaf name",
            });
        }

        let parent = if dir_part.is_empty() {
            let b = base.ok_or(KernelError::InvalidArgument {
                what: "relative path without a base directory",
            })?;
            if !self.with_node(b, |n| n.node_type == NodeType::Directory)? {
                return Err(FsError::NotADirectory.into());
            }
            self.refer(b)?;
            b
        } else {
            self.lookup_at(base, dir_part, Some(NodeType::Directory))?
        };

        let ino = match self.with_mount(parent.mount, |m| {
            let p = m.node(parent.ino)?;
            let ops = p.ops.clone();
            ops.create(p, leaf, node_type)
        }) {
            Ok(ino) => ino,
            Err(e) => {
                let _ = self.deref(parent);
                return Err(e);
            }
        };

        // Intern the fresh node and hand out a referenced handle.
        let result = self.with_mount(parent.mount, |m| {
            if let Some(n) = m.nodes.get_mut(&ino) {
                n.refer();
            } else {
                let ops = m.ops.clone();
                let mut loaded = ops.read_node(m.id, ino)?;
                loaded.mount = m.id;
                loaded.refer();
                m.nodes.insert(ino, loaded);
            }
            Ok(NodeHandle { mount: m.id, ino })
        });

        let _ = self.deref(parent);
        result
    }

    /// Dispatch the node's close hook and release the caller's reference.
    pub fn close(&self, h: NodeHandle) -> KernelResult<()> {
        self.with_mount(h.mount, |m| {
            let n = m.node(h.ino)?;
            let ops = n.ops.clone();
            ops.close(n)
        })?;
        self.deref(h)?;
        Ok(())
    }

    /// Stat record for the node behind `h`.
    pub fn stat(&self, h: NodeHandle) -> KernelResult<Stat> {
        self.with_node(h, |n| Stat {
            dev: h.mount.0,
            ino: n.ino,
            mode: n.node_type.as_raw(),
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: n.size,
        })
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    /// The kernel-wide namespace. Hosted tests build private [`Vfs`]
    /// instances instead.
    pub static ref VFS: Vfs = Vfs::new();
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec};

    use super::*;
    use crate::fs::{initrd::InitrdFs, ramfs::RamFs};

    /// Namespace with a writable ramfs root.
    fn rooted() -> Vfs {
        let vfs = Vfs::new();
        vfs.register_type(Arc::new(RamFs)).unwrap();
        vfs.mount(None, "/", "ramfs", None).unwrap();
        vfs
    }

    fn write_file(vfs: &Vfs, path: &str, data: &[u8]) -> NodeHandle {
        let h = vfs.create(None, path, NodeType::File).unwrap();
        assert_eq!(vfs.write(h, 0, data).unwrap(), data.len());
        h
    }

    #[test]
    fn test_type_registry_uniqueness_and_busy() {
        let vfs = Vfs::new();
        vfs.register_type(Arc::new(RamFs)).unwrap();
        assert_eq!(
            vfs.register_type(Arc::new(RamFs)),
            Err(FsError::AlreadyExists.into())
        );

        vfs.mount(None, "/", "ramfs", None).unwrap();
        assert_eq!(vfs.unregister_type("ramfs"), Err(FsError::Busy.into()));
        assert_eq!(vfs.unregister_type("nofs"), Err(FsError::UnknownType.into()));
    }

    #[test]
    fn test_first_mount_must_be_root() {
        let vfs = Vfs::new();
        vfs.register_type(Arc::new(RamFs)).unwrap();
        assert_eq!(
            vfs.mount(None, "/mnt", "ramfs", None),
            Err(FsError::NoRootMount.into())
        );
        vfs.mount(None, "/", "ramfs", None).unwrap();
        assert!(vfs.root_mount_id().is_some());
    }

    #[test]
    fn test_root_lookup_and_miss() {
        let vfs = rooted();
        for name in ["a", "b", "c"] {
            let h = write_file(&vfs, &alloc::format!("/{}", name), b"payload");
            vfs.close(h).unwrap();
        }

        let b = vfs.lookup("/b", Some(NodeType::File)).unwrap();
        assert_eq!(vfs.with_node(b, |n| n.name.clone()).unwrap(), "b");
        assert_eq!(vfs.stat(b).unwrap().size, 7);
        assert_eq!(vfs.stat(b).unwrap().mode, NodeType::File.as_raw());
        vfs.close(b).unwrap();

        assert_eq!(
            vfs.lookup("/missing", None),
            Err(FsError::NotFound.into())
        );
        // Type mismatch surfaces as not-found, with no leaked reference.
        assert_eq!(
            vfs.lookup("/b", Some(NodeType::Directory)),
            Err(FsError::NotFound.into())
        );
    }

    #[test]
    fn test_lookup_through_file_is_enotdir() {
        let vfs = rooted();
        let h = write_file(&vfs, "/file", b"x");
        vfs.close(h).unwrap();
        assert_eq!(
            vfs.lookup("/file/inside", None),
            Err(FsError::NotADirectory.into())
        );
    }

    #[test]
    fn test_repeated_slashes_collapse() {
        let vfs = rooted();
        let d = vfs.create(None, "/dir", NodeType::Directory).unwrap();
        vfs.close(d).unwrap();
        let h = write_file(&vfs, "/dir/f", b"data");
        vfs.close(h).unwrap();

        let h = vfs.lookup("//dir///f", Some(NodeType::File)).unwrap();
        assert_eq!(vfs.stat(h).unwrap().size, 4);
        vfs.close(h).unwrap();
    }

    #[test]
    fn test_relative_lookup_anchors_at_base() {
        let vfs = rooted();
        let d = vfs.create(None, "/home", NodeType::Directory).unwrap();
        let f = write_file(&vfs, "/home/notes", b"hi");
        vfs.close(f).unwrap();

        let h = vfs.lookup_at(Some(d), "notes", Some(NodeType::File)).unwrap();
        assert_eq!(vfs.with_node(h, |n| n.name.clone()).unwrap(), "notes");
        vfs.close(h).unwrap();

        // Absolute paths ignore the base.
        let r = vfs.lookup_at(Some(d), "/home", Some(NodeType::Directory)).unwrap();
        vfs.close(r).unwrap();
        vfs.close(d).unwrap();

        assert_eq!(
            vfs.lookup_at(None, "notes", None),
            Err(KernelError::InvalidArgument {
                what: "relative path without a base directory"
            })
        );
    }

    #[test]
    fn test_create_rejects_dot_names() {
        let vfs = rooted();
        assert!(matches!(
            vfs.create(None, "/.", NodeType::Directory),
            Err(KernelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            vfs.create(None, "/dir/..", NodeType::Directory),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_refcount_conservation_over_mount_lookup_umount() {
        let vfs = rooted();
        let d = vfs.create(None, "/mnt", NodeType::Directory).unwrap();
        vfs.close(d).unwrap();

        let root_cached = vfs.cached_node_count();
        vfs.mount(None, "/mnt", "ramfs", None).unwrap();

        let f = vfs.create(None, "/mnt/data", NodeType::File).unwrap();
        assert_eq!(vfs.write(f, 0, b"abc").unwrap(), 3);
        vfs.close(f).unwrap();

        let h = vfs.lookup("/mnt/data", Some(NodeType::File)).unwrap();
        vfs.close(h).unwrap();

        vfs.umount("/mnt").unwrap();
        // Every refer had its deref: the namespace census is back to the
        // pre-mount state.
        assert_eq!(vfs.cached_node_count(), root_cached);
        assert_eq!(vfs.mount_count(), 1);
    }

    #[test]
    fn test_mount_traversal_hides_covered_directory() {
        let vfs = rooted();
        let d = vfs.create(None, "/mnt", NodeType::Directory).unwrap();
        vfs.close(d).unwrap();

        // A marker only visible in the covered directory.
        let marker = write_file(&vfs, "/mnt/covered", b"below");
        vfs.close(marker).unwrap();

        let sub = vfs.mount(None, "/mnt", "ramfs", None).unwrap();
        let x = write_file(&vfs, "/mnt/x", b"above");
        vfs.close(x).unwrap();

        // Resolution lands in the mounted filesystem.
        let h = vfs.lookup("/mnt/x", Some(NodeType::File)).unwrap();
        assert_eq!(vfs.with_node(h, |n| n.mount).unwrap(), sub);
        vfs.close(h).unwrap();

        // The covered file is unreachable through the mount.
        assert_eq!(
            vfs.lookup("/mnt/covered", None),
            Err(FsError::NotFound.into())
        );

        // "/mnt" itself resolves to the new root, not the covered dir.
        let m = vfs.lookup("/mnt", Some(NodeType::Directory)).unwrap();
        assert_eq!(m.mount, sub);
        vfs.close(m).unwrap();

        vfs.umount("/mnt").unwrap();
        // After unmounting, the covered directory is visible again.
        let h = vfs.lookup("/mnt/covered", Some(NodeType::File)).unwrap();
        vfs.close(h).unwrap();
    }

    #[test]
    fn test_mount_on_mount_root_is_busy() {
        let vfs = rooted();
        let d = vfs.create(None, "/mnt", NodeType::Directory).unwrap();
        vfs.close(d).unwrap();
        vfs.mount(None, "/mnt", "ramfs", None).unwrap();
        assert_eq!(
            vfs.mount(None, "/mnt", "ramfs", None),
            Err(FsError::Busy.into())
        );
    }

    #[test]
    fn test_umount_with_live_reference_is_busy() {
        let vfs = rooted();
        let d = vfs.create(None, "/mnt", NodeType::Directory).unwrap();
        vfs.close(d).unwrap();
        vfs.mount(None, "/mnt", "ramfs", None).unwrap();

        let f = vfs.create(None, "/mnt/held", NodeType::File).unwrap();
        assert_eq!(vfs.umount("/mnt"), Err(FsError::Busy.into()));

        vfs.close(f).unwrap();
        vfs.umount("/mnt").unwrap();
    }

    #[test]
    fn test_umount_of_root_is_busy() {
        let vfs = rooted();
        assert_eq!(vfs.umount("/"), Err(FsError::Busy.into()));
    }

    #[test]
    fn test_unknown_type_mount_fails_cleanly() {
        let vfs = rooted();
        let d = vfs.create(None, "/mnt", NodeType::Directory).unwrap();
        vfs.close(d).unwrap();
        let cached = vfs.cached_node_count();
        assert_eq!(
            vfs.mount(None, "/mnt", "nofs", None),
            Err(FsError::UnknownType.into())
        );
        assert_eq!(vfs.cached_node_count(), cached);
    }

    #[test]
    fn test_nested_mount_with_initrd() {
        let vfs = rooted();
        vfs.register_type(Arc::new(InitrdFs)).unwrap();

        let d = vfs.create(None, "/boot", NodeType::Directory).unwrap();
        vfs.close(d).unwrap();

        let image = crate::fs::initrd::tests::build_image(&[("kernel.map", b"symbols")]);
        vfs.mount(None, "/boot", "initrd", Some(&image)).unwrap();

        let h = vfs.lookup("/boot/kernel.map", Some(NodeType::File)).unwrap();
        let mut buf = vec![0u8; 16];
        let n = vfs.read(h, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"symbols");

        // Read-only: writes and creates are refused.
        assert!(vfs.write(h, 0, b"x").is_err());
        assert!(vfs.create(None, "/boot/new", NodeType::File).is_err());
        vfs.close(h).unwrap();

        vfs.umount("/boot").unwrap();
        vfs.unregister_type("initrd").unwrap();
    }
}
