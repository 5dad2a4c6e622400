//! Writable in-memory filesystem
//!
//! Backing store for the mutable parts of the namespace (and the test
//! root): per-volume node records with byte buffers for files and
//! name-to-inode maps for directories. Registered as type `ramfs`; each
//! mount gets its own private volume.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{
    collections::BTreeMap,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use spin::RwLock;

use super::node::{
    DirEntry, FilesystemType, Ino, MountId, MountOps, MountedFs, NodeOps, NodeType, VfsNode,
};
use crate::error::{FsError, KernelResult};

/// Root directory inode of every ramfs volume.
const ROOT_INO: Ino = 1;

/// The registrable `ramfs` type.
pub struct RamFs;

/// Backing record for one node.
struct RamNode {
    name: String,
    node_type: NodeType,
    data: Vec<u8>,
    children: BTreeMap<String, Ino>,
}

/// One mounted ramfs instance.
struct RamVolume {
    nodes: RwLock<BTreeMap<Ino, RamNode>>,
    next_ino: AtomicU64,
    this: Weak<RamVolume>,
}

impl RamVolume {
    fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| {
            let mut nodes = BTreeMap::new();
            nodes.insert(
                ROOT_INO,
                RamNode {
                    name: String::from("/"),
                    node_type: NodeType::Directory,
                    data: Vec::new(),
                    children: BTreeMap::new(),
                },
            );
            Self {
                nodes: RwLock::new(nodes),
                next_ino: AtomicU64::new(ROOT_INO + 1),
                this: this.clone(),
            }
        })
    }

    fn ops(&self) -> Arc<dyn NodeOps> {
        self.this.upgrade().expect("ramfs volume gone")
    }

    fn build_node(&self, mount: MountId, ino: Ino) -> KernelResult<VfsNode> {
        let nodes = self.nodes.read();
        let rec = nodes.get(&ino).ok_or(FsError::NotFound)?;
        Ok(VfsNode::new(
            ino,
            &rec.name,
            rec.node_type,
            rec.data.len() as u64,
            mount,
            self.ops(),
        ))
    }
}

impl FilesystemType for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn description(&self) -> &'static str {
        "writable in-memory filesystem"
    }

    fn mount(
        &self,
        mount: MountId,
        _device: Option<&str>,
        _data: Option<&[u8]>,
    ) -> KernelResult<MountedFs> {
        let volume = RamVolume::new();
        let root = volume.build_node(mount, ROOT_INO)?;
        Ok(MountedFs { ops: volume, root })
    }
}

impl MountOps for RamVolume {
    fn read_node(&self, mount: MountId, ino: Ino) -> KernelResult<VfsNode> {
        self.build_node(mount, ino)
    }
}

impl NodeOps for RamVolume {
    fn read(&self, node: &VfsNode, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let nodes = self.nodes.read();
        let rec = nodes.get(&node.ino).ok_or(FsError::NotFound)?;
        if rec.node_type != NodeType::File {
            return Err(FsError::NotAFile.into());
        }
        let offset = offset as usize;
        if offset >= rec.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(rec.data.len() - offset);
        buf[..n].copy_from_slice(&rec.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, node: &VfsNode, offset: u64, data: &[u8]) -> KernelResult<usize> {
        let mut nodes = self.nodes.write();
        let rec = nodes.get_mut(&node.ino).ok_or(FsError::NotFound)?;
        if rec.node_type != NodeType::File {
            return Err(FsError::NotAFile.into());
        }
        let offset = offset as usize;
        let end = offset + data.len();
        if rec.data.len() < end {
            rec.data.resize(end, 0);
        }
        rec.data[offset..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn readdir(&self, node: &VfsNode, index: usize) -> KernelResult<Option<DirEntry>> {
        let nodes = self.nodes.read();
        let rec = nodes.get(&node.ino).ok_or(FsError::NotFound)?;
        if rec.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        Ok(rec.children.iter().nth(index).map(|(name, &ino)| DirEntry {
            name: name.clone(),
            ino,
        }))
    }

    fn finddir(&self, node: &VfsNode, name: &str) -> KernelResult<Ino> {
        let nodes = self.nodes.read();
        let rec = nodes.get(&node.ino).ok_or(FsError::NotFound)?;
        if rec.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        rec.children
            .get(name)
            .copied()
            .ok_or(FsError::NotFound.into())
    }

    fn create(&self, parent: &VfsNode, name: &str, node_type: NodeType) -> KernelResult<Ino> {
        let mut nodes = self.nodes.write();
        let prec = nodes.get(&parent.ino).ok_or(FsError::NotFound)?;
        if prec.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        if prec.children.contains_key(name) {
            return Err(FsError::AlreadyExists.into());
        }

        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        nodes.insert(
            ino,
            RamNode {
                name: String::from(name),
                node_type,
                data: Vec::new(),
                children: BTreeMap::new(),
            },
        );
        nodes
            .get_mut(&parent.ino)
            .expect("parent vanished under write lock")
            .children
            .insert(String::from(name), ino);
        Ok(ino)
    }

    fn size_of(&self, node: &VfsNode) -> u64 {
        self.nodes
            .read()
            .get(&node.ino)
            .map(|r| r.data.len() as u64)
            .unwrap_or(node.size)
    }
}
