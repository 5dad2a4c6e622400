//! Initial ramdisk filesystem
//!
//! Read-only root candidate parsed from the boot module image. The format
//! is a `u32` file count followed by one 73-byte header per file:
//! `{magic: u8, name: [u8; 64], offset: u32, length: u32}`, with offsets
//! relative to the ramdisk base. Parsing resolves them against the image
//! (the rewrite-to-absolute step) and validates the magic and bounds of
//! every entry. Files appear in a flat root directory; all mutation is
//! refused.

use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};

use super::node::{
    DirEntry, FilesystemType, Ino, MountId, MountOps, MountedFs, NodeOps, NodeType, VfsNode,
};
use crate::error::{FsError, KernelError, KernelResult};

/// Magic byte opening every file header.
pub const INITRD_FILE_MAGIC: u8 = 0xBF;

/// Fixed name field width in a file header.
const NAME_LEN: usize = 64;

/// On-image size of one file header.
const HEADER_LEN: usize = 1 + NAME_LEN + 4 + 4;

/// Root directory inode; files follow from 2.
const ROOT_INO: Ino = 1;

/// The registrable `initrd` type.
pub struct InitrdFs;

/// One parsed file entry with its offset resolved against the image.
struct InitrdFile {
    name: String,
    offset: usize,
    length: usize,
}

/// A mounted ramdisk image.
struct InitrdVolume {
    image: Vec<u8>,
    files: Vec<InitrdFile>,
    this: Weak<InitrdVolume>,
}

fn read_u32(image: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]])
}

impl InitrdVolume {
    fn parse(data: &[u8]) -> KernelResult<Arc<Self>> {
        if data.len() < 4 {
            return Err(FsError::BadImage.into());
        }
        let nr_files = read_u32(data, 0) as usize;
        if data.len() < 4 + nr_files * HEADER_LEN {
            return Err(FsError::BadImage.into());
        }

        let mut files = Vec::with_capacity(nr_files);
        for i in 0..nr_files {
            let at = 4 + i * HEADER_LEN;
            if data[at] != INITRD_FILE_MAGIC {
                return Err(FsError::BadImage.into());
            }
            let name_field = &data[at + 1..at + 1 + NAME_LEN];
            let name_end = name_field
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(NAME_LEN);
            let name = String::from_utf8_lossy(&name_field[..name_end]).into_owned();

            // Offsets on the image are base-relative; resolving them
            // against our copy of the image is the absolute rewrite.
            let offset = read_u32(data, at + 1 + NAME_LEN) as usize;
            let length = read_u32(data, at + 1 + NAME_LEN + 4) as usize;
            if offset + length > data.len() {
                return Err(FsError::BadImage.into());
            }
            files.push(InitrdFile {
                name,
                offset,
                length,
            });
        }

        log::debug!("initrd: {} files parsed", files.len());
        Ok(Arc::new_cyclic(|this| Self {
            image: data.to_vec(),
            files,
            this: this.clone(),
        }))
    }

    fn ops(&self) -> Arc<dyn NodeOps> {
        self.this.upgrade().expect("initrd volume gone")
    }

    fn file(&self, ino: Ino) -> KernelResult<&InitrdFile> {
        self.files
            .get(ino.checked_sub(2).ok_or(FsError::NotFound)? as usize)
            .ok_or(FsError::NotFound.into())
    }

    fn build_node(&self, mount: MountId, ino: Ino) -> KernelResult<VfsNode> {
        if ino == ROOT_INO {
            return Ok(VfsNode::new(
                ROOT_INO,
                "initrd",
                NodeType::Directory,
                0,
                mount,
                self.ops(),
            ));
        }
        let file = self.file(ino)?;
        Ok(VfsNode::new(
            ino,
            &file.name,
            NodeType::File,
            file.length as u64,
            mount,
            self.ops(),
        ))
    }
}

impl FilesystemType for InitrdFs {
    fn name(&self) -> &'static str {
        "initrd"
    }

    fn description(&self) -> &'static str {
        "read-only initial ramdisk"
    }

    fn mount(
        &self,
        mount: MountId,
        _device: Option<&str>,
        data: Option<&[u8]>,
    ) -> KernelResult<MountedFs> {
        let data = data.ok_or(KernelError::InvalidArgument {
            what: "initrd mount without an image",
        })?;
        let volume = InitrdVolume::parse(data)?;
        let root = volume.build_node(mount, ROOT_INO)?;
        Ok(MountedFs { ops: volume, root })
    }
}

impl MountOps for InitrdVolume {
    fn read_node(&self, mount: MountId, ino: Ino) -> KernelResult<VfsNode> {
        self.build_node(mount, ino)
    }
}

impl NodeOps for InitrdVolume {
    fn read(&self, node: &VfsNode, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let file = self.file(node.ino)?;
        let offset = offset as usize;
        if offset >= file.length {
            return Ok(0);
        }
        let n = buf.len().min(file.length - offset);
        let start = file.offset + offset;
        buf[..n].copy_from_slice(&self.image[start..start + n]);
        Ok(n)
    }

    fn write(&self, _node: &VfsNode, _offset: u64, _data: &[u8]) -> KernelResult<usize> {
        Err(FsError::ReadOnly.into())
    }

    fn readdir(&self, node: &VfsNode, index: usize) -> KernelResult<Option<DirEntry>> {
        if node.ino != ROOT_INO {
            return Err(FsError::NotADirectory.into());
        }
        Ok(self.files.get(index).map(|f| DirEntry {
            name: f.name.clone(),
            ino: index as Ino + 2,
        }))
    }

    fn finddir(&self, node: &VfsNode, name: &str) -> KernelResult<Ino> {
        if node.ino != ROOT_INO {
            return Err(FsError::NotADirectory.into());
        }
        self.files
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as Ino + 2)
            .ok_or(FsError::NotFound.into())
    }

    fn create(&self, _parent: &VfsNode, _name: &str, _node_type: NodeType) -> KernelResult<Ino> {
        Err(FsError::ReadOnly.into())
    }
}

#[cfg(test)]
pub mod tests {
    use alloc::vec;

    use super::*;
    use crate::fs::Vfs;

    /// Assemble a ramdisk image from `(name, content)` pairs.
    pub fn build_image(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut image = vec![0u8; 4 + files.len() * HEADER_LEN];
        image[0..4].copy_from_slice(&(files.len() as u32).to_le_bytes());

        for (i, (name, content)) in files.iter().enumerate() {
            let offset = image.len();
            image.extend_from_slice(content);

            let at = 4 + i * HEADER_LEN;
            image[at] = INITRD_FILE_MAGIC;
            image[at + 1..at + 1 + name.len()].copy_from_slice(name.as_bytes());
            image[at + 1 + NAME_LEN..at + 1 + NAME_LEN + 4]
                .copy_from_slice(&(offset as u32).to_le_bytes());
            image[at + 1 + NAME_LEN + 4..at + HEADER_LEN]
                .copy_from_slice(&(content.len() as u32).to_le_bytes());
        }
        image
    }

    fn mounted(files: &[(&str, &[u8])]) -> Vfs {
        let vfs = Vfs::new();
        vfs.register_type(Arc::new(InitrdFs)).unwrap();
        let image = build_image(files);
        vfs.mount(None, "/", "initrd", Some(&image)).unwrap();
        vfs
    }

    #[test]
    fn test_lookup_and_read_files() {
        let vfs = mounted(&[("a", b"alpha"), ("b", b"bravo!"), ("c", b"")]);

        let b = vfs.lookup("/b", Some(NodeType::File)).unwrap();
        assert_eq!(vfs.stat(b).unwrap().size, 6);

        let mut buf = vec![0u8; 16];
        assert_eq!(vfs.read(b, 0, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"bravo!");

        // Offset reads clamp to the file length.
        assert_eq!(vfs.read(b, 3, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"vo!");
        assert_eq!(vfs.read(b, 64, &mut buf).unwrap(), 0);
        vfs.close(b).unwrap();

        assert_eq!(vfs.lookup("/missing", None), Err(FsError::NotFound.into()));
    }

    #[test]
    fn test_readdir_lists_all_files() {
        let vfs = mounted(&[("one", b"1"), ("two", b"2")]);
        let root = vfs.lookup("/", Some(NodeType::Directory)).unwrap();

        let entries: Vec<_> = (0..3)
            .map_while(|i| vfs.readdir(root, i).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "one");
        assert_eq!(entries[1].name, "two");
        assert_eq!(entries[0].ino, 2);
        vfs.close(root).unwrap();
    }

    #[test]
    fn test_mutation_is_refused() {
        let vfs = mounted(&[("f", b"data")]);
        let f = vfs.lookup("/f", Some(NodeType::File)).unwrap();
        assert_eq!(vfs.write(f, 0, b"x"), Err(FsError::ReadOnly.into()));
        assert_eq!(
            vfs.create(None, "/new", NodeType::File),
            Err(FsError::ReadOnly.into())
        );
        vfs.close(f).unwrap();
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut image = build_image(&[("f", b"data")]);
        image[4] = 0x00;
        let vfs = Vfs::new();
        vfs.register_type(Arc::new(InitrdFs)).unwrap();
        assert_eq!(
            vfs.mount(None, "/", "initrd", Some(&image)),
            Err(FsError::BadImage.into())
        );
    }

    #[test]
    fn test_truncated_image_rejected() {
        let image = build_image(&[("f", b"data")]);
        let vfs = Vfs::new();
        vfs.register_type(Arc::new(InitrdFs)).unwrap();
        assert_eq!(
            vfs.mount(None, "/", "initrd", Some(&image[..10])),
            Err(FsError::BadImage.into())
        );
    }

    #[test]
    fn test_out_of_bounds_entry_rejected() {
        let mut image = build_image(&[("f", b"data")]);
        // Corrupt the length so offset + length overruns the image.
        let at = 4 + 1 + NAME_LEN + 4;
        image[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let vfs = Vfs::new();
        vfs.register_type(Arc::new(InitrdFs)).unwrap();
        assert_eq!(
            vfs.mount(None, "/", "initrd", Some(&image)),
            Err(FsError::BadImage.into())
        );
    }
}
