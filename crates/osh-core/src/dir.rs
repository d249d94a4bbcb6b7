//! The single flat directory under the mount root.

use crate::file::FileContent;
use osh_error::{OshError, Result};
use osh_types::{InodeNumber, MAX_NAME_LEN, ROOT_INO};
use std::time::SystemTime;

/// Ownership, permission and timestamp metadata of one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta {
    /// POSIX permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl NodeMeta {
    /// Metadata with every timestamp set to `now`.
    #[must_use]
    pub fn new(perm: u16, uid: u32, gid: u32, now: SystemTime) -> Self {
        Self {
            perm: perm & 0o7777,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }

    /// Record a content change.
    pub fn touch_modified(&mut self, now: SystemTime) {
        self.mtime = now;
        self.ctime = now;
    }
}

/// A regular file in the directory.
#[derive(Debug)]
pub struct FileNode {
    pub ino: InodeNumber,
    pub name: Vec<u8>,
    pub meta: NodeMeta,
    pub content: FileContent,
}

/// Flat, unordered set of uniquely named files.
#[derive(Debug)]
pub struct Directory {
    nodes: Vec<FileNode>,
    next_ino: u64,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            next_ino: ROOT_INO.0 + 1,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileNode> {
        self.nodes.iter()
    }

    /// Exact, case-sensitive lookup.
    #[must_use]
    pub fn get(&self, name: &[u8]) -> Option<&FileNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn get_mut(&mut self, name: &[u8]) -> Option<&mut FileNode> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    #[must_use]
    pub fn get_by_ino(&self, ino: InodeNumber) -> Option<&FileNode> {
        self.nodes.iter().find(|n| n.ino == ino)
    }

    pub fn get_by_ino_mut(&mut self, ino: InodeNumber) -> Option<&mut FileNode> {
        self.nodes.iter_mut().find(|n| n.ino == ino)
    }

    /// Add an empty file named `name`.
    pub fn create(&mut self, name: &[u8], meta: NodeMeta) -> Result<&FileNode> {
        validate_name(name)?;
        if self.get(name).is_some() {
            return Err(OshError::Exists);
        }
        let ino = InodeNumber(self.next_ino);
        self.next_ino += 1;
        self.nodes.push(FileNode {
            ino,
            name: name.to_vec(),
            meta,
            content: FileContent::new(),
        });
        let idx = self.nodes.len() - 1;
        Ok(&self.nodes[idx])
    }

    /// Every entry, led by the synthetic `.` and `..` (both the root).
    #[must_use]
    pub fn list(&self) -> Vec<(&[u8], InodeNumber)> {
        let mut out = Vec::with_capacity(self.nodes.len() + 2);
        out.push((&b"."[..], ROOT_INO));
        out.push((&b".."[..], ROOT_INO));
        out.extend(self.nodes.iter().map(|n| (n.name.as_slice(), n.ino)));
        out
    }

    /// Unlink `name` and hand the node back so its content can be released.
    pub fn remove(&mut self, name: &[u8]) -> Result<FileNode> {
        let idx = self
            .nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| OshError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        Ok(self.nodes.remove(idx))
    }
}

/// Check that `name` is a usable single path component.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name == b"." || name == b".." {
        return Err(OshError::InvalidArgument(format!(
            "reserved file name {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(OshError::InvalidArgument(format!(
            "file name {:?} contains a separator",
            String::from_utf8_lossy(name)
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(OshError::NameTooLong);
    }
    Ok(())
}
