//! In-memory filesystem for tests
//!
//! Flat path-to-inode map with just enough `open` semantics to exercise
//! the socket layer: create-exclusive, plain lookup, relative path
//! resolution against the caller's working directory. No symlinks, so
//! `NO_FOLLOW` is trivially satisfied.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use spin::{Mutex, Once};

use super::{FileDescription, Filesystem, Inode, Mode, OpenFlags, Owner};
use crate::error::{KResult, KernelError};

pub struct RamFs {
    entries: Mutex<BTreeMap<String, Arc<Inode>>>,
}

impl RamFs {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn resolve(path: &str, cwd: &str) -> String {
        if path.starts_with('/') {
            String::from(path)
        } else {
            format!("{}/{}", cwd.trim_end_matches('/'), path)
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.lock().contains_key(path)
    }
}

impl Filesystem for RamFs {
    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: Mode,
        cwd: &str,
        owner: Option<Owner>,
    ) -> KResult<Arc<FileDescription>> {
        let path = Self::resolve(path, cwd);
        let mut entries = self.entries.lock();

        if let Some(inode) = entries.get(&path) {
            if flags.contains(OpenFlags::CREATE.union(OpenFlags::EXCLUSIVE)) {
                return Err(KernelError::AlreadyExists);
            }
            return Ok(FileDescription::new_for_inode(inode.clone()));
        }

        if !flags.contains(OpenFlags::CREATE) {
            return Err(KernelError::NotFound);
        }

        let inode = Inode::new(mode, owner.unwrap_or(Owner { uid: 0, gid: 0 }));
        entries.insert(path, inode.clone());
        Ok(FileDescription::new_for_inode(inode))
    }
}

/// Install a process-wide RamFs and return it. Tests share this instance,
/// so each test must use paths of its own.
pub fn install_test_fs() -> &'static RamFs {
    static TEST_FS: Once<&'static RamFs> = Once::new();
    *TEST_FS.call_once(|| {
        let filesystem: &'static RamFs = Box::leak(Box::new(RamFs::new()));
        super::install(filesystem);
        filesystem
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_exclusive() {
        let ramfs = RamFs::new();
        let flags = OpenFlags::CREATE.union(OpenFlags::EXCLUSIVE);
        ramfs
            .open("/mock/a", flags, Mode::NONE, "/", None)
            .unwrap();
        assert_eq!(
            ramfs
                .open("/mock/a", flags, Mode::NONE, "/", None)
                .map(|_| ()),
            Err(KernelError::AlreadyExists)
        );
    }

    #[test]
    fn test_lookup_missing() {
        let ramfs = RamFs::new();
        assert_eq!(
            ramfs
                .open("/mock/missing", OpenFlags::READ_WRITE, Mode::NONE, "/", None)
                .map(|_| ()),
            Err(KernelError::NotFound)
        );
    }

    #[test]
    fn test_relative_resolution() {
        let ramfs = RamFs::new();
        ramfs
            .open("b", OpenFlags::CREATE, Mode::NONE, "/mock/dir", None)
            .unwrap();
        assert!(ramfs.contains("/mock/dir/b"));
    }
}
