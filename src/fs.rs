//! Building a node tree from a live directory.
//!
//! The walk never follows symlinks; every entry is described by its
//! `symlink_metadata`. What ends up in the image is decided later by the
//! writer, this module only captures the tree.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use bitflags::bitflags;
use crate::error::*;
use crate::node::{Node, Timespec};
use crate::verity;
use crate::warn;

bitflags! {
    /// Build flags of the directory walk. Raw bits from an outside caller
    /// go through [`BuildFlags::from_bits`], which rejects unknown bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BuildFlags: u32 {
        /// Do not read extended attributes
        const SKIP_XATTRS = 1 << 0;
        /// Leave mtime/ctime at zero
        const USE_EPOCH = 1 << 1;
        /// Omit block and character devices
        const SKIP_DEVICES = 1 << 2;
        /// Attach the fs-verity digest of regular file contents
        const COMPUTE_DIGEST = 1 << 3;
    }
}

/// Describe the file at `path`; for a directory, recursively describe
/// everything beneath it.
pub fn build_from_path(path: &Path, flags: BuildFlags) -> FsResult<Node> {
    let node = load_node(path, flags)?;
    if node.is_dir() {
        build_dir(&node, path, flags)?;
    }
    Ok(node)
}

fn build_dir(dir: &Node, path: &Path, flags: BuildFlags) -> FsResult<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let child_path = entry.path();
        let child = load_node(&child_path, flags)?;

        if flags.contains(BuildFlags::SKIP_DEVICES) {
            let ft = child.mode() & libc::S_IFMT;
            if ft == libc::S_IFBLK || ft == libc::S_IFCHR {
                warn!("skipping device node {}", child_path.display());
                continue;
            }
        }

        if child.is_dir() {
            build_dir(&child, &child_path, flags)?;
        }
        dir.add_child(&child, entry.file_name().as_bytes())?;
    }
    Ok(())
}

/// One node from one `symlink_metadata`
fn load_node(path: &Path, flags: BuildFlags) -> FsResult<Node> {
    let md = fs::symlink_metadata(path)?;

    let node = Node::new();
    node.set_mode(md.mode());
    node.set_uid(md.uid());
    node.set_gid(md.gid());
    node.set_rdev(md.rdev() as u32);
    node.set_size(md.size());

    if !flags.contains(BuildFlags::USE_EPOCH) {
        node.set_mtime(Timespec {
            sec: md.mtime() as u64,
            nsec: md.mtime_nsec() as u32,
        });
        node.set_ctime(Timespec {
            sec: md.ctime() as u64,
            nsec: md.ctime_nsec() as u32,
        });
    }

    if md.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        node.set_payload(target.as_os_str().as_bytes());
    }

    if md.is_file() && md.size() != 0 && flags.contains(BuildFlags::COMPUTE_DIGEST) {
        let f = fs::File::open(path)?;
        node.set_fsverity_digest(verity::digest_from_reader(f)?);
    }

    if !flags.contains(BuildFlags::SKIP_XATTRS) {
        read_xattrs(&node, path)?;
    }

    Ok(node)
}

fn read_xattrs(node: &Node, path: &Path) -> FsResult<()> {
    let cpath =
        CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::InvalidArgument)?;

    let size = unsafe { libc::llistxattr(cpath.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if size == 0 {
        return Ok(());
    }

    let mut list = vec![0u8; size as usize];
    let size = unsafe {
        libc::llistxattr(
            cpath.as_ptr(),
            list.as_mut_ptr() as *mut libc::c_char,
            list.len(),
        )
    };
    if size < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    list.truncate(size as usize);

    for name in list.split(|b| *b == 0).filter(|n| !n.is_empty()) {
        let value = get_xattr(&cpath, name)?;
        node.set_xattr(name, &value)?;
    }
    Ok(())
}

fn get_xattr(cpath: &CString, name: &[u8]) -> FsResult<Vec<u8>> {
    let cname = CString::new(name).map_err(|_| FsError::InvalidArgument)?;

    let size = unsafe {
        libc::lgetxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            std::ptr::null_mut(),
            0,
        )
    };
    if size < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let mut value = vec![0u8; size as usize];
    if size > 0 {
        let size = unsafe {
            libc::lgetxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if size < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        value.truncate(size as usize);
    }
    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;

    struct Scratch(PathBuf);

    impl Scratch {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("cafs-{}-{}", tag, std::process::id()));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir(&dir).unwrap();
            Scratch(dir)
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn populate(root: &Path) {
        let mut f = fs::File::create(root.join("hello.txt")).unwrap();
        f.write_all(b"hello world").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::File::create(root.join("sub").join("empty")).unwrap();
        symlink("hello.txt", root.join("ln")).unwrap();
    }

    #[test]
    fn build_captures_the_tree() {
        let _ = env_logger::builder().is_test(true).try_init();
        let scratch = Scratch::new("build");
        populate(&scratch.0);

        let root = build_from_path(&scratch.0, BuildFlags::COMPUTE_DIGEST).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.n_children(), 3);

        let hello = root.lookup_child(b"hello.txt").unwrap();
        assert_eq!(hello.size(), 11);
        assert_eq!(
            hex::encode(hello.fsverity_digest().unwrap()),
            "1e2eaa4202d750a41174ee454970b92c1bc2f925b1e35076d8c7d5f56362ba64"
        );
        assert!(hello.mtime().sec > 0);

        let ln = root.lookup_child(b"ln").unwrap();
        assert_eq!(ln.payload().as_deref(), Some(b"hello.txt".as_slice()));

        let sub = root.lookup_child(b"sub").unwrap();
        assert!(sub.lookup_child(b"empty").unwrap().fsverity_digest().is_none());

        // the captured tree serializes
        let mut out = Vec::new();
        crate::write_to(&root, &mut out, true).unwrap().unwrap();
    }

    #[test]
    fn epoch_flag_zeroes_times() {
        let scratch = Scratch::new("epoch");
        populate(&scratch.0);

        let root = build_from_path(&scratch.0, BuildFlags::USE_EPOCH).unwrap();
        let hello = root.lookup_child(b"hello.txt").unwrap();
        assert_eq!(hello.mtime(), Timespec::default());
        assert_eq!(hello.ctime(), Timespec::default());
    }

    #[test]
    fn unknown_flag_bits_are_rejected() {
        assert_eq!(BuildFlags::from_bits(1 << 7), None);
        assert_eq!(
            BuildFlags::from_bits(0b1111),
            Some(BuildFlags::all())
        );
    }
}
