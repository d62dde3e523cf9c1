//! Canonical serialization of a node tree into an image.
//!
//! The build context owns the vdata arena and, when requested, the digest
//! engine; everything is released when `write_to` returns, on every path.

use std::collections::{HashSet, VecDeque};
use std::io::{ErrorKind, Write};
use std::rc::Rc;
use crate::arena::{AppendFlags, Arena, VData};
use crate::debug;
use crate::disk::*;
use crate::error::*;
use crate::node::{Node, NodeInner};
use crate::verity::FsVerityHasher;
use crate::Hash256;

/// Vdata references of one inode, filled by the compute passes
#[derive(Clone, Copy, Default)]
struct InodeSlots {
    variable_data: VData,
    xattrs: VData,
    digest: VData,
}

struct BuildCtx<'a, W: Write> {
    arena: Arena,
    /// Nodes in BFS order; position equals the assigned inode index
    order: Vec<Node>,
    slots: Vec<InodeSlots>,
    inode_table_size: u64,
    sink: &'a mut W,
    verity: Option<FsVerityHasher>,
    bytes_written: u64,
}

/// Serialize the tree rooted at `root` into `sink`. With `want_digest`,
/// the fs-verity digest of the emitted byte stream is returned; it is
/// only produced when the whole write succeeded.
pub fn write_to<W: Write>(root: &Node, sink: &mut W, want_digest: bool) -> FsResult<Option<Hash256>> {
    let mut ctx = BuildCtx {
        arena: Arena::new(),
        order: Vec::new(),
        slots: Vec::new(),
        inode_table_size: 0,
        sink,
        verity: want_digest.then(FsVerityHasher::new),
        bytes_written: 0,
    };

    ctx.compute_tree(root)?;
    ctx.compute_variable_data()?;
    ctx.compute_xattrs()?;
    ctx.serialize()?;

    let digest = ctx.verity.take().map(|v| v.digest());
    if let Some(d) = &digest {
        debug!("image digest {}", hex::encode(d));
    }
    Ok(digest)
}

impl<'a, W: Write> BuildCtx<'a, W> {
    /// Order the tree: children sorted by name, xattrs by key, nodes
    /// numbered breadth-first from the root, directory nlink fixed up.
    fn compute_tree(&mut self, root: &Node) -> FsResult<()> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(Rc::as_ptr(&root.0));
        queue.push_back(root.clone());

        let mut index: u32 = 0;
        while let Some(node) = queue.pop_front() {
            {
                let mut n = node.0.borrow_mut();
                let is_dir = n.mode & libc::S_IFMT == libc::S_IFDIR;
                if !is_dir && !n.children.is_empty() {
                    // only dirs can have children
                    return Err(FsError::InvalidTree);
                }

                if is_dir {
                    n.children
                        .sort_by(|a, b| a.0.borrow().name.cmp(&b.0.borrow().name));
                    // 2 + number of subdirs, counted by each entry's own type
                    let n_dirs = n
                        .children
                        .iter()
                        .filter(|c| c.0.borrow().mode & libc::S_IFMT == libc::S_IFDIR)
                        .count();
                    n.nlink = 2 + n_dirs as u32;
                }
                n.xattrs.sort_by(|a, b| a.key.cmp(&b.key));
                n.inode_num = index;
            }
            index += 1;

            let n = node.0.borrow();
            // children of hardlink aliases are not serialized
            if n.link_to.is_none() {
                for child in &n.children {
                    if !seen.insert(Rc::as_ptr(&child.0)) {
                        return Err(FsError::InvalidTree);
                    }
                    queue.push_back(child.clone());
                }
            }
            drop(n);
            self.order.push(node);
        }

        self.inode_table_size = self.order.len() as u64 * INODE_SZ as u64;
        debug!("computed tree: {} inodes", self.order.len());
        Ok(())
    }

    /// First vdata pass: directory blocks, payload strings, digests
    fn compute_variable_data(&mut self) -> FsResult<()> {
        self.slots = vec![InodeSlots::default(); self.order.len()];

        for (i, node) in self.order.iter().enumerate() {
            let n = node.0.borrow();
            match n.mode & libc::S_IFMT {
                libc::S_IFDIR => {
                    if !n.children.is_empty() {
                        let block = build_dirent_block(&n)?;
                        self.slots[i].variable_data =
                            self.arena.append(&block, AppendFlags::ALIGN)?;
                    }
                }
                libc::S_IFREG => {
                    // canonical images never reference a payload for empty files
                    if n.size != 0 {
                        if let Some(p) = n.payload.as_ref().filter(|p| !p.is_empty()) {
                            self.slots[i].variable_data =
                                self.arena.append(p, AppendFlags::DEDUP)?;
                        }
                    }
                }
                libc::S_IFLNK => {
                    if let Some(p) = n.payload.as_ref().filter(|p| !p.is_empty()) {
                        self.slots[i].variable_data = self.arena.append(p, AppendFlags::DEDUP)?;
                    }
                }
                _ => {}
            }

            if let Some(d) = n.digest.as_ref() {
                self.slots[i].digest = self.arena.append(d, AppendFlags::DEDUP)?;
            }
        }
        Ok(())
    }

    /// Second vdata pass: one shared block per node with xattrs
    fn compute_xattrs(&mut self) -> FsResult<()> {
        for (i, node) in self.order.iter().enumerate() {
            let n = node.0.borrow();
            if n.xattrs.is_empty() {
                continue;
            }
            if n.xattrs.len() > u16::MAX as usize {
                return Err(FsError::InvalidTree);
            }

            let data_len: usize = n.xattrs.iter().map(|x| x.key.len() + x.value.len()).sum();
            let mut buf = Vec::with_capacity(xattr_header_size(n.xattrs.len()) + data_len);

            let header = DXattrHeader {
                n_attr: (n.xattrs.len() as u16).to_le(),
            };
            buf.extend_from_slice(header.as_ref());
            for x in &n.xattrs {
                let entry = DXattrEntry {
                    key_len: (x.key.len() as u16).to_le(),
                    value_len: (x.value.len() as u16).to_le(),
                };
                buf.extend_from_slice(entry.as_ref());
            }
            for x in &n.xattrs {
                buf.extend_from_slice(&x.key);
                buf.extend_from_slice(&x.value);
            }

            self.slots[i].xattrs = self
                .arena
                .append(&buf, AppendFlags::DEDUP | AppendFlags::ALIGN)?;
        }
        Ok(())
    }

    fn serialize(&mut self) -> FsResult<()> {
        let data_offset =
            (SUPERBLOCK_SZ as u64 + self.inode_table_size).next_multiple_of(VDATA_ALIGN as u64);

        let sb = DSuperBlock {
            magic: CAFS_MAGIC.to_le(),
            version: CAFS_VERSION.to_le(),
            vdata_offset: data_offset.to_le(),
        };
        self.emit(sb.as_ref())?;

        for i in 0..self.order.len() {
            let di = {
                let n = self.order[i].0.borrow();
                let s = &self.slots[i];
                DInode {
                    mode: n.mode.to_le(),
                    nlink: n.nlink.to_le(),
                    uid: n.uid.to_le(),
                    gid: n.gid.to_le(),
                    rdev: n.rdev.to_le(),
                    size: n.size.to_le(),
                    mtime_sec: n.mtime.sec.to_le(),
                    mtime_nsec: n.mtime.nsec.to_le(),
                    ctime_sec: n.ctime.sec.to_le(),
                    ctime_nsec: n.ctime.nsec.to_le(),
                    variable_data: dvdata(s.variable_data),
                    xattrs: dvdata(s.xattrs),
                    digest: dvdata(s.digest),
                }
            };
            self.emit(di.as_ref())?;
        }

        debug_assert_eq!(
            self.bytes_written,
            SUPERBLOCK_SZ as u64 + self.inode_table_size
        );

        if !self.arena.is_empty() {
            let pad = (data_offset - self.bytes_written) as usize;
            let zeros = [0u8; VDATA_ALIGN];
            self.emit(&zeros[..pad])?;

            let vdata = std::mem::take(&mut self.arena);
            self.emit(vdata.bytes())?;
        }
        Ok(())
    }

    /// Single exit point for image bytes: feeds the digest engine, counts,
    /// and drives the sink to completion. Short writes are retried, a
    /// zero-length write is an error.
    fn emit(&mut self, buf: &[u8]) -> FsResult<()> {
        if let Some(v) = self.verity.as_mut() {
            v.update(buf);
        }
        self.bytes_written += buf.len() as u64;

        let mut rest = buf;
        while !rest.is_empty() {
            match self.sink.write(rest) {
                Ok(0) => return Err(FsError::Io(ErrorKind::WriteZero.into())),
                Ok(k) => rest = &rest[k..],
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn dvdata(v: VData) -> DVData {
    DVData {
        off: v.off.to_le(),
        len: v.len.to_le(),
    }
}

/// Directory block: header, fixed dirents, packed name area. Entries for
/// hardlink aliases resolve to the terminal node's inode and type.
fn build_dirent_block(n: &NodeInner) -> FsResult<Vec<u8>> {
    let mut names_size = 0usize;
    for child in &n.children {
        let c = child.0.borrow();
        let name = c.name.as_ref().ok_or(FsError::InvalidTree)?;
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        names_size += name.len();
    }

    let header_size = dir_header_size(n.children.len());
    let mut buf = Vec::with_capacity(header_size + names_size);

    let header = DDirHeader {
        n_dirents: (n.children.len() as u32).to_le(),
    };
    buf.extend_from_slice(header.as_ref());

    let mut name_offset = 0u32;
    for child in &n.children {
        let target = child.target();
        let (inode_num, d_type) = {
            let t = target.0.borrow();
            (t.inode_num, dtype_of(t.mode))
        };
        let c = child.0.borrow();
        let name = c.name.as_ref().ok_or(FsError::InvalidTree)?;
        let entry = DDirEntry {
            inode_num: inode_num.to_le(),
            name_offset: name_offset.to_le(),
            d_type,
            name_len: name.len() as u8,
            _padding: 0,
        };
        buf.extend_from_slice(entry.as_ref());
        name_offset += name.len() as u32;
    }

    for child in &n.children {
        let c = child.0.borrow();
        buf.extend_from_slice(c.name.as_ref().ok_or(FsError::InvalidTree)?);
    }
    Ok(buf)
}
