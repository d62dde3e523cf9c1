//! In-memory inode tree assembled by the caller and consumed by
//! [`crate::write_to`].
//!
//! `Node` is a cheap handle over a reference-counted cell. The counting is
//! deliberately not thread-safe; a tree belongs to one thread.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use crate::disk::NAME_MAX;
use crate::error::*;
use crate::Hash256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

pub(crate) struct Xattr {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

pub(crate) struct NodeInner {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub nlink: u32,
    pub mtime: Timespec,
    pub ctime: Timespec,
    /// Set iff the node is attached to a parent directory
    pub name: Option<Vec<u8>>,
    /// Symlink target or backing file reference; empty means unset
    pub payload: Option<Vec<u8>>,
    pub parent: Weak<RefCell<NodeInner>>,
    pub children: Vec<Node>,
    /// Hardlink redirection; the node contributes a dirent but its own
    /// inode fields are not what the entry resolves to
    pub link_to: Option<Node>,
    pub xattrs: Vec<Xattr>,
    pub digest: Option<Hash256>,
    /// Assigned during canonicalization, BFS position starting at 0
    pub inode_num: u32,
}

#[derive(Clone)]
pub struct Node(pub(crate) Rc<RefCell<NodeInner>>);

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

impl Node {
    /// A detached node with nlink 1 and everything else zeroed
    pub fn new() -> Self {
        Node(Rc::new(RefCell::new(NodeInner {
            mode: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            nlink: 1,
            mtime: Timespec::default(),
            ctime: Timespec::default(),
            name: None,
            payload: None,
            parent: Weak::new(),
            children: Vec::new(),
            link_to: None,
            xattrs: Vec::new(),
            digest: None,
            inode_num: 0,
        })))
    }

    pub fn mode(&self) -> u32 {
        self.0.borrow().mode
    }

    pub fn set_mode(&self, mode: u32) {
        self.0.borrow_mut().mode = mode;
    }

    pub fn uid(&self) -> u32 {
        self.0.borrow().uid
    }

    pub fn set_uid(&self, uid: u32) {
        self.0.borrow_mut().uid = uid;
    }

    pub fn gid(&self) -> u32 {
        self.0.borrow().gid
    }

    pub fn set_gid(&self, gid: u32) {
        self.0.borrow_mut().gid = gid;
    }

    pub fn rdev(&self) -> u32 {
        self.0.borrow().rdev
    }

    pub fn set_rdev(&self, rdev: u32) {
        self.0.borrow_mut().rdev = rdev;
    }

    pub fn size(&self) -> u64 {
        self.0.borrow().size
    }

    pub fn set_size(&self, size: u64) {
        self.0.borrow_mut().size = size;
    }

    pub fn nlink(&self) -> u32 {
        self.0.borrow().nlink
    }

    pub fn set_nlink(&self, nlink: u32) {
        self.0.borrow_mut().nlink = nlink;
    }

    pub fn mtime(&self) -> Timespec {
        self.0.borrow().mtime
    }

    pub fn set_mtime(&self, t: Timespec) {
        self.0.borrow_mut().mtime = t;
    }

    pub fn ctime(&self) -> Timespec {
        self.0.borrow().ctime
    }

    pub fn set_ctime(&self, t: Timespec) {
        self.0.borrow_mut().ctime = t;
    }

    /// The name bound by the parent directory, if attached
    pub fn name(&self) -> Option<Vec<u8>> {
        self.0.borrow().name.clone()
    }

    pub fn payload(&self) -> Option<Vec<u8>> {
        self.0.borrow().payload.clone()
    }

    pub fn set_payload(&self, payload: &[u8]) {
        self.0.borrow_mut().payload = Some(payload.to_vec());
    }

    pub fn fsverity_digest(&self) -> Option<Hash256> {
        self.0.borrow().digest
    }

    /// The sha256 fs-verity digest of the described file's contents
    pub fn set_fsverity_digest(&self, digest: Hash256) {
        self.0.borrow_mut().digest = Some(digest);
    }

    pub fn parent(&self) -> Option<Node> {
        self.0.borrow().parent.upgrade().map(Node)
    }

    pub fn is_dir(&self) -> bool {
        self.0.borrow().mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn n_children(&self) -> usize {
        self.0.borrow().children.len()
    }

    pub fn child(&self, i: usize) -> Option<Node> {
        self.0.borrow().children.get(i).cloned()
    }

    /// Linear scan for the first child bound to `name`, byte-exact
    pub fn lookup_child(&self, name: &[u8]) -> Option<Node> {
        self.0
            .borrow()
            .children
            .iter()
            .find(|c| c.0.borrow().name.as_deref() == Some(name))
            .cloned()
    }

    /// Attach `child` under `name`. A node can be attached once only.
    pub fn add_child(&self, child: &Node, name: &[u8]) -> FsResult<()> {
        if Rc::ptr_eq(&self.0, &child.0) {
            return Err(FsError::InvalidArgument);
        }
        if !self.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        if child.0.borrow().name.is_some() {
            return Err(FsError::AlreadyAttached);
        }
        if self.lookup_child(name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        {
            let mut c = child.0.borrow_mut();
            c.name = Some(name.to_vec());
            c.parent = Rc::downgrade(&self.0);
        }
        self.0.borrow_mut().children.push(child.clone());
        Ok(())
    }

    /// Detach the child bound to `name`, keeping sibling order. The node
    /// may live on through handles held by the caller and be reinserted.
    pub fn remove_child(&self, name: &[u8]) -> FsResult<()> {
        if !self.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let child = {
            let mut n = self.0.borrow_mut();
            let i = n
                .children
                .iter()
                .position(|c| c.0.borrow().name.as_deref() == Some(name))
                .ok_or(FsError::NotFound)?;
            n.children.remove(i)
        };
        let mut c = child.0.borrow_mut();
        c.name = None;
        c.parent = Weak::new();
        Ok(())
    }

    /// Turn this node into a hardlink alias of `target`'s terminal node
    /// and bump that terminal's nlink. Chains never form: the stored
    /// redirection always points at a non-alias node.
    pub fn make_hardlink(&self, target: &Node) -> FsResult<()> {
        let terminal = target.target();
        if Rc::ptr_eq(&self.0, &terminal.0) {
            return Err(FsError::InvalidArgument);
        }
        terminal.0.borrow_mut().nlink += 1;
        self.0.borrow_mut().link_to = Some(terminal);
        Ok(())
    }

    /// Follow `link_to` to the terminal node; identity for non-aliases
    pub(crate) fn target(&self) -> Node {
        let mut node = self.clone();
        loop {
            let next = node.0.borrow().link_to.clone();
            match next {
                Some(t) => node = t,
                None => return node,
            }
        }
    }

    pub fn n_xattrs(&self) -> usize {
        self.0.borrow().xattrs.len()
    }

    pub fn xattr_name(&self, i: usize) -> Option<Vec<u8>> {
        self.0.borrow().xattrs.get(i).map(|x| x.key.clone())
    }

    pub fn xattr(&self, name: &[u8]) -> Option<Vec<u8>> {
        self.0
            .borrow()
            .xattrs
            .iter()
            .find(|x| x.key == name)
            .map(|x| x.value.clone())
    }

    /// Set or replace an extended attribute. Keys and values must fit the
    /// 16-bit length fields of the xattr block encoding.
    pub fn set_xattr(&self, name: &[u8], value: &[u8]) -> FsResult<()> {
        if name.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(FsError::InvalidArgument);
        }
        let mut n = self.0.borrow_mut();
        if let Some(x) = n.xattrs.iter_mut().find(|x| x.key == name) {
            x.value = value.to_vec();
            return Ok(());
        }
        n.xattrs.push(Xattr {
            key: name.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    pub fn unset_xattr(&self, name: &[u8]) -> FsResult<()> {
        let mut n = self.0.borrow_mut();
        let i = n
            .xattrs
            .iter()
            .position(|x| x.key == name)
            .ok_or(FsError::NotFound)?;
        n.xattrs.swap_remove(i);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dir() -> Node {
        let n = Node::new();
        n.set_mode(libc::S_IFDIR | 0o755);
        n
    }

    fn file() -> Node {
        let n = Node::new();
        n.set_mode(libc::S_IFREG | 0o644);
        n
    }

    #[test]
    fn new_node_defaults() {
        let n = Node::new();
        assert_eq!(n.nlink(), 1);
        assert_eq!(n.mode(), 0);
        assert!(n.name().is_none());
        assert!(n.parent().is_none());
        assert!(n.fsverity_digest().is_none());
    }

    #[test]
    fn add_child_binds_name_and_parent() {
        let d = dir();
        let f = file();
        d.add_child(&f, b"a").unwrap();
        assert_eq!(f.name().as_deref(), Some(b"a".as_slice()));
        assert!(Rc::ptr_eq(&f.parent().unwrap().0, &d.0));
        assert_eq!(d.n_children(), 1);
        assert!(Rc::ptr_eq(&d.lookup_child(b"a").unwrap().0, &f.0));
        assert!(d.lookup_child(b"b").is_none());
    }

    #[test]
    fn add_child_errors() {
        let d = dir();
        let f = file();

        assert!(matches!(
            f.add_child(&Node::new(), b"x"),
            Err(FsError::NotADirectory)
        ));
        assert!(matches!(
            d.add_child(&d, b"self"),
            Err(FsError::InvalidArgument)
        ));
        assert!(matches!(
            d.add_child(&f, &[b'n'; NAME_MAX + 1]),
            Err(FsError::NameTooLong)
        ));

        d.add_child(&f, b"a").unwrap();
        assert!(matches!(
            d.add_child(&f, b"again"),
            Err(FsError::AlreadyAttached)
        ));
        let g = file();
        assert!(matches!(d.add_child(&g, b"a"), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn remove_child_detaches_and_preserves_order() {
        let d = dir();
        let (a, b, c) = (file(), file(), file());
        d.add_child(&a, b"a").unwrap();
        d.add_child(&b, b"b").unwrap();
        d.add_child(&c, b"c").unwrap();

        d.remove_child(b"b").unwrap();
        assert_eq!(d.n_children(), 2);
        assert_eq!(d.child(0).unwrap().name().as_deref(), Some(b"a".as_slice()));
        assert_eq!(d.child(1).unwrap().name().as_deref(), Some(b"c".as_slice()));
        assert!(b.name().is_none());
        assert!(b.parent().is_none());

        // a detached node can be reinserted
        d.add_child(&b, b"b2").unwrap();
        assert_eq!(b.name().as_deref(), Some(b"b2".as_slice()));

        assert!(matches!(d.remove_child(b"zzz"), Err(FsError::NotFound)));
        assert!(matches!(
            file().remove_child(b"a"),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn hardlink_follows_chains() {
        let orig = file();
        let alias = Node::new();
        alias.make_hardlink(&orig).unwrap();
        assert_eq!(orig.nlink(), 2);

        // linking to an alias resolves to its terminal node
        let alias2 = Node::new();
        alias2.make_hardlink(&alias).unwrap();
        assert_eq!(orig.nlink(), 3);
        assert!(Rc::ptr_eq(&alias2.target().0, &orig.0));

        // a node cannot alias itself, directly or through a chain
        assert!(matches!(
            orig.make_hardlink(&orig),
            Err(FsError::InvalidArgument)
        ));
        assert!(matches!(
            orig.make_hardlink(&alias2),
            Err(FsError::InvalidArgument)
        ));
        assert_eq!(orig.nlink(), 3);
    }

    #[test]
    fn xattr_set_get_unset() {
        let f = file();
        assert!(f.xattr(b"user.a").is_none());
        f.set_xattr(b"user.a", b"1").unwrap();
        f.set_xattr(b"user.b", b"2").unwrap();
        assert_eq!(f.xattr(b"user.a").as_deref(), Some(b"1".as_slice()));
        assert_eq!(f.n_xattrs(), 2);

        // replacement keeps a single entry per key
        f.set_xattr(b"user.a", b"11").unwrap();
        assert_eq!(f.n_xattrs(), 2);
        assert_eq!(f.xattr(b"user.a").as_deref(), Some(b"11".as_slice()));

        f.unset_xattr(b"user.a").unwrap();
        assert_eq!(f.n_xattrs(), 1);
        assert!(f.xattr(b"user.a").is_none());
        assert!(matches!(f.unset_xattr(b"user.a"), Err(FsError::NotFound)));

        let big = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            f.set_xattr(b"user.big", &big),
            Err(FsError::InvalidArgument)
        ));
    }
}
