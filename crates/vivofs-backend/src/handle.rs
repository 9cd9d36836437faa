//! Reference-counted namespace object handles.
//!
//! A handle is the unit of identity for one file, directory, symlink, or
//! device node. Its refcount stays at or above 1 while any directory entry or
//! caller-held reference can reach it; the owning export retires it from the
//! handle table when the count drops to zero. Handles never point at each
//! other: parents, children, and link back-references are all stored as inode
//! numbers into the export's table, so destruction is only ever "remove from
//! the table".

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::dirindex::DirIndex;
use crate::types::{BackendError, BackendResult, HandleToken, InodeId, NodeAttr, NodeType};

/// Access and share-reservation bits for a file open.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Read access.
    pub const READ: OpenFlags = OpenFlags(0x01);
    /// Write access.
    pub const WRITE: OpenFlags = OpenFlags(0x02);
    /// Deny other readers while held.
    pub const DENY_READ: OpenFlags = OpenFlags(0x04);
    /// Deny other writers while held.
    pub const DENY_WRITE: OpenFlags = OpenFlags(0x08);

    /// Returns true if any bit of `other` is set in `self`.
    pub fn contains(&self, other: OpenFlags) -> bool {
        (self.0 & other.0) != 0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Share-mode bookkeeping for one regular file.
#[derive(Debug, Default)]
pub struct ShareState {
    /// Current opens with read access.
    pub readers: u32,
    /// Current opens with write access.
    pub writers: u32,
    /// Current opens holding a deny-read reservation.
    pub deny_read: u32,
    /// Current opens holding a deny-write reservation.
    pub deny_write: u32,
}

impl ShareState {
    /// Records an open, rejecting it if it conflicts with an existing
    /// reservation (or its own reservation conflicts with existing opens).
    pub fn try_open(&mut self, ino: InodeId, flags: OpenFlags) -> BackendResult<()> {
        let wants_read = flags.contains(OpenFlags::READ);
        let wants_write = flags.contains(OpenFlags::WRITE);
        if (wants_read && self.deny_read > 0)
            || (wants_write && self.deny_write > 0)
            || (flags.contains(OpenFlags::DENY_READ) && self.readers > 0)
            || (flags.contains(OpenFlags::DENY_WRITE) && self.writers > 0)
        {
            return Err(BackendError::ShareConflict(ino));
        }
        self.readers += wants_read as u32;
        self.writers += wants_write as u32;
        self.deny_read += flags.contains(OpenFlags::DENY_READ) as u32;
        self.deny_write += flags.contains(OpenFlags::DENY_WRITE) as u32;
        Ok(())
    }

    /// Releases a previously recorded open with the same flags.
    pub fn close(&mut self, flags: OpenFlags) {
        self.readers = self
            .readers
            .saturating_sub(flags.contains(OpenFlags::READ) as u32);
        self.writers = self
            .writers
            .saturating_sub(flags.contains(OpenFlags::WRITE) as u32);
        self.deny_read = self
            .deny_read
            .saturating_sub(flags.contains(OpenFlags::DENY_READ) as u32);
        self.deny_write = self
            .deny_write
            .saturating_sub(flags.contains(OpenFlags::DENY_WRITE) as u32);
    }
}

/// Directory-specific handle state: parent back-reference and dual index.
pub struct DirState {
    /// Inode of the parent directory. The root points at itself.
    pub parent: InodeId,
    /// The by-name / by-position orderings of this directory's children.
    pub index: DirIndex,
}

/// Type-specific state of a handle.
pub enum NodeKind {
    /// Directory: per-directory mutex guards the parent key and dual index.
    Directory(Mutex<DirState>),
    /// Regular file: share-mode tracking for opens.
    File(Mutex<ShareState>),
    /// Symbolic link and its target path.
    Symlink {
        /// Link target.
        target: String,
    },
    /// Device or other special node.
    Device {
        /// Device class discriminator.
        class: NodeType,
        /// Device numbers (major, minor).
        rdev: (u32, u32),
    },
}

/// A directory entry referencing this handle, stored as keys rather than
/// pointers. A hard-linked file carries one of these per parent directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkRef {
    /// Inode of the referencing directory.
    pub dir: InodeId,
    /// Name of the entry in that directory.
    pub name: String,
}

/// In-memory representation of one namespace object.
pub struct Handle {
    ino: InodeId,
    token: HandleToken,
    /// Base name at creation, retained for diagnostics only.
    name: String,
    kind: NodeKind,
    attrs: Mutex<NodeAttr>,
    refcount: AtomicU32,
    links: Mutex<Vec<LinkRef>>,
}

impl Handle {
    /// Creates a directory handle with refcount 1.
    pub fn new_directory(
        ino: InodeId,
        token: HandleToken,
        name: impl Into<String>,
        parent: InodeId,
        attr: NodeAttr,
    ) -> Self {
        Self::new(
            ino,
            token,
            name,
            NodeKind::Directory(Mutex::new(DirState {
                parent,
                index: DirIndex::new(ino),
            })),
            attr,
        )
    }

    /// Creates a regular-file handle with refcount 1.
    pub fn new_file(
        ino: InodeId,
        token: HandleToken,
        name: impl Into<String>,
        attr: NodeAttr,
    ) -> Self {
        Self::new(
            ino,
            token,
            name,
            NodeKind::File(Mutex::new(ShareState::default())),
            attr,
        )
    }

    /// Creates a symlink handle with refcount 1.
    pub fn new_symlink(
        ino: InodeId,
        token: HandleToken,
        name: impl Into<String>,
        target: impl Into<String>,
        attr: NodeAttr,
    ) -> Self {
        Self::new(
            ino,
            token,
            name,
            NodeKind::Symlink {
                target: target.into(),
            },
            attr,
        )
    }

    /// Creates a device/special-node handle with refcount 1.
    pub fn new_device(
        ino: InodeId,
        token: HandleToken,
        name: impl Into<String>,
        class: NodeType,
        rdev: (u32, u32),
        attr: NodeAttr,
    ) -> Self {
        Self::new(ino, token, name, NodeKind::Device { class, rdev }, attr)
    }

    fn new(
        ino: InodeId,
        token: HandleToken,
        name: impl Into<String>,
        kind: NodeKind,
        attr: NodeAttr,
    ) -> Self {
        Self {
            ino,
            token,
            name: name.into(),
            kind,
            attrs: Mutex::new(attr),
            refcount: AtomicU32::new(1),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Inode number of this handle.
    pub fn ino(&self) -> InodeId {
        self.ino
    }

    /// Persistent token re-resolving this handle after eviction.
    pub fn token(&self) -> HandleToken {
        self.token
    }

    /// Base name at creation, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type-specific state.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The object type of this handle.
    pub fn node_type(&self) -> NodeType {
        match &self.kind {
            NodeKind::Directory(_) => NodeType::Directory,
            NodeKind::File(_) => NodeType::RegularFile,
            NodeKind::Symlink { .. } => NodeType::Symlink,
            NodeKind::Device { class, .. } => *class,
        }
    }

    /// Directory state, or `NotADirectory` for other node types.
    pub fn dir_state(&self) -> BackendResult<&Mutex<DirState>> {
        match &self.kind {
            NodeKind::Directory(state) => Ok(state),
            _ => Err(BackendError::NotADirectory(self.ino)),
        }
    }

    /// File share state, or `NotOpenable` for other node types.
    pub fn file_state(&self) -> BackendResult<&Mutex<ShareState>> {
        match &self.kind {
            NodeKind::File(state) => Ok(state),
            _ => Err(BackendError::NotOpenable(self.ino)),
        }
    }

    /// Current attribute set.
    pub fn attrs(&self) -> NodeAttr {
        self.attrs.lock().clone()
    }

    /// Replaces the attribute set.
    pub fn set_attrs(&self, attr: NodeAttr) {
        *self.attrs.lock() = attr;
    }

    /// Applies `f` to the attribute set under its lock.
    pub fn with_attrs<R>(&self, f: impl FnOnce(&mut NodeAttr) -> R) -> R {
        f(&mut self.attrs.lock())
    }

    /// Current reference count.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Increments the refcount. Always succeeds; returns the new count.
    pub fn acquire(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the refcount and returns the new count.
    ///
    /// Decrementing past zero is a pairing bug in the caller and surfaces as
    /// `InvariantViolation` instead of wrapping. The caller that observes the
    /// count reach zero is responsible for retiring the handle from its
    /// export's table under the export write lock.
    pub fn release_count(&self) -> BackendResult<u32> {
        let mut current = self.refcount.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return Err(BackendError::InvariantViolation {
                    detail: format!("release of handle {} with zero refcount", self.ino),
                });
            }
            match self.refcount.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(current - 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Records a directory entry pointing at this handle.
    ///
    /// Returns false if the `(dir, name)` entry was already recorded, so
    /// racing callers cannot double-count one entry's reference.
    pub fn add_link(&self, dir: InodeId, name: &str) -> bool {
        let mut links = self.links.lock();
        if links.iter().any(|l| l.dir == dir && l.name == name) {
            return false;
        }
        links.push(LinkRef {
            dir,
            name: name.to_string(),
        });
        true
    }

    /// Forgets the directory entry `(dir, name)` pointing at this handle.
    ///
    /// Returns true if such an entry was recorded. A reconstructed handle
    /// only records the entries it was looked up through, so the caller must
    /// not assume every live directory entry appears here.
    pub fn remove_link(&self, dir: InodeId, name: &str) -> bool {
        let mut links = self.links.lock();
        let before = links.len();
        links.retain(|l| !(l.dir == dir && l.name == name));
        links.len() < before
    }

    /// Number of directory entries currently recorded against this handle.
    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("ino", &self.ino)
            .field("name", &self.name)
            .field("type", &self.node_type())
            .field("refcount", &self.refcount())
            .finish_non_exhaustive()
    }
}
