//! Core identifiers, attributes, and the backend error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Process-local inode number, unique across the whole module.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// First inode number handed out by the module allocator.
    pub const FIRST: InodeId = InodeId(0xc0ffee);

    /// Creates an InodeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-size opaque persistent handle token.
///
/// A token survives eviction of its handle from memory: the export can
/// re-resolve it later by reading the object record stored under the token's
/// bytes. Layout is export id, inode number, and generation, big-endian.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleToken([u8; 24]);

impl HandleToken {
    /// Builds a token from its three components.
    pub fn from_parts(export_id: u64, ino: InodeId, generation: u64) -> Self {
        let mut bytes = [0u8; 24];
        bytes[..8].copy_from_slice(&export_id.to_be_bytes());
        bytes[8..16].copy_from_slice(&ino.as_u64().to_be_bytes());
        bytes[16..].copy_from_slice(&generation.to_be_bytes());
        HandleToken(bytes)
    }

    /// Reconstructs a token from raw wire bytes.
    pub fn from_bytes(bytes: [u8; 24]) -> Self {
        HandleToken(bytes)
    }

    /// The token's raw bytes, used as the durable store key.
    pub fn as_bytes(&self) -> &[u8; 24] {
        &self.0
    }
}

impl fmt::Debug for HandleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleToken(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// Object type of a namespace node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Regular file (S_IFREG)
    RegularFile,
    /// Directory (S_IFDIR)
    Directory,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Character device (S_IFCHR)
    CharDevice,
    /// FIFO/named pipe (S_IFIFO)
    Fifo,
    /// Socket (S_IFSOCK)
    Socket,
}

impl NodeType {
    /// Returns the POSIX S_IFMT bits for this node type.
    pub fn mode_bits(&self) -> u32 {
        match self {
            NodeType::RegularFile => 0o100000,
            NodeType::Directory => 0o040000,
            NodeType::Symlink => 0o120000,
            NodeType::BlockDevice => 0o060000,
            NodeType::CharDevice => 0o020000,
            NodeType::Fifo => 0o010000,
            NodeType::Socket => 0o140000,
        }
    }

    /// Sockets and device nodes cannot be opened for I/O.
    pub fn is_openable(&self) -> bool {
        !matches!(
            self,
            NodeType::Socket | NodeType::CharDevice | NodeType::BlockDevice
        )
    }
}

/// A point in time with second and nanosecond precision.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp.
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// POSIX-like attribute set carried by every handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Permission bits (lower 12 bits)
    pub mode: u32,
    /// Hard link count
    pub nlink: u32,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// File size in bytes
    pub size: u64,
    /// Last access time
    pub atime: Timestamp,
    /// Last modification time
    pub mtime: Timestamp,
    /// Last status change time
    pub ctime: Timestamp,
    /// Device numbers (major, minor) for device nodes
    pub rdev: (u32, u32),
}

impl NodeAttr {
    /// Attributes for a fresh regular file.
    pub fn new_file(uid: u32, gid: u32, mode: u32) -> Self {
        Self::new(uid, gid, mode, 1)
    }

    /// Attributes for a fresh directory. Link count starts at 2 for `.`.
    pub fn new_directory(uid: u32, gid: u32, mode: u32) -> Self {
        Self::new(uid, gid, mode, 2)
    }

    /// Attributes for a fresh symlink; size is the target length.
    pub fn new_symlink(uid: u32, gid: u32, target_len: u64) -> Self {
        let mut attr = Self::new(uid, gid, 0o777, 1);
        attr.size = target_len;
        attr
    }

    fn new(uid: u32, gid: u32, mode: u32, nlink: u32) -> Self {
        let now = Timestamp::now();
        Self {
            mode,
            nlink,
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            rdev: (0, 0),
        }
    }

    /// Bumps mtime and ctime to now.
    pub fn touch_modified(&mut self) {
        let now = Timestamp::now();
        self.mtime = now;
        self.ctime = now;
    }
}

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Error variants for backend operations.
///
/// Ordinary per-call errors (`EntryNotFound`, `EntryExists`, ...) are returned
/// to the caller and never retried by the core. `InvariantViolation` marks
/// structural corruption and is unrecoverable for the affected export.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// No entry with the given name exists in the directory.
    #[error("entry '{name}' not found in directory {parent}")]
    EntryNotFound {
        /// Parent directory inode
        parent: InodeId,
        /// Entry name that was not found
        name: String,
    },

    /// An entry with the given name already exists in the directory.
    #[error("entry '{name}' already exists in directory {parent}")]
    EntryExists {
        /// Parent directory inode
        parent: InodeId,
        /// Existing entry name
        name: String,
    },

    /// No resident handle with the given inode number.
    #[error("handle {0} not found")]
    HandleNotFound(InodeId),

    /// No export registered under the given identifier.
    #[error("export {0} not found")]
    ExportNotFound(u64),

    /// The module has not been configured yet.
    #[error("module is not configured")]
    NotConfigured,

    /// The durable store has no object for the given token.
    #[error("no object for token {0:?}")]
    TokenNotFound(HandleToken),

    /// The inode is not a directory where one was required.
    #[error("handle {0} is not a directory")]
    NotADirectory(InodeId),

    /// Attempted to unlink a non-empty directory.
    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(InodeId),

    /// The node type cannot be opened for I/O.
    #[error("handle {0} is not openable")]
    NotOpenable(InodeId),

    /// The inode is not a symlink where one was required.
    #[error("handle {0} is not a symlink")]
    NotASymlink(InodeId),

    /// An open conflicts with an existing share reservation.
    #[error("share reservation conflict on handle {0}")]
    ShareConflict(InodeId),

    /// A configuration value was out of range or inconsistent.
    #[error("invalid configuration: {field}: {reason}")]
    ConfigInvalid {
        /// The offending setting
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Worker threads could not be spawned; the system degrades to
    /// synchronous execution.
    #[error("resource exhaustion: {reason}")]
    ResourceExhausted {
        /// Description of the failure
        reason: String,
    },

    /// Structural corruption: unrecoverable for the affected export.
    #[error("invariant violation: {detail}")]
    InvariantViolation {
        /// What was found inconsistent
        detail: String,
    },

    /// The worker pool is not accepting work.
    #[error("worker pool is {0:?}, task dropped")]
    PoolNotRunning(crate::asyncpool::PoolState),

    /// Graceful shutdown did not finish before the deadline; remaining
    /// workers were forcibly cancelled.
    #[error("shutdown timed out with {pending_workers} workers still running")]
    ShutdownTimeout {
        /// Workers abandoned by forced cancellation
        pending_workers: usize,
    },

    /// The host refused to unregister the module at final teardown.
    /// Reported as critical but never escalated to process termination.
    #[error("failed to unregister from host: {reason}")]
    UnregisterFailed {
        /// Host-provided reason
        reason: String,
    },

    /// An object record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(String),

    /// An error from the durable store layer.
    #[error(transparent)]
    Store(#[from] vivofs_store::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_id_first() {
        assert_eq!(InodeId::FIRST.as_u64(), 0xc0ffee);
    }

    #[test]
    fn test_token_roundtrip() {
        let tok = HandleToken::from_parts(7, InodeId::new(0xc0ffee), 3);
        let back = HandleToken::from_bytes(*tok.as_bytes());
        assert_eq!(tok, back);
    }

    #[test]
    fn test_token_distinct_per_inode() {
        let a = HandleToken::from_parts(1, InodeId::new(10), 0);
        let b = HandleToken::from_parts(1, InodeId::new(11), 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_serde_roundtrip() {
        let tok = HandleToken::from_parts(1, InodeId::new(42), 9);
        let encoded = bincode::serialize(&tok).unwrap();
        let decoded: HandleToken = bincode::deserialize(&encoded).unwrap();
        assert_eq!(tok, decoded);
    }

    #[test]
    fn test_node_type_openable() {
        assert!(NodeType::RegularFile.is_openable());
        assert!(NodeType::Directory.is_openable());
        assert!(NodeType::Symlink.is_openable());
        assert!(NodeType::Fifo.is_openable());
        assert!(!NodeType::Socket.is_openable());
        assert!(!NodeType::CharDevice.is_openable());
        assert!(!NodeType::BlockDevice.is_openable());
    }

    #[test]
    fn test_node_type_mode_bits_unique() {
        use std::collections::HashSet;
        let bits: HashSet<u32> = [
            NodeType::RegularFile,
            NodeType::Directory,
            NodeType::Symlink,
            NodeType::BlockDevice,
            NodeType::CharDevice,
            NodeType::Fifo,
            NodeType::Socket,
        ]
        .iter()
        .map(|t| t.mode_bits())
        .collect();
        assert_eq!(bits.len(), 7);
    }

    #[test]
    fn test_timestamp_ordering() {
        let t1 = Timestamp { secs: 10, nanos: 5 };
        let t2 = Timestamp { secs: 10, nanos: 6 };
        let t3 = Timestamp { secs: 11, nanos: 0 };
        assert!(t1 < t2);
        assert!(t2 < t3);
    }

    #[test]
    fn test_new_directory_attr() {
        let attr = NodeAttr::new_directory(1000, 1000, 0o755);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.size, 0);
    }

    #[test]
    fn test_new_symlink_attr_size() {
        let attr = NodeAttr::new_symlink(0, 0, 12);
        assert_eq!(attr.size, 12);
        assert_eq!(attr.nlink, 1);
    }

    #[test]
    fn test_error_display() {
        let err = BackendError::EntryExists {
            parent: InodeId::new(5),
            name: "x".into(),
        };
        assert_eq!(format!("{err}"), "entry 'x' already exists in directory 5");
    }
}
