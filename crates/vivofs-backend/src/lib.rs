#![warn(missing_docs)]

//! VivoFS backend subsystem: the in-process object model for a pluggable
//! filesystem backend.
//!
//! A mounted namespace (an *export*) owns a registry of reference-counted
//! handles (files, directories, symlinks, device nodes) held in memory and
//! backed by a durable key-value context. Directories keep their children
//! under two orderings (by name and by stable ordinal position) so lookups
//! and restartable positional enumeration coexist under concurrent mutation.
//! An async worker pool runs deferred work across all exports, and the
//! shutdown coordinator guarantees every export is flushed to durable storage
//! exactly once before the process goes away.

pub mod asyncpool;
pub mod config;
pub mod dirindex;
pub mod export;
pub mod handle;
pub mod module;
pub mod shutdown;
pub mod types;

pub use asyncpool::{PoolState, WorkerPool};
pub use config::{DelayMode, DelayPolicy, ExportConfig, ModuleConfig};
pub use dirindex::{DirEntry, DirIndex};
pub use export::{Export, NewNode};
pub use handle::{Handle, NodeKind, OpenFlags};
pub use module::{HostRuntime, VivoFs, MODULE_NAME};
pub use shutdown::ShutdownCoordinator;
pub use types::{BackendError, BackendResult, HandleToken, InodeId, NodeAttr, NodeType, Timestamp};
