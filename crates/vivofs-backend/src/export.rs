//! Per-export handle registry.
//!
//! An export owns every live handle of one mounted namespace in an
//! arena-style table keyed by inode number and by persistent token. The
//! export's coarse write lock serializes handle-set membership changes;
//! each directory's own mutex serializes mutation of that directory's dual
//! index, so unrelated directories in the same export proceed concurrently.
//!
//! Lock discipline: the table lock is only ever held around membership
//! changes and is never taken while already holding it; a directory mutex may
//! take a table *read* lock (to chase a child key) but table writers never
//! wait on directory mutexes, so the ordering cannot cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vivofs_store::DurableStore;

use crate::config::{DelayPolicy, ExportConfig};
use crate::dirindex::{DirEntry, DirIndex};
use crate::handle::{Handle, NodeKind, OpenFlags};
use crate::types::{
    BackendError, BackendResult, HandleToken, InodeId, NodeAttr, NodeType,
};

/// Specification of a node to create.
pub enum NewNode {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link to `target`.
    Symlink {
        /// Link target path.
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

/// Durable record of one namespace object, stored under its token bytes.
#[derive(Serialize, Deserialize)]
struct NodeRecord {
    ino: InodeId,
    token: HandleToken,
    name: String,
    node_type: NodeType,
    attr: NodeAttr,
    /// Parent directory, for directories.
    parent: Option<InodeId>,
    /// Children and next ordinal, for directories.
    children: Option<(Vec<DirEntry>, u64)>,
    /// Target path, for symlinks.
    symlink_target: Option<String>,
    /// Device numbers, for device nodes.
    rdev: (u32, u32),
}

#[derive(Default)]
struct HandleTable {
    by_ino: HashMap<InodeId, Arc<Handle>>,
    by_token: HashMap<HandleToken, InodeId>,
}

impl HandleTable {
    fn insert(&mut self, handle: Arc<Handle>) {
        self.by_token.insert(handle.token(), handle.ino());
        self.by_ino.insert(handle.ino(), handle);
    }

    fn remove(&mut self, ino: InodeId) -> Option<Arc<Handle>> {
        let handle = self.by_ino.remove(&ino)?;
        self.by_token.remove(&handle.token());
        Some(handle)
    }
}

/// One mounted namespace: root handle, handle table, durable store context.
pub struct Export {
    export_id: u64,
    path: String,
    root: InodeId,
    table: RwLock<HandleTable>,
    store: Arc<dyn DurableStore>,
    delay: RwLock<DelayPolicy>,
    /// Module-wide inode allocator, shared across exports.
    next_inode: Arc<AtomicU64>,
    /// Token generation counter, disambiguating recycled namespaces.
    generation: AtomicU64,
}

impl Export {
    /// Creates the export and opens its root directory handle.
    ///
    /// A store that already holds a namespace is re-attached: the recorded
    /// root is restored (with its children) instead of a fresh one being
    /// minted, so the persisted tree stays reachable by name.
    pub fn new(
        export_id: u64,
        config: &ExportConfig,
        store: Arc<dyn DurableStore>,
        next_inode: Arc<AtomicU64>,
    ) -> BackendResult<Arc<Self>> {
        config.validate()?;
        // Advance the shared allocator past anything this store already
        // records, so a re-attached namespace never hands out an inode
        // number that collides with a resolvable object. The root is the
        // one record that is its own parent.
        let mut root_record = None;
        for (_, bytes) in store.scan_prefix(&[])? {
            if let Ok(record) = bincode::deserialize::<NodeRecord>(&bytes) {
                next_inode.fetch_max(record.ino.as_u64() + 1, Ordering::SeqCst);
                if record.parent == Some(record.ino) && root_record.is_none() {
                    root_record = Some(record);
                }
            }
        }

        let root_ino = match &root_record {
            Some(record) => record.ino,
            None => InodeId::new(next_inode.fetch_add(1, Ordering::SeqCst)),
        };
        let export = Arc::new(Self {
            export_id,
            path: config.path.clone(),
            root: root_ino,
            table: RwLock::new(HandleTable::default()),
            store,
            delay: RwLock::new(config.delay),
            next_inode,
            generation: AtomicU64::new(0),
        });

        match root_record {
            Some(record) => {
                export.table.write().insert(Arc::new(rebuild(record)));
                info!(path = %export.path, root = %root_ino, "export re-attached");
            }
            None => {
                let token = export.make_token(root_ino);
                let root = Arc::new(Handle::new_directory(
                    root_ino,
                    token,
                    "/",
                    root_ino,
                    NodeAttr::new_directory(0, 0, 0o755),
                ));
                export.persist(&root)?;
                export.table.write().insert(root);
                info!(path = %export.path, root = %root_ino, "export created");
            }
        }
        Ok(export)
    }

    /// Inode of this export's root directory.
    pub fn root(&self) -> InodeId {
        self.root
    }

    /// The path naming this export.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Module-assigned export identifier.
    pub fn export_id(&self) -> u64 {
        self.export_id
    }

    /// Current delay-injection policy.
    pub fn delay(&self) -> DelayPolicy {
        *self.delay.read()
    }

    /// Replaces the delay-injection policy (export reconfiguration).
    pub fn set_delay(&self, policy: DelayPolicy) {
        *self.delay.write() = policy;
    }

    /// Number of resident handles, including the root.
    pub fn handle_count(&self) -> usize {
        self.table.read().by_ino.len()
    }

    /// The root handle, acquired for the caller.
    pub fn root_handle(&self) -> BackendResult<Arc<Handle>> {
        let root = self.get(self.root)?;
        root.acquire();
        Ok(root)
    }

    fn alloc_ino(&self) -> InodeId {
        InodeId::new(self.next_inode.fetch_add(1, Ordering::SeqCst))
    }

    fn make_token(&self, ino: InodeId) -> HandleToken {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        HandleToken::from_parts(self.export_id, ino, generation)
    }

    /// Fetches a resident handle without touching its refcount.
    fn get(&self, ino: InodeId) -> BackendResult<Arc<Handle>> {
        self.table
            .read()
            .by_ino
            .get(&ino)
            .cloned()
            .ok_or(BackendError::HandleNotFound(ino))
    }

    /// Looks up `name` in `parent` and returns the child acquired for the
    /// caller. A child that has been evicted is re-resolved from durable
    /// storage through the entry's token.
    pub fn lookup(&self, parent: InodeId, name: &str) -> BackendResult<Arc<Handle>> {
        let dir = self.get(parent)?;
        let state = dir.dir_state()?;
        let entry = {
            let st = state.lock();
            st.index.verify()?;
            st.index
                .find_by_name(name)
                .cloned()
                .ok_or_else(|| BackendError::EntryNotFound {
                    parent,
                    name: name.to_string(),
                })?
        };
        match self.get(entry.child) {
            Ok(child) => {
                child.acquire();
                Ok(child)
            }
            Err(BackendError::HandleNotFound(_)) => {
                let child = self.resolve(entry.token)?;
                // The directory entry owns a reference of its own; restore
                // it alongside the caller's so the reconstructed handle
                // follows the same lifecycle as a created one. A racing
                // lookup may have restored it already.
                if child.add_link(parent, name) {
                    child.acquire();
                }
                Ok(child)
            }
            Err(e) => Err(e),
        }
    }

    /// Creates a child node under `parent` and returns its handle, acquired
    /// for the caller (one reference is held by the directory entry).
    pub fn create_child(
        &self,
        parent: InodeId,
        name: &str,
        node: NewNode,
        attr: NodeAttr,
    ) -> BackendResult<Arc<Handle>> {
        let dir = self.get(parent)?;
        let state = dir.dir_state()?;

        let ino = self.alloc_ino();
        let token = self.make_token(ino);
        let handle = Arc::new(match node {
            NewNode::File => Handle::new_file(ino, token, name, attr),
            NewNode::Directory => Handle::new_directory(ino, token, name, parent, attr),
            NewNode::Symlink { target } => Handle::new_symlink(ino, token, name, target, attr),
            NewNode::Device { class, rdev } => {
                Handle::new_device(ino, token, name, class, rdev, attr)
            }
        });

        self.persist(&handle)?;
        self.table.write().insert(handle.clone());

        let inserted = {
            let mut st = state.lock();
            st.index
                .insert(name, ino, token)
                .and_then(|_| st.index.verify())
        };
        if let Err(e) = inserted {
            // Roll the half-created node back out of the arena and store.
            self.table.write().remove(ino);
            if let Err(cleanup) = self.store.remove(token.as_bytes()) {
                warn!(%ino, error = %cleanup, "rollback of node record failed");
            }
            return Err(e);
        }

        handle.add_link(parent, name);
        dir.with_attrs(|a| a.touch_modified());
        self.persist(&dir)?;
        handle.acquire();
        debug!(%parent, name, %ino, "created {:?}", handle.node_type());
        Ok(handle)
    }

    /// Removes the entry `name` from `parent`, releasing the directory's
    /// reference to the child. The child's store record is deleted once its
    /// persisted link count reaches zero.
    pub fn unlink(&self, parent: InodeId, name: &str) -> BackendResult<()> {
        let dir = self.get(parent)?;
        let state = dir.dir_state()?;

        let entry = {
            let mut st = state.lock();
            st.index.verify()?;
            let entry = st.index.find_by_name(name).cloned().ok_or_else(|| {
                BackendError::EntryNotFound {
                    parent,
                    name: name.to_string(),
                }
            })?;
            // A directory must be empty before its entry goes away. The
            // child's mutex nests inside the parent's; the hierarchy keeps
            // this order acyclic.
            if let Ok(child) = self.get(entry.child) {
                if let Ok(cstate) = child.dir_state() {
                    if cstate.lock().index.count() > 0 {
                        return Err(BackendError::DirectoryNotEmpty(entry.child));
                    }
                }
            }
            st.index.remove(name)?;
            st.index.verify()?;
            entry
        };
        dir.with_attrs(|a| a.touch_modified());
        self.persist(&dir)?;

        let child = match self.get(entry.child) {
            Ok(child) => child,
            Err(BackendError::HandleNotFound(_)) => {
                // Evicted child: adjust its durable record directly.
                let bytes = self
                    .store
                    .get(entry.token.as_bytes())?
                    .ok_or(BackendError::TokenNotFound(entry.token))?;
                let mut record: NodeRecord = bincode::deserialize(&bytes)
                    .map_err(|e| BackendError::Codec(e.to_string()))?;
                record.attr.nlink = record.attr.nlink.saturating_sub(1);
                if record.attr.nlink == 0 || record.node_type == NodeType::Directory {
                    self.store.remove(entry.token.as_bytes())?;
                } else {
                    let bytes = bincode::serialize(&record)
                        .map_err(|e| BackendError::Codec(e.to_string()))?;
                    self.store.put(entry.token.as_bytes().to_vec(), bytes)?;
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // The persisted link count, not the in-memory entry list, decides
        // when the durable record goes away: a reconstructed handle only
        // records the entries it was looked up through.
        let entry_ref_held = child.remove_link(parent, name);
        let nlink = child.with_attrs(|a| {
            a.nlink = a.nlink.saturating_sub(1);
            a.touch_modified();
            a.nlink
        });
        if nlink == 0 || child.node_type() == NodeType::Directory {
            self.store.remove(child.token().as_bytes())?;
        } else {
            self.persist(&child)?;
        }
        if entry_ref_held {
            self.release(&child)?;
        }
        debug!(%parent, name, child = %entry.child, "unlinked");
        Ok(())
    }

    /// Adds a hard link to an existing file under a new parent/name.
    pub fn link(&self, ino: InodeId, new_parent: InodeId, new_name: &str) -> BackendResult<()> {
        let child = self.get(ino)?;
        if child.node_type() == NodeType::Directory {
            return Err(BackendError::NotOpenable(ino));
        }
        let dir = self.get(new_parent)?;
        let state = dir.dir_state()?;
        {
            let mut st = state.lock();
            st.index.insert(new_name, ino, child.token())?;
            st.index.verify()?;
        }
        child.add_link(new_parent, new_name);
        // The new directory entry owns one more reference.
        child.acquire();
        child.with_attrs(|a| {
            a.nlink += 1;
            a.touch_modified();
        });
        dir.with_attrs(|a| a.touch_modified());
        self.persist(&child)?;
        self.persist(&dir)?;
        Ok(())
    }

    /// Paginated directory listing starting at ordinal `position`.
    pub fn readdir(
        &self,
        dir_ino: InodeId,
        position: u64,
        limit: usize,
    ) -> BackendResult<Vec<DirEntry>> {
        let dir = self.get(dir_ino)?;
        let state = dir.dir_state()?;
        let st = state.lock();
        st.index.verify()?;
        Ok(st.index.enumerate_from(position, limit))
    }

    /// Records an open of a regular file, enforcing share reservations.
    pub fn open(&self, ino: InodeId, flags: OpenFlags) -> BackendResult<()> {
        let handle = self.get(ino)?;
        if !handle.node_type().is_openable() {
            return Err(BackendError::NotOpenable(ino));
        }
        let state = handle.file_state()?;
        let mut share = state.lock();
        share.try_open(ino, flags)
    }

    /// Releases a previously recorded open.
    pub fn close(&self, ino: InodeId, flags: OpenFlags) -> BackendResult<()> {
        let handle = self.get(ino)?;
        handle.file_state()?.lock().close(flags);
        Ok(())
    }

    /// Reads a symlink's target.
    pub fn readlink(&self, ino: InodeId) -> BackendResult<String> {
        let handle = self.get(ino)?;
        match handle.kind() {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(BackendError::NotASymlink(ino)),
        }
    }

    /// Current attributes of a resident handle.
    pub fn getattr(&self, ino: InodeId) -> BackendResult<NodeAttr> {
        Ok(self.get(ino)?.attrs())
    }

    /// Replaces a handle's attributes and persists the record.
    pub fn setattr(&self, ino: InodeId, attr: NodeAttr) -> BackendResult<()> {
        let handle = self.get(ino)?;
        handle.set_attrs(attr);
        self.persist(&handle)
    }

    /// Drops one caller-held reference. The handle is retired from the table
    /// when the count reaches zero.
    pub fn release(&self, handle: &Arc<Handle>) -> BackendResult<()> {
        let remaining = handle.release_count()?;
        if remaining == 0 {
            let mut table = self.table.write();
            // A concurrent resolve may have revived the handle between the
            // decrement and this lock; re-check under the write lock.
            if handle.refcount() == 0 {
                table.remove(handle.ino());
                debug!(ino = %handle.ino(), name = handle.name(), "handle retired");
            }
        }
        Ok(())
    }

    /// Resolves a persistent token to a handle, acquired for the caller.
    ///
    /// A non-resident handle is reconstructed from its durable record and
    /// inserted with refcount 1; a resident one is returned as-is with its
    /// refcount incremented.
    pub fn resolve(&self, token: HandleToken) -> BackendResult<Arc<Handle>> {
        {
            let table = self.table.read();
            if let Some(ino) = table.by_token.get(&token) {
                if let Some(handle) = table.by_ino.get(ino) {
                    handle.acquire();
                    return Ok(handle.clone());
                }
            }
        }

        let mut table = self.table.write();
        // Re-check: another resolver may have won the race.
        if let Some(ino) = table.by_token.get(&token).copied() {
            if let Some(handle) = table.by_ino.get(&ino) {
                handle.acquire();
                return Ok(handle.clone());
            }
        }

        let bytes = self
            .store
            .get(token.as_bytes())?
            .ok_or(BackendError::TokenNotFound(token))?;
        let record: NodeRecord =
            bincode::deserialize(&bytes).map_err(|e| BackendError::Codec(e.to_string()))?;
        let handle = Arc::new(rebuild(record));
        table.insert(handle.clone());
        debug!(ino = %handle.ino(), "handle reconstructed from store");
        Ok(handle)
    }

    /// Serializes one handle's record into the durable store.
    fn persist(&self, handle: &Arc<Handle>) -> BackendResult<()> {
        let record = self.record_of(handle);
        let bytes =
            bincode::serialize(&record).map_err(|e| BackendError::Codec(e.to_string()))?;
        self.store.put(handle.token().as_bytes().to_vec(), bytes)?;
        Ok(())
    }

    fn record_of(&self, handle: &Arc<Handle>) -> NodeRecord {
        let (parent, children, symlink_target, rdev) = match handle.kind() {
            NodeKind::Directory(state) => {
                let st = state.lock();
                (Some(st.parent), Some(st.index.snapshot()), None, (0, 0))
            }
            NodeKind::File(_) => (None, None, None, (0, 0)),
            NodeKind::Symlink { target } => (None, None, Some(target.clone()), (0, 0)),
            NodeKind::Device { rdev, .. } => (None, None, None, *rdev),
        };
        NodeRecord {
            ino: handle.ino(),
            token: handle.token(),
            name: handle.name().to_string(),
            node_type: handle.node_type(),
            attr: handle.attrs(),
            parent,
            children,
            symlink_target,
            rdev,
        }
    }

    /// Writes every resident handle's record and flushes the store context.
    pub fn flush(&self) -> BackendResult<()> {
        let handles: Vec<Arc<Handle>> = self.table.read().by_ino.values().cloned().collect();
        for handle in &handles {
            self.persist(handle)?;
        }
        self.store.flush()?;
        info!(path = %self.path, handles = handles.len(), "export flushed");
        Ok(())
    }

    /// Tears the export down: every handle is dropped from the arena and the
    /// store context closed. Refcounts, not traversal order, govern when
    /// backing memory actually goes away (outstanding caller references keep
    /// their `Arc` alive until released).
    pub fn destroy(&self) -> BackendResult<()> {
        let mut table = self.table.write();
        let count = table.by_ino.len();
        for handle in table.by_ino.values() {
            if Arc::strong_count(handle) > 1 {
                warn!(
                    ino = %handle.ino(),
                    name = handle.name(),
                    refcount = handle.refcount(),
                    "destroying export with caller-held handle"
                );
            }
        }
        table.by_ino.clear();
        table.by_token.clear();
        drop(table);
        self.store.close()?;
        info!(path = %self.path, handles = count, "export destroyed");
        Ok(())
    }
}

fn rebuild(record: NodeRecord) -> Handle {
    match record.node_type {
        NodeType::Directory => {
            let parent = record.parent.unwrap_or(record.ino);
            let handle = Handle::new_directory(
                record.ino,
                record.token,
                record.name,
                parent,
                record.attr,
            );
            if let Some((entries, next_pos)) = record.children {
                if let Ok(state) = handle.dir_state() {
                    state.lock().index = DirIndex::restore(record.ino, entries, next_pos);
                }
            }
            handle
        }
        NodeType::RegularFile => {
            Handle::new_file(record.ino, record.token, record.name, record.attr)
        }
        NodeType::Symlink => Handle::new_symlink(
            record.ino,
            record.token,
            record.name,
            record.symlink_target.unwrap_or_default(),
            record.attr,
        ),
        class => Handle::new_device(
            record.ino,
            record.token,
            record.name,
            class,
            record.rdev,
            record.attr,
        ),
    }
}
