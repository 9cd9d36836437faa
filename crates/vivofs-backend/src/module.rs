//! Module context: configuration, export registry, and the shared allocator.
//!
//! One `VivoFs` instance lives for the whole process. The host configures it
//! once, then attaches and detaches exports as mounts come and go. All
//! exports draw inode numbers from the module-wide allocator and share the
//! module's worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use vivofs_store::DurableStore;

use crate::asyncpool::WorkerPool;
use crate::config::{ExportConfig, ModuleConfig};
use crate::export::Export;
use crate::types::{BackendError, BackendResult, InodeId};

/// Name under which the module registers with its host.
pub const MODULE_NAME: &str = "vivofs";

/// Hooks into the process hosting the module.
///
/// The host owns registration; the module only ever asks to be let go at
/// final teardown.
pub trait HostRuntime: Send + Sync {
    /// Unregisters the named module from the host.
    fn unregister(&self, module: &str) -> Result<(), String>;
}

/// The module context: committed configuration, live exports, worker pool.
pub struct VivoFs {
    config: RwLock<Option<ModuleConfig>>,
    exports: RwLock<HashMap<u64, Arc<Export>>>,
    next_export_id: AtomicU64,
    /// Inode allocator shared by every export.
    next_inode: Arc<AtomicU64>,
    pool: Arc<WorkerPool>,
}

impl VivoFs {
    /// Creates an unconfigured module context.
    pub fn new() -> Self {
        Self {
            config: RwLock::new(None),
            exports: RwLock::new(HashMap::new()),
            next_export_id: AtomicU64::new(1),
            next_inode: Arc::new(AtomicU64::new(InodeId::FIRST.as_u64())),
            pool: Arc::new(WorkerPool::new()),
        }
    }

    /// Commits the module configuration and starts the worker pool.
    ///
    /// Failure to spawn workers is not fatal: the module continues with
    /// deferred work executing synchronously.
    pub fn init_config(&self, config: ModuleConfig) -> BackendResult<()> {
        config.validate()?;
        match self.pool.init(1, config.async_threads) {
            Ok(()) => {}
            Err(BackendError::ResourceExhausted { reason }) => {
                warn!(%reason, "running without async workers");
            }
            Err(e) => return Err(e),
        }
        info!(
            inode_size = config.inode_size,
            async_threads = config.async_threads,
            up_interval = config.up_interval,
            whence_is_name = config.whence_is_name,
            "module configured"
        );
        *self.config.write() = Some(config);
        Ok(())
    }

    /// The committed configuration, or `NotConfigured`.
    pub fn config(&self) -> BackendResult<ModuleConfig> {
        self.config.read().clone().ok_or(BackendError::NotConfigured)
    }

    /// The shared worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Attaches a new export backed by the given durable store context.
    pub fn create_export(
        &self,
        config: &ExportConfig,
        store: Arc<dyn DurableStore>,
    ) -> BackendResult<Arc<Export>> {
        if self.config.read().is_none() {
            return Err(BackendError::NotConfigured);
        }
        let export_id = self.next_export_id.fetch_add(1, Ordering::SeqCst);
        let export = Export::new(export_id, config, store, self.next_inode.clone())?;
        self.exports.write().insert(export_id, export.clone());
        Ok(export)
    }

    /// Applies new settings to a live export. Only the delay policy can
    /// change after attach; the path is fixed for the export's lifetime.
    pub fn update_export(&self, export_id: u64, config: &ExportConfig) -> BackendResult<()> {
        config.validate()?;
        let export = self
            .export(export_id)
            .ok_or(BackendError::ExportNotFound(export_id))?;
        export.set_delay(config.delay);
        info!(
            export_id,
            mode = config.delay.mode.as_str(),
            delay_ms = config.delay.delay_ms,
            "export delay policy updated"
        );
        Ok(())
    }

    /// Detaches an export: flushed, destroyed, and removed from the registry.
    pub fn detach_export(&self, export_id: u64) -> BackendResult<()> {
        let export = self
            .exports
            .write()
            .remove(&export_id)
            .ok_or(BackendError::ExportNotFound(export_id))?;
        export.flush()?;
        export.destroy()?;
        info!(export_id, path = export.path(), "export detached");
        Ok(())
    }

    /// Looks up a live export by identifier.
    pub fn export(&self, export_id: u64) -> Option<Arc<Export>> {
        self.exports.read().get(&export_id).cloned()
    }

    /// Number of currently attached exports.
    pub fn export_count(&self) -> usize {
        self.exports.read().len()
    }

    /// Snapshot of all live exports.
    pub fn exports(&self) -> Vec<Arc<Export>> {
        self.exports.read().values().cloned().collect()
    }

    /// Flushes every attached export, continuing past individual failures.
    ///
    /// Returns the number of exports flushed successfully. A failing export
    /// is reported and skipped so the remaining exports still reach durable
    /// storage.
    pub fn flush_all(&self) -> usize {
        let exports = self.exports();
        let mut flushed = 0;
        for export in &exports {
            match export.flush() {
                Ok(()) => flushed += 1,
                Err(e) => {
                    error!(
                        export_id = export.export_id(),
                        path = export.path(),
                        error = %e,
                        "export flush failed"
                    );
                }
            }
        }
        info!(flushed, total = exports.len(), "all exports flushed");
        flushed
    }

    /// Destroys every attached export without flushing (callers flush first
    /// via [`flush_all`](Self::flush_all)).
    pub fn destroy_all(&self) {
        let exports: Vec<Arc<Export>> = self.exports.write().drain().map(|(_, e)| e).collect();
        for export in exports {
            if let Err(e) = export.destroy() {
                error!(
                    export_id = export.export_id(),
                    path = export.path(),
                    error = %e,
                    "export destroy failed"
                );
            }
        }
    }

    /// Stops the worker pool, waiting up to `timeout` for graceful drain.
    pub fn stop_pool(&self, timeout: Duration) -> BackendResult<()> {
        self.pool.shutdown(timeout)
    }
}

impl Default for VivoFs {
    fn default() -> Self {
        Self::new()
    }
}
