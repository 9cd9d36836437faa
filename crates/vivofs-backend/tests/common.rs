//! Common test utilities and fixtures for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Once;

use vivofs_backend::{ExportConfig, HostRuntime, ModuleConfig, VivoFs, MODULE_NAME};
use vivofs_store::{DurableStore, MemoryStore, StoreError, StoreResult};

static TRACING: Once = Once::new();

/// Installs a test subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A configured module with a set of exports, each backed by its own
/// in-memory store. Stores are kept so tests can inspect flush counts and
/// re-attach exports against surviving data.
pub struct TestModule {
    pub module: Arc<VivoFs>,
    pub stores: Vec<Arc<MemoryStore>>,
    pub export_ids: Vec<u64>,
}

impl TestModule {
    /// A module with default configuration and `exports` attached exports
    /// at paths `/vol0`, `/vol1`, ...
    pub fn new(exports: usize) -> Self {
        Self::with_config(exports, ModuleConfig::default())
    }

    /// Same, with explicit module configuration.
    pub fn with_config(exports: usize, config: ModuleConfig) -> Self {
        init_tracing();
        let module = Arc::new(VivoFs::new());
        module.init_config(config).unwrap();

        let mut stores = Vec::new();
        let mut export_ids = Vec::new();
        for i in 0..exports {
            let store = Arc::new(MemoryStore::new());
            let export = module
                .create_export(&ExportConfig::new(format!("/vol{i}")), store.clone())
                .unwrap();
            export_ids.push(export.export_id());
            stores.push(store);
        }
        Self {
            module,
            stores,
            export_ids,
        }
    }

    /// The i-th attached export.
    pub fn export(&self, i: usize) -> Arc<vivofs_backend::Export> {
        self.module.export(self.export_ids[i]).unwrap()
    }
}

/// Host stub that counts unregistrations and can be told to refuse them.
pub struct TestHost {
    refuse: bool,
    unregistered: AtomicUsize,
}

impl TestHost {
    pub fn new() -> Self {
        Self {
            refuse: false,
            unregistered: AtomicUsize::new(0),
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            unregistered: AtomicUsize::new(0),
        }
    }

    pub fn unregister_count(&self) -> usize {
        self.unregistered.load(Ordering::SeqCst)
    }
}

impl HostRuntime for TestHost {
    fn unregister(&self, module: &str) -> Result<(), String> {
        assert_eq!(module, MODULE_NAME);
        if self.refuse {
            return Err("host refused".into());
        }
        self.unregistered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Store wrapper whose flush fails on demand, for exercising partial-failure
/// paths in the shutdown protocol.
pub struct FailingFlushStore {
    inner: MemoryStore,
}

impl FailingFlushStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
        }
    }
}

impl DurableStore for FailingFlushStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()> {
        self.inner.put(key, value)
    }

    fn remove(&self, key: &[u8]) -> StoreResult<()> {
        self.inner.remove(key)
    }

    fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        self.inner.contains(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }

    fn flush(&self) -> StoreResult<()> {
        Err(StoreError::FlushFailed {
            reason: "injected flush failure".into(),
        })
    }

    fn close(&self) -> StoreResult<()> {
        self.inner.close()
    }
}
