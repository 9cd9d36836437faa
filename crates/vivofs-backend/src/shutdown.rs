//! Termination and teardown coordination.
//!
//! The host signals termination at most once per process, but several paths
//! can race to deliver it (signal handler, host shutdown call, final
//! teardown). The coordinator collapses them: whichever path arrives first
//! flushes every export to durable storage and runs the registered
//! termination hooks, and every later arrival is a no-op.
//!
//! Final teardown additionally drains the worker pool, destroys the exports,
//! and asks the host to unregister the module. A refused unregistration is
//! reported but never turned into process termination; by that point the
//! data is already safe on durable media.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::module::{HostRuntime, VivoFs, MODULE_NAME};
use crate::types::{BackendError, BackendResult};

/// How long teardown waits for the worker pool to drain before forcing
/// cancellation.
pub const POOL_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// A named callback run once at termination, after exports are flushed.
struct Hook {
    name: String,
    run: Box<dyn FnOnce() + Send>,
}

/// Collapses racing termination paths into one flush-and-hooks pass.
pub struct ShutdownCoordinator {
    module: Arc<VivoFs>,
    hooks: Mutex<Vec<Hook>>,
    terminated: AtomicBool,
}

impl ShutdownCoordinator {
    /// Creates a coordinator for the given module context.
    pub fn new(module: Arc<VivoFs>) -> Self {
        Self {
            module,
            hooks: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Registers a callback to run once at termination.
    ///
    /// Hooks run in registration order, after every export has been flushed.
    /// Registering after termination has already run is accepted but the
    /// hook will never fire.
    pub fn register_hook(&self, name: impl Into<String>, run: impl FnOnce() + Send + 'static) {
        let name = name.into();
        if self.terminated.load(Ordering::SeqCst) {
            warn!(hook = %name, "hook registered after termination, will not run");
        }
        self.hooks.lock().push(Hook {
            name,
            run: Box::new(run),
        });
    }

    /// Whether termination has already run.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Runs the termination pass: flush every export, then run the hooks.
    ///
    /// Exactly one caller performs the work; returns `false` for every
    /// arrival after the first. Safe to call from any thread.
    pub fn run_termination(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("termination: flushing all exports");
        self.module.flush_all();

        let hooks: Vec<Hook> = {
            let mut guard = self.hooks.lock();
            guard.drain(..).collect()
        };
        for hook in hooks {
            info!(hook = %hook.name, "running termination hook");
            (hook.run)();
        }
        true
    }

    /// Full teardown: termination pass, pool drain, export destruction, and
    /// host unregistration.
    ///
    /// A missed pool deadline forces cancellation and teardown continues. A
    /// refused unregistration surfaces as `UnregisterFailed` so the caller
    /// can report it, but everything destructive has already completed by
    /// then and the error must not be escalated.
    pub fn teardown(&self, host: &dyn HostRuntime) -> BackendResult<()> {
        self.run_termination();

        match self.module.stop_pool(POOL_DRAIN_TIMEOUT) {
            Ok(()) => {}
            Err(BackendError::ShutdownTimeout { pending_workers }) => {
                error!(pending_workers, "pool drain timed out, workers cancelled");
            }
            Err(e) => return Err(e),
        }

        self.module.destroy_all();

        if let Err(reason) = host.unregister(MODULE_NAME) {
            error!(%reason, "host refused to unregister module");
            return Err(BackendError::UnregisterFailed { reason });
        }
        info!("module torn down");
        Ok(())
    }
}
