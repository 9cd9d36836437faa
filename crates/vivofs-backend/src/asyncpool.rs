//! Async worker pool for deferred background work.
//!
//! One pool serves every export of the module. Lifecycle is
//! `Uninitialized -> Running -> Stopping -> Stopped`, with a deliberate
//! "async disabled" mode: a pool initialized with zero workers stays
//! `Uninitialized` forever and treats every later call as a no-op success.
//!
//! Shutdown is two-phase: workers are asked to drain the queue and exit, and
//! whatever has not exited by the deadline is cancelled best-effort (the
//! queue is discarded and the threads are abandoned to finish their in-flight
//! task on their own time).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{DelayMode, DelayPolicy};
use crate::types::{BackendError, BackendResult};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle state of the worker pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// Never started (or async disabled with zero workers).
    Uninitialized,
    /// Workers are accepting and executing tasks.
    Running,
    /// Draining: no new tasks accepted, queued work still runs.
    Stopping,
    /// All workers exited or were abandoned.
    Stopped,
}

struct Inner {
    state: PoolState,
    queue: VecDeque<Task>,
    live_workers: usize,
    cancelled: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Wakes workers for new tasks or a state change.
    work_cv: Condvar,
    /// Wakes the shutdown waiter as workers exit.
    done_cv: Condvar,
}

/// Resizable pool of background workers shared by all exports.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    forced_cancels: AtomicU64,
}

impl WorkerPool {
    /// Creates a pool in the `Uninitialized` state.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: PoolState::Uninitialized,
                    queue: VecDeque::new(),
                    live_workers: 0,
                    cancelled: false,
                }),
                work_cv: Condvar::new(),
                done_cv: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
            forced_cancels: AtomicU64::new(0),
        }
    }

    /// Spawns `max_threads` workers and transitions to `Running`.
    ///
    /// With `max_threads == 0` the pool stays `Uninitialized` permanently and
    /// every later operation is a guaranteed no-op success. A second `init`
    /// on a running pool is also a no-op. If no worker thread can be spawned
    /// at all, the pool stays `Uninitialized` and the caller is expected to
    /// continue in degraded synchronous mode.
    pub fn init(&self, min_threads: u32, max_threads: u32) -> BackendResult<()> {
        if max_threads == 0 {
            info!("async worker pool disabled (zero threads configured)");
            return Ok(());
        }
        if min_threads > max_threads {
            return Err(BackendError::ConfigInvalid {
                field: "min_threads",
                reason: format!("{min_threads} exceeds max_threads {max_threads}"),
            });
        }

        let mut inner = self.shared.inner.lock();
        if inner.state != PoolState::Uninitialized {
            return Ok(());
        }

        let mut handles = self.handles.lock();
        let mut spawn_err = None;
        for i in 0..max_threads {
            let shared = self.shared.clone();
            match std::thread::Builder::new()
                .name(format!("vivofs-async-{i}"))
                .spawn(move || worker_loop(shared))
            {
                Ok(handle) => {
                    handles.push(handle);
                    inner.live_workers += 1;
                }
                Err(e) => {
                    spawn_err = Some(e);
                    break;
                }
            }
        }

        if inner.live_workers == 0 {
            let reason = match spawn_err {
                Some(e) => format!("unable to spawn any worker thread: {e}"),
                None => "unable to spawn any worker thread".into(),
            };
            warn!(%reason, "async worker pool unavailable, continuing synchronously");
            return Err(BackendError::ResourceExhausted { reason });
        }
        if let Some(e) = spawn_err {
            warn!(
                spawned = inner.live_workers,
                requested = max_threads,
                error = %e,
                "worker pool started short-handed"
            );
        }
        inner.state = PoolState::Running;
        info!(workers = inner.live_workers, "async worker pool running");
        Ok(())
    }

    /// Enqueues a task for asynchronous execution.
    ///
    /// Valid only while `Running`. In disabled mode this succeeds without
    /// executing anything; once stopping or stopped the task is dropped and
    /// the caller notified.
    pub fn submit(&self, task: Task) -> BackendResult<()> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            PoolState::Uninitialized => Ok(()),
            PoolState::Running => {
                inner.queue.push_back(task);
                self.shared.work_cv.notify_one();
                Ok(())
            }
            state @ (PoolState::Stopping | PoolState::Stopped) => {
                Err(BackendError::PoolNotRunning(state))
            }
        }
    }

    /// Runs `task` under the export's delay policy: inline, or deferred
    /// through the pool with the configured simulated latency.
    ///
    /// Falls back to inline execution when the pool cannot accept work.
    pub fn dispatch(&self, policy: DelayPolicy, task: Task) {
        let deferred_delay = match policy.mode {
            DelayMode::Inline => None,
            DelayMode::RandomOrInline => {
                if rand::thread_rng().gen_bool(0.5) {
                    None
                } else {
                    Some(rand::thread_rng().gen_range(0..=policy.delay_ms))
                }
            }
            DelayMode::Random => Some(rand::thread_rng().gen_range(0..=policy.delay_ms)),
            DelayMode::Fixed => Some(policy.delay_ms),
        };

        // Disabled or stopping pools degrade to synchronous execution
        // without the injected latency.
        let pool_running = self.shared.inner.lock().state == PoolState::Running;
        let Some(delay_ms) = deferred_delay.filter(|_| pool_running) else {
            task();
            return;
        };

        let stall_ms = policy.stall_ms;
        let wrapped: Task = Box::new(move || {
            if delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(delay_ms as u64));
            }
            task();
            if stall_ms > 0 {
                std::thread::sleep(Duration::from_millis(stall_ms as u64));
            }
        });

        if let Err(e) = self.submit(wrapped) {
            debug!(error = %e, "deferred dispatch raced shutdown, task dropped");
        }
    }

    /// Stops the pool: drains queued work, waits up to `timeout`, then
    /// forcibly cancels whatever has not exited.
    ///
    /// A pool that was never initialized treats shutdown as an immediate
    /// success, as does one already stopped. Returns `ShutdownTimeout` after
    /// forcing the `Stopped` state when the deadline was missed.
    pub fn shutdown(&self, timeout: Duration) -> BackendResult<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        match inner.state {
            PoolState::Uninitialized | PoolState::Stopped => return Ok(()),
            PoolState::Running => {
                inner.state = PoolState::Stopping;
                debug!(queued = inner.queue.len(), "worker pool stopping");
                self.shared.work_cv.notify_all();
            }
            PoolState::Stopping => {}
        }

        while inner.live_workers > 0 {
            if self
                .shared
                .done_cv
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                break;
            }
        }

        if inner.live_workers > 0 {
            let pending_workers = inner.live_workers;
            inner.cancelled = true;
            inner.queue.clear();
            inner.state = PoolState::Stopped;
            self.shared.work_cv.notify_all();
            drop(inner);
            self.forced_cancels.fetch_add(1, Ordering::SeqCst);
            // Abandon the handles; the stuck workers will observe the cancel
            // flag whenever their in-flight task returns.
            self.handles.lock().clear();
            warn!(pending_workers, "shutdown timed out, cancelling workers");
            return Err(BackendError::ShutdownTimeout { pending_workers });
        }

        inner.state = PoolState::Stopped;
        drop(inner);
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
        info!("async worker pool stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.shared.inner.lock().state
    }

    /// Number of tasks waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Number of workers that have not exited.
    pub fn live_workers(&self) -> usize {
        self.shared.inner.lock().live_workers
    }

    /// How many times forced cancellation has fired.
    pub fn forced_cancellations(&self) -> u64 {
        self.forced_cancels.load(Ordering::SeqCst)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut inner = shared.inner.lock();
    loop {
        if inner.cancelled {
            break;
        }
        if let Some(task) = inner.queue.pop_front() {
            drop(inner);
            task();
            inner = shared.inner.lock();
            continue;
        }
        match inner.state {
            PoolState::Running => shared.work_cv.wait(&mut inner),
            _ => break,
        }
    }
    inner.live_workers -= 1;
    shared.done_cv.notify_all();
}
