//! Pool of interactive CLI workers.
//!
//! Idle workers wait in a FIFO queue. A fair semaphore with one permit per
//! idle worker orders waiters, so requests are served in arrival order.
//! Checking a worker out returns a [`PooledWorker`] guard that puts the
//! worker back when dropped, whatever the outcome of the request.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::process::Worker;
use super::spawn::WorkerSpec;
use crate::error::{RelayError, Result};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of CLI processes to keep.
    pub size: usize,
    /// How to launch each process.
    pub spec: WorkerSpec,
    /// How long `acquire` waits for an idle worker.
    pub acquire_timeout: Duration,
    /// Replace workers whose process died instead of dropping them.
    pub respawn: bool,
}

impl WorkerPoolConfig {
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            size: 2,
            spec,
            acquire_timeout: Duration::from_secs(30),
            respawn: true,
        }
    }
}

/// State shared between the pool and its outstanding guards.
struct Shared {
    capacity: usize,
    respawn: bool,
    /// Idle workers, oldest first.
    idle: Mutex<VecDeque<Worker>>,
    /// One permit per idle worker.
    permits: Semaphore,
    /// Checked-out workers by ID, for signalling on shutdown.
    checked_out: Mutex<HashMap<usize, Option<Pid>>>,
    /// Workers the pool still owns: idle, checked out or respawning.
    live: AtomicUsize,
    commands_completed: AtomicUsize,
    restarts: AtomicUsize,
    discarded: AtomicUsize,
    closed: AtomicBool,
}

/// Lock a mutex, ignoring poisoning.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Make a ready worker available to the next waiter.
    fn push_idle(&self, mut worker: Worker) {
        if self.closed.load(Ordering::Acquire) {
            self.retire(worker);
            return;
        }
        worker.recover();
        lock(&self.idle).push_back(worker);
        self.permits.add_permits(1);
    }

    /// Drop a worker for good. Its child is killed on drop.
    fn retire(&self, worker: Worker) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        debug!(worker_id = worker.id(), "worker retired");
    }

    /// Handle a worker coming back from a guard.
    fn check_in(self: &Arc<Self>, mut worker: Worker, commands_at_checkout: usize) {
        lock(&self.checked_out).remove(&worker.id());
        self.commands_completed.fetch_add(
            worker.commands_completed().saturating_sub(commands_at_checkout),
            Ordering::Relaxed,
        );

        if self.closed.load(Ordering::Acquire) {
            self.retire(worker);
            return;
        }

        worker.recover();
        if worker.is_ready() {
            self.push_idle(worker);
            return;
        }

        let reason = worker.termination_reason();
        let runtime = tokio::runtime::Handle::try_current();
        match runtime {
            Ok(handle) if self.respawn => {
                warn!(worker_id = worker.id(), reason = %reason, "worker died, respawning");
                self.restarts.fetch_add(1, Ordering::Relaxed);
                let shared = Arc::clone(self);
                handle.spawn(async move {
                    match worker.restart().await {
                        Ok(()) => {
                            info!(worker_id = worker.id(), restarts = worker.restarts(), "worker respawned");
                            shared.push_idle(worker);
                        }
                        Err(e) => {
                            warn!(worker_id = worker.id(), error = %e, "worker respawn failed");
                            shared.discarded.fetch_add(1, Ordering::Relaxed);
                            shared.retire(worker);
                        }
                    }
                });
            }
            _ => {
                warn!(worker_id = worker.id(), reason = %reason, "worker died, discarding");
                self.discarded.fetch_add(1, Ordering::Relaxed);
                self.retire(worker);
            }
        }
    }
}

/// A pool of interactive CLI workers.
///
/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
    acquire_timeout: Duration,
}

impl WorkerPool {
    /// Start `config.size` workers concurrently.
    ///
    /// Partial failure is tolerated: the pool runs with whatever started.
    /// Fails only when no worker could be started.
    pub async fn initialize(config: WorkerPoolConfig) -> Result<Self> {
        let spec = config.spec.clone();
        Self::initialize_with(config, move |_| spec.clone()).await
    }

    /// Like [`WorkerPool::initialize`], with the launch spec chosen per worker ID.
    ///
    /// `config.spec` is only used for logging.
    pub async fn initialize_with<F>(config: WorkerPoolConfig, spec_for: F) -> Result<Self>
    where
        F: Fn(usize) -> WorkerSpec,
    {
        let capacity = config.size.max(1);
        info!(
            workers = capacity,
            program = %config.spec.program,
            respawn = config.respawn,
            "Initializing worker pool"
        );

        let shared = Arc::new(Shared {
            capacity,
            respawn: config.respawn,
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            permits: Semaphore::new(0),
            checked_out: Mutex::new(HashMap::new()),
            live: AtomicUsize::new(0),
            commands_completed: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let starts = (0..capacity).map(|id| {
            let shared = Arc::clone(&shared);
            let spec = spec_for(id);
            async move {
                let mut worker = Worker::new(id, spec);
                match worker.start().await {
                    Ok(()) => {
                        shared.live.fetch_add(1, Ordering::AcqRel);
                        shared.push_idle(worker);
                        true
                    }
                    Err(e) => {
                        warn!(worker_id = id, error = %e, "worker failed to start");
                        false
                    }
                }
            }
        });
        let started = futures::future::join_all(starts)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        if started == 0 {
            return Err(RelayError::PoolInitialization {
                attempted: capacity,
            });
        }
        if started < capacity {
            warn!(
                started,
                requested = capacity,
                "worker pool running below capacity"
            );
        } else {
            info!(workers = started, "All workers ready");
        }

        Ok(Self {
            shared,
            acquire_timeout: config.acquire_timeout,
        })
    }

    /// Check out an idle worker, waiting up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledWorker> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Check out an idle worker, waiting up to `timeout`.
    ///
    /// Waiters are served in FIFO order. A checked-out worker keeps
    /// [`WorkerState::Idle`](super::WorkerState::Idle) between commands and
    /// is `Busy` only while one runs; being checked out is tracked by the
    /// pool (see [`WorkerPoolStats::checked_out`]) and by the guard itself.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<PooledWorker> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RelayError::PoolShutdown);
        }

        let permit = match tokio::time::timeout(timeout, self.shared.permits.acquire()).await {
            Err(_) => return Err(RelayError::AcquireTimeout(timeout)),
            Ok(Err(_)) => return Err(RelayError::PoolShutdown),
            Ok(Ok(permit)) => permit,
        };
        // The permit is returned by `push_idle` when the worker comes back.
        permit.forget();

        let worker = lock(&self.shared.idle)
            .pop_front()
            .ok_or(RelayError::PoolShutdown)?;
        lock(&self.shared.checked_out).insert(worker.id(), worker.pid());
        debug!(worker_id = worker.id(), "worker checked out");

        Ok(PooledWorker {
            commands_at_checkout: worker.commands_completed(),
            worker: Some(worker),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Return a worker to the pool. Equivalent to dropping the guard.
    pub fn release(&self, worker: PooledWorker) {
        drop(worker);
    }

    /// Stop every worker and refuse further acquisitions.
    ///
    /// Idle workers are stopped in place. Checked-out workers get SIGTERM
    /// and are retired when their guard is dropped.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.permits.close();

        let idle: Vec<Worker> = lock(&self.shared.idle).drain(..).collect();
        let busy: Vec<(usize, Option<Pid>)> = lock(&self.shared.checked_out)
            .iter()
            .map(|(id, pid)| (*id, *pid))
            .collect();

        info!(
            idle = idle.len(),
            checked_out = busy.len(),
            "Shutting down worker pool"
        );

        for (id, pid) in busy {
            if let Some(pid) = pid
                && let Err(e) = signal::kill(pid, Signal::SIGTERM)
            {
                debug!(worker_id = id, error = %e, "SIGTERM to checked-out worker failed");
            }
        }

        let stops = idle.into_iter().map(|mut worker| async move {
            worker.stop().await;
            worker
        });
        for worker in futures::future::join_all(stops).await {
            self.shared.retire(worker);
        }
    }

    /// Whether `shutdown` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Get statistics about the worker pool.
    pub fn stats(&self) -> WorkerPoolStats {
        let idle = lock(&self.shared.idle).len();
        let checked_out = lock(&self.shared.checked_out).len();
        WorkerPoolStats {
            capacity: self.shared.capacity,
            live: self.shared.live.load(Ordering::Acquire),
            idle,
            checked_out,
            commands_completed: self.shared.commands_completed.load(Ordering::Relaxed),
            restarts: self.shared.restarts.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Configured number of workers.
    pub capacity: usize,
    /// Workers that still exist (idle, checked out or respawning).
    pub live: usize,
    /// Workers waiting for a request.
    pub idle: usize,
    /// Workers currently serving a request.
    pub checked_out: usize,
    /// Commands completed by workers returned to the pool.
    pub commands_completed: usize,
    /// Number of dead workers that were respawned.
    pub restarts: usize,
    /// Number of workers dropped for good.
    pub discarded: usize,
}

/// A worker checked out of the pool. Returns it on drop.
pub struct PooledWorker {
    worker: Option<Worker>,
    shared: Arc<Shared>,
    commands_at_checkout: usize,
}

impl PooledWorker {
    /// Return the worker to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledWorker {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        self.worker.as_ref().expect("worker is present until drop")
    }
}

impl DerefMut for PooledWorker {
    fn deref_mut(&mut self) -> &mut Worker {
        self.worker.as_mut().expect("worker is present until drop")
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!(worker_id = worker.id(), "worker checked in");
            self.shared.check_in(worker, self.commands_at_checkout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;
    use crate::worker::test_support::fake_repl_spec;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn config(size: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            size,
            acquire_timeout: Duration::from_secs(5),
            ..WorkerPoolConfig::new(fake_repl_spec())
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = WorkerPoolConfig::new(WorkerSpec::new("gemini"));
        assert_eq!(config.size, 2);
        assert!(config.respawn);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_initialize_and_stats() {
        let pool = WorkerPool::initialize(config(2)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.checked_out, 0);
        pool.shutdown().await;
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn test_initialize_fails_when_nothing_starts() {
        let config = WorkerPoolConfig {
            size: 2,
            ..WorkerPoolConfig::new(WorkerSpec::new("/nonexistent/clirelay-cli"))
        };
        let err = WorkerPool::initialize(config).await.err().unwrap();
        assert!(matches!(err, RelayError::PoolInitialization { attempted: 2 }));
    }

    #[tokio::test]
    async fn test_partial_startup_runs_below_capacity() {
        let pool = WorkerPool::initialize_with(config(3), |id| {
            if id == 0 {
                fake_repl_spec()
            } else {
                WorkerSpec::new("/nonexistent/clirelay-cli")
            }
        })
        .await
        .unwrap();

        let stats = pool.stats();
        assert_eq!(stats.capacity, 3);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.idle, 1);

        let mut worker = pool.acquire().await.unwrap();
        let output = worker.execute("hello", TIMEOUT).await.unwrap();
        assert!(output.stdout.contains("reply: hello"));

        // The one live worker is out, so nobody else gets served.
        let err = pool
            .acquire_within(Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::AcquireTimeout(_)));
        drop(worker);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = WorkerPool::initialize(config(1)).await.unwrap();
        {
            let mut worker = pool.acquire().await.unwrap();
            assert_eq!(pool.stats().idle, 0);
            assert_eq!(pool.stats().checked_out, 1);
            assert_eq!(worker.state(), WorkerState::Idle);
            let output = worker.execute("hello", TIMEOUT).await.unwrap();
            assert!(output.stdout.contains("reply: hello"));
        }
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.commands_completed, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_timeout_when_exhausted() {
        let pool = WorkerPool::initialize(config(1)).await.unwrap();
        let held = pool.acquire().await.unwrap();
        let err = pool
            .acquire_within(Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::AcquireTimeout(_)));
        pool.release(held);
        assert!(pool.acquire_within(Duration::from_secs(1)).await.is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_request_waits_for_first_release() {
        let pool = WorkerPool::initialize(config(1)).await.unwrap();
        let mut first = pool.acquire().await.unwrap();

        let second = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut worker = pool.acquire_within(TIMEOUT).await.unwrap();
                let acquired = std::time::Instant::now();
                worker.execute("sleep 1", TIMEOUT).await.unwrap();
                acquired
            })
        };

        first.execute("sleep 1", TIMEOUT).await.unwrap();
        assert!(!second.is_finished());
        let released = std::time::Instant::now();
        drop(first);

        let acquired = second.await.unwrap();
        assert!(acquired >= released);
        assert!(acquired - released < Duration::from_millis(500));
        assert_eq!(pool.stats().commands_completed, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_returned_when_holder_panics() {
        let pool = WorkerPool::initialize(config(1)).await.unwrap();

        let holder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut worker = pool.acquire().await.unwrap();
                worker.execute("before panic", TIMEOUT).await.unwrap();
                panic!("request handler blew up");
            })
        };
        assert!(holder.await.unwrap_err().is_panic());

        assert_eq!(pool.stats().idle, 1);
        let mut worker = pool.acquire_within(Duration::from_secs(1)).await.unwrap();
        let output = worker.execute("after panic", TIMEOUT).await.unwrap();
        assert!(output.stdout.contains("reply: after panic"));
        drop(worker);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiters_resume_on_release() {
        let pool = WorkerPool::initialize(config(1)).await.unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut worker = pool.acquire().await.unwrap();
                worker.execute("queued", TIMEOUT).await.unwrap().stdout
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let stdout = waiter.await.unwrap();
        assert!(stdout.contains("reply: queued"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_distinct_workers() {
        let pool = WorkerPool::initialize(config(2)).await.unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_worker_is_respawned() {
        let pool = WorkerPool::initialize(config(1)).await.unwrap();
        {
            let mut worker = pool.acquire().await.unwrap();
            let err = worker.execute("exit", TIMEOUT).await.unwrap_err();
            assert!(err.is_fatal_to_worker());
        }
        // Respawn happens in the background; acquire waits for it.
        let mut worker = pool.acquire().await.unwrap();
        let output = worker.execute("hello", TIMEOUT).await.unwrap();
        assert!(output.stdout.contains("reply: hello"));
        drop(worker);

        let stats = pool.stats();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.live, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_worker_discarded_without_respawn() {
        let pool = WorkerPool::initialize(WorkerPoolConfig {
            respawn: false,
            ..config(1)
        })
        .await
        .unwrap();
        {
            let mut worker = pool.acquire().await.unwrap();
            assert!(worker.execute("exit", TIMEOUT).await.is_err());
        }
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.discarded, 1);
        let err = pool
            .acquire_within(Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::AcquireTimeout(_)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_timed_out_worker_is_returned() {
        let pool = WorkerPool::initialize(config(1)).await.unwrap();
        {
            let mut worker = pool.acquire().await.unwrap();
            let err = worker
                .execute("sleep 1", Duration::from_millis(200))
                .await
                .unwrap_err();
            assert!(err.is_timeout());
        }
        assert_eq!(pool.stats().idle, 1);
        let mut worker = pool.acquire().await.unwrap();
        let output = worker.execute("next", TIMEOUT).await.unwrap();
        assert!(output.stdout.contains("reply: next"));
        assert!(!output.stdout.contains("woke"));
        drop(worker);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let pool = WorkerPool::initialize(config(1)).await.unwrap();
        pool.shutdown().await;
        assert!(pool.is_closed());
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, RelayError::PoolShutdown));
        // Second shutdown is a no-op.
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_checked_out_worker() {
        let pool = WorkerPool::initialize(config(2)).await.unwrap();
        let held = pool.acquire().await.unwrap();
        pool.shutdown().await;
        assert_eq!(pool.stats().live, 1);
        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.idle, 0);
    }
}
