//! # Worker Pool Module
//!
//! A fixed set of [`Worker`]s fed through two bounded queues:
//!
//! - **Availability queue** (capacity N): intake handles of idle workers
//! - **Backlog queue** (capacity M): jobs waiting for a worker
//!
//! A single dispatch coroutine pairs them up, FIFO on both sides.
//!
//! ## Backpressure
//!
//! [`WorkerPool::dispatch`] blocks while the backlog is full. That is the only
//! admission control: nothing is dropped and nothing grows without bound. The
//! dispatch loop waits for an idle worker *before* taking a job off the
//! backlog, so with every worker busy the backlog holds exactly M jobs and the
//! (M+1)-th submitter blocks.
//!
//! ## Shutdown
//!
//! [`WorkerPool::stop`] is fire-and-forget. It marks the pool as shutting down
//! and closes both queues; from then on `dispatch` fails with
//! [`PoolError::ShuttingDown`]. The dispatch loop then:
//!
//! 1. rejects every job still in the backlog (waiters get [`PoolError::Rejected`])
//! 2. stops every worker and joins it, which lets in-flight jobs finish
//! 3. fires the "stopped" latch observed by [`WorkerPool::wait_stopped`]
//!
//! A shutdown signal always wins over a pending job.

use crate::config::ServerConfig;
use crate::error::PoolError;
use crate::job::{Completion, Job, JobHandle, Work};
use crate::queue::{BoundedQueue, SendError};
use crate::runtime_config::{spawn_coroutine, DEFAULT_STACK_SIZE};
use crate::worker::{Intake, Worker, WorkerInfo};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Default number of workers
pub const DEFAULT_POOL_SIZE: usize = 4;
/// Default backlog depth
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Sizing for a [`WorkerPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker coroutines (N)
    pub workers: usize,
    /// Backlog capacity (M)
    pub queue_depth: usize,
    /// Stack size for worker and dispatcher coroutines, 0 for the runtime default
    pub stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_POOL_SIZE,
            queue_depth: DEFAULT_QUEUE_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl PoolConfig {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        Self {
            workers,
            queue_depth,
            ..Self::default()
        }
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] for zero workers or zero queue depth.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.workers == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "workers must be > 0".to_string(),
            });
        }
        if self.queue_depth == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "queue depth must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            workers: cfg.pool_size(),
            queue_depth: cfg.queue_size(),
            stack_size: cfg.stack_size(),
        }
    }
}

/// Live counters shared by the pool and its workers.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
    in_flight: AtomicUsize,
}

impl Counters {
    pub(crate) fn job_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn snapshot_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Jobs accepted onto the backlog
    pub dispatched: u64,
    /// Jobs a worker finished executing (including ones that panicked)
    pub completed: u64,
    /// Accepted jobs discarded by shutdown
    pub rejected: u64,
    /// Jobs whose execution panicked
    pub panicked: u64,
    /// Jobs executing right now
    pub in_flight: usize,
    /// Jobs waiting in the backlog
    pub backlog: usize,
    /// Idle workers, counting the one the dispatch loop holds while it waits
    /// for a job. Can read one low for the instant of a hand-off.
    pub idle_workers: usize,
}

struct Shared {
    name: String,
    config: PoolConfig,
    backlog: BoundedQueue<Job>,
    available: Arc<BoundedQueue<Intake>>,
    /// Set while the dispatch loop holds an idle intake and waits on the backlog
    holding_intake: AtomicBool,
    started: AtomicBool,
    shutting_down: AtomicBool,
    counters: Arc<Counters>,
    stopped: Completion,
}

impl Shared {
    fn reject(&self, job: Job) {
        debug!(pool = %self.name, job_id = job.id(), "Rejecting job on shutdown");
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        job.reject();
    }

    fn reject_backlog(&self) {
        for job in self.backlog.drain() {
            self.reject(job);
        }
    }

    /// Shutdown path when no dispatch loop exists to run it.
    fn finish_without_dispatcher(&self) {
        self.reject_backlog();
        if self.stopped.signal() {
            info!(pool = %self.name, "Worker pool stopped");
        }
    }
}

/// Fixed-size, queue-mediated scheduler matching jobs to idle workers.
///
/// Cloning is cheap and every clone drives the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Create an idle pool. Nothing is spawned until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] for zero workers or zero queue depth.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                backlog: BoundedQueue::new(config.queue_depth),
                available: Arc::new(BoundedQueue::new(config.workers)),
                holding_intake: AtomicBool::new(false),
                started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                counters: Arc::new(Counters::default()),
                stopped: Completion::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Spawn N workers and the dispatch loop, then return.
    ///
    /// Workers may still be publishing their first idle announcement when
    /// this returns.
    ///
    /// # Errors
    ///
    /// - [`PoolError::AlreadyStarted`] on a second call
    /// - [`PoolError::ShuttingDown`] if `stop()` already ran
    /// - [`PoolError::Spawn`] if a coroutine could not be created; the pool is
    ///   then shut down
    pub fn start(&self) -> Result<(), PoolError> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }
        if shared.shutting_down.load(Ordering::SeqCst) {
            shared.finish_without_dispatcher();
            return Err(PoolError::ShuttingDown);
        }

        let mut workers = Vec::with_capacity(shared.config.workers);
        for id in 0..shared.config.workers {
            let mut worker = Worker::new(&shared.name, id, shared.config.stack_size);
            if let Err(e) = worker.start(
                Arc::clone(&shared.available),
                Arc::clone(&shared.counters),
            ) {
                self.abort_start(workers);
                return Err(e);
            }
            workers.push(worker);
        }

        let loop_shared = Arc::clone(shared);
        let spawned = spawn_coroutine(
            format!("{}-dispatcher", shared.name),
            shared.config.stack_size,
            move || dispatch_loop(&loop_shared, workers),
        );
        if let Err(e) = spawned {
            error!(pool = %shared.name, error = %e, "Failed to spawn dispatch loop");
            // Workers were moved into the closure and stop when it is dropped
            self.abort_start(Vec::new());
            return Err(e);
        }

        info!(
            pool = %shared.name,
            workers = shared.config.workers,
            queue_depth = shared.config.queue_depth,
            stack_size = shared.config.stack_size,
            "Worker pool started"
        );
        Ok(())
    }

    fn abort_start(&self, mut workers: Vec<Worker>) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.backlog.close();
        self.shared.available.close();
        for worker in &workers {
            worker.stop();
        }
        for worker in &mut workers {
            worker.join();
        }
        self.shared.finish_without_dispatcher();
    }

    /// Enqueue a job on the backlog, blocking while it is full.
    ///
    /// Jobs dispatched before [`start`](Self::start) wait in the backlog.
    ///
    /// # Errors
    ///
    /// [`PoolError::ShuttingDown`] once `stop()` has begun, including when it
    /// begins while this call is blocked. The job is then settled as
    /// rejected so any handle taken from it does not hang.
    pub fn dispatch(&self, job: Job) -> Result<(), PoolError> {
        let shared = &self.shared;
        if shared.shutting_down.load(Ordering::SeqCst) {
            job.reject();
            return Err(PoolError::ShuttingDown);
        }
        shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        match shared.backlog.send(job) {
            Ok(()) => Ok(()),
            Err(SendError(job)) => {
                shared.counters.dispatched.fetch_sub(1, Ordering::Relaxed);
                job.reject();
                Err(PoolError::ShuttingDown)
            }
        }
    }

    /// Wrap `work` in a job, dispatch it and hand back the waiter side.
    ///
    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub fn submit<W: Work>(&self, work: W) -> Result<JobHandle, PoolError> {
        let job = Job::new(work);
        let handle = job.handle();
        self.dispatch(job)?;
        Ok(handle)
    }

    /// Closure form of [`submit`](Self::submit).
    ///
    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub fn submit_fn<F>(&self, f: F) -> Result<JobHandle, PoolError>
    where
        F: FnOnce(&WorkerInfo) + Send + 'static,
    {
        let job = Job::from_fn(f);
        let handle = job.handle();
        self.dispatch(job)?;
        Ok(handle)
    }

    /// Begin shutdown and return immediately. Idempotent.
    ///
    /// Use [`wait_stopped`](Self::wait_stopped) to wait for the drain.
    pub fn stop(&self) {
        let shared = &self.shared;
        if shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pool = %shared.name, backlog = shared.backlog.len(), "Worker pool shutdown requested");
        shared.backlog.close();
        shared.available.close();
        if !shared.started.load(Ordering::SeqCst) {
            shared.finish_without_dispatcher();
        }
    }

    /// Block until shutdown has finished: backlog rejected, every worker
    /// joined, every in-flight job completed.
    pub fn wait_stopped(&self) {
        // The latch is only ever signalled, never rejected
        if self.shared.stopped.wait().is_err() {
            error!(pool = %self.shared.name, "Worker pool stop latch rejected");
        }
    }

    /// Deadline-bounded [`wait_stopped`](Self::wait_stopped).
    ///
    /// # Errors
    ///
    /// [`PoolError::Timeout`] if the pool has not finished stopping in time.
    pub fn wait_stopped_deadline(&self, timeout: Duration) -> Result<(), PoolError> {
        self.shared.stopped.wait_deadline(timeout)
    }

    /// `true` between a successful `start()` and the beginning of shutdown.
    pub fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
            && !self.shared.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// `true` once shutdown has fully completed.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.is_settled()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
            backlog: self.shared.backlog.len(),
            idle_workers: self.shared.available.len()
                + usize::from(self.shared.holding_intake.load(Ordering::SeqCst)),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish()
    }
}

fn dispatch_loop(shared: &Shared, mut workers: Vec<Worker>) {
    debug!(pool = %shared.name, "Dispatch loop started");
    let shutting_down = || shared.shutting_down.load(Ordering::SeqCst);

    while !shutting_down() {
        let Some(intake) = shared.available.recv() else {
            break;
        };
        shared.holding_intake.store(true, Ordering::SeqCst);
        if shutting_down() {
            break;
        }
        let Some(job) = shared.backlog.recv() else {
            break;
        };
        shared.holding_intake.store(false, Ordering::SeqCst);
        if shutting_down() {
            shared.reject(job);
            break;
        }
        // The intake only refuses when its worker is already stopping
        if let Err(SendError(job)) = intake.send(job) {
            shared.reject(job);
        }
    }
    shared.holding_intake.store(false, Ordering::SeqCst);

    shared.reject_backlog();
    for worker in &workers {
        worker.stop();
    }
    for worker in &mut workers {
        worker.join();
    }

    let stats = shared.counters.as_ref();
    info!(
        pool = %shared.name,
        completed = stats.completed.load(Ordering::Relaxed),
        rejected = stats.rejected.load(Ordering::Relaxed),
        "Worker pool stopped"
    );
    shared.stopped.signal();
}
