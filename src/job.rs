//! # Job Module
//!
//! A [`Job`] is the unit of work the pool moves around: a boxed [`Work`]
//! payload plus a one-shot [`Completion`] that the submitter waits on.
//!
//! ## Lifecycle
//!
//! ```text
//!   Pending ──signal()──▶ Done
//!      │
//!      └────reject()────▶ Rejected   (pool shut down before any worker ran it)
//! ```
//!
//! The state moves at most once. Further `signal()`/`reject()` calls are
//! no-ops and report `false`, so double signalling can never panic or strand
//! a waiter.
//!
//! A `Job` is consumed by the worker that runs it (`complete` takes `self`), so
//! executing the same job twice does not type-check.

use crate::error::PoolError;
use crate::runtime_config::spawn_coroutine;
use crate::worker::WorkerInfo;
use may::sync::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Observable state of a [`Completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// Not yet executed, or still executing
    Pending,
    /// A worker finished executing the job
    Done,
    /// Shutdown discarded the job before execution
    Rejected,
}

/// One-shot completion latch shared between a job and its waiters.
///
/// Every waiter observes the final state; waiting after the latch is set
/// returns immediately.
pub struct Completion {
    latch: Arc<Latch>,
}

struct Latch {
    state: Mutex<CompletionState>,
    settled: Condvar,
}

impl Latch {
    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        Self {
            latch: Arc::new(Latch {
                state: Mutex::new(CompletionState::Pending),
                settled: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.latch.lock()
    }

    fn settle(&self, to: CompletionState) -> bool {
        let mut state = self.lock();
        if *state != CompletionState::Pending {
            return false;
        }
        *state = to;
        self.latch.settled.notify_all();
        true
    }

    /// Mark the job done. Returns `true` only for the call that did it.
    pub fn signal(&self) -> bool {
        self.settle(CompletionState::Done)
    }

    /// Mark the job rejected. Returns `true` only for the call that did it.
    pub fn reject(&self) -> bool {
        self.settle(CompletionState::Rejected)
    }

    pub fn state(&self) -> CompletionState {
        *self.lock()
    }

    /// `true` once the latch has left `Pending`, whichever way.
    pub fn is_settled(&self) -> bool {
        self.state() != CompletionState::Pending
    }

    /// Block until the latch is set, with no timeout.
    ///
    /// # Errors
    ///
    /// [`PoolError::Rejected`] if the job was discarded by shutdown.
    pub fn wait(&self) -> Result<(), PoolError> {
        let mut state = self.lock();
        loop {
            match *state {
                CompletionState::Done => return Ok(()),
                CompletionState::Rejected => return Err(PoolError::Rejected),
                CompletionState::Pending => {}
            }
            state = self
                .latch
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the latch is set or `timeout` elapses.
    ///
    /// Timing out abandons only the caller's interest; the job keeps running.
    ///
    /// `may`'s timed condvar park never fires for a coroutine waiter, so a
    /// coroutine caller is woken by an alarm coroutine that sleeps out the
    /// timeout instead. The alarm holds the latch until it wakes, even when
    /// the job settles first.
    ///
    /// # Errors
    ///
    /// [`PoolError::Timeout`] when the deadline passes first,
    /// [`PoolError::Rejected`] if the job was discarded by shutdown,
    /// [`PoolError::Spawn`] if the alarm coroutine could not be started.
    pub fn wait_deadline(&self, timeout: Duration) -> Result<(), PoolError> {
        let deadline = Instant::now() + timeout;
        let expired = if may::coroutine::is_coroutine() && !self.is_settled() {
            Some(self.arm_alarm(timeout)?)
        } else {
            None
        };

        let mut state = self.lock();
        loop {
            match *state {
                CompletionState::Done => return Ok(()),
                CompletionState::Rejected => return Err(PoolError::Rejected),
                CompletionState::Pending => {}
            }
            let now = Instant::now();
            state = match &expired {
                Some(expired) => {
                    if expired.load(Ordering::Acquire) || now >= deadline {
                        return Err(PoolError::Timeout(timeout));
                    }
                    self.latch
                        .settled
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner)
                }
                None => {
                    if now >= deadline {
                        return Err(PoolError::Timeout(timeout));
                    }
                    self.latch
                        .settled
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Spawn a coroutine that raises the returned flag after `timeout` and
    /// wakes every waiter.
    fn arm_alarm(&self, timeout: Duration) -> Result<Arc<AtomicBool>, PoolError> {
        let expired = Arc::new(AtomicBool::new(false));
        let latch = Arc::clone(&self.latch);
        let flag = Arc::clone(&expired);
        spawn_coroutine("completion-alarm".to_string(), 0, move || {
            may::coroutine::sleep(timeout);
            flag.store(true, Ordering::Release);
            // Taking the lock orders the wakeup after the waiter has parked
            let _state = latch.lock();
            latch.settled.notify_all();
        })?;
        Ok(expired)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("state", &self.state())
            .finish()
    }
}

/// The payload of a [`Job`].
///
/// `execute` runs synchronously on whichever worker picked the job up and must
/// not return until its output is fully written. The worker identity is passed
/// in for diagnostics only.
pub trait Work: Send + 'static {
    fn execute(&mut self, worker: &WorkerInfo);

    /// Called on the same worker after `execute` panicked, so the payload can
    /// still produce a failure-indicating result.
    fn fault(&mut self, worker: &WorkerInfo, message: &str) {
        let _ = (worker, message);
    }

    /// Called when shutdown discards the job before any worker ran it.
    fn rejected(&mut self) {}
}

struct FnWork<F>(Option<F>);

impl<F> Work for FnWork<F>
where
    F: FnOnce(&WorkerInfo) + Send + 'static,
{
    fn execute(&mut self, worker: &WorkerInfo) {
        if let Some(f) = self.0.take() {
            f(worker);
        }
    }
}

/// A unit of dispatchable work with a one-shot completion signal.
pub struct Job {
    id: u64,
    work: Box<dyn Work>,
    completion: Arc<Completion>,
    created_at: Instant,
}

impl Job {
    /// Wrap a payload in a new pending job.
    pub fn new<W: Work>(work: W) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            work: Box::new(work),
            completion: Arc::new(Completion::new()),
            created_at: Instant::now(),
        }
    }

    /// Wrap a closure; it runs exactly once on the executing worker.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(&WorkerInfo) + Send + 'static,
    {
        Self::new(FnWork(Some(f)))
    }

    /// Process-unique job id, used in log lines
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the job was created (queueing + execution so far)
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// A waiter-side handle onto this job's completion.
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            completion: Arc::clone(&self.completion),
        }
    }

    pub(crate) fn execute(&mut self, worker: &WorkerInfo) {
        self.work.execute(worker);
    }

    pub(crate) fn fault(&mut self, worker: &WorkerInfo, message: &str) {
        self.work.fault(worker, message);
    }

    /// Signal completion and drop the payload.
    pub(crate) fn complete(self) {
        self.completion.signal();
    }

    /// Notify the payload and settle the completion as rejected.
    pub(crate) fn reject(mut self) {
        self.work.rejected();
        self.completion.reject();
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("state", &self.completion.state())
            .finish()
    }
}

/// Waiter side of a [`Job`]. Cheap to clone; every clone sees the same state.
#[derive(Clone)]
pub struct JobHandle {
    id: u64,
    completion: Arc<Completion>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("state", &self.completion.state())
            .finish()
    }
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> CompletionState {
        self.completion.state()
    }

    pub fn is_done(&self) -> bool {
        self.completion.state() == CompletionState::Done
    }

    /// See [`Completion::wait`].
    pub fn wait(&self) -> Result<(), PoolError> {
        self.completion.wait()
    }

    /// See [`Completion::wait_deadline`].
    pub fn wait_deadline(&self, timeout: Duration) -> Result<(), PoolError> {
        self.completion.wait_deadline(timeout)
    }
}
