//! # Worker Module
//!
//! A [`Worker`] is a long-lived coroutine that runs one [`Job`] at a time.
//!
//! ## Loop
//!
//! 1. Publish its own intake handle on the pool's availability queue (idle)
//! 2. Block until exactly one job arrives on the intake
//! 3. Run the job, containing any panic at this boundary
//! 4. Signal the job's completion and go back to 1
//!
//! The intake holds a single slot and the handle is published once per idle
//! period, so the worker can never have two jobs in hand.
//!
//! `stop()` closes the intake. A job already delivered is still run, so stop
//! never interrupts or drops work that reached the worker.

use crate::error::PoolError;
use crate::job::Job;
use crate::queue::BoundedQueue;
use crate::runtime_config::spawn_coroutine;
use crate::worker_pool::Counters;
use may::coroutine::JoinHandle;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// A worker's job intake: a single-slot queue owned by that worker.
pub type Intake = Arc<BoundedQueue<Job>>;

/// Immutable worker identity, passed to every job it executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    id: usize,
    name: String,
}

impl WorkerInfo {
    /// Identity of worker `id` in the pool called `pool`.
    pub fn new(pool: &str, id: usize) -> Self {
        Self {
            id,
            name: pool.to_string(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Name of the pool this worker belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Composite `name:id` form used in log lines
    pub fn info(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

/// A pooled execution agent.
pub struct Worker {
    info: Arc<WorkerInfo>,
    intake: Intake,
    running: Arc<AtomicBool>,
    stack_size: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(pool: &str, id: usize, stack_size: usize) -> Self {
        Self {
            info: Arc::new(WorkerInfo::new(pool, id)),
            intake: Arc::new(BoundedQueue::new(1)),
            running: Arc::new(AtomicBool::new(false)),
            stack_size,
            handle: None,
        }
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the worker loop and return immediately.
    ///
    /// # Errors
    ///
    /// [`PoolError::AlreadyStarted`] on a second call, [`PoolError::Spawn`]
    /// if the coroutine cannot be created.
    pub(crate) fn start(
        &mut self,
        available: Arc<BoundedQueue<Intake>>,
        counters: Arc<Counters>,
    ) -> Result<(), PoolError> {
        if self.handle.is_some() || self.intake.is_closed() {
            return Err(PoolError::AlreadyStarted);
        }
        self.running.store(true, Ordering::SeqCst);

        let info = Arc::clone(&self.info);
        let intake = Arc::clone(&self.intake);
        let running = Arc::clone(&self.running);
        let spawned = spawn_coroutine(self.info.info(), self.stack_size, move || {
            debug!(worker = %info, "Worker started");
            while running.load(Ordering::SeqCst) {
                if available.send(Arc::clone(&intake)).is_err() {
                    break;
                }
                let Some(job) = intake.recv() else {
                    break;
                };
                run_job(&info, job, &counters);
            }
            running.store(false, Ordering::SeqCst);
            debug!(worker = %info, "Worker stopped");
        });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                error!(worker = %self.info, error = %e, "Failed to spawn worker coroutine");
                Err(e)
            }
        }
    }

    /// Ask the loop to exit once any in-flight job is finished. Non-blocking.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.intake.close();
    }

    /// Wait for the loop to exit. Returns immediately if it was never started.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.info, "Worker coroutine terminated abnormally");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_job(info: &WorkerInfo, mut job: Job, counters: &Counters) {
    let job_id = job.id();
    let started = Instant::now();
    counters.job_started();

    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job.execute(info))) {
        let message = panic_message(panic.as_ref());
        error!(
            worker = %info,
            job_id,
            panic_message = %message,
            "Job panicked, worker stays available"
        );
        if catch_unwind(AssertUnwindSafe(|| job.fault(info, &message))).is_err() {
            error!(worker = %info, job_id, "Job fault handler panicked");
        }
        counters.job_panicked();
    }

    debug!(
        worker = %info,
        job_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Job finished"
    );
    counters.job_finished();
    job.complete();
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::DEFAULT_STACK_SIZE;

    #[test]
    fn test_worker_info_identity() {
        let info = WorkerInfo::new("api", 3);
        assert_eq!(info.id(), 3);
        assert_eq!(info.name(), "api");
        assert_eq!(info.info(), "api:3");
        assert_eq!(format!("{info}"), "api:3");
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_stop_before_start_is_harmless() {
        let mut worker = Worker::new("idle", 0, 0);
        assert!(!worker.is_running());
        worker.stop();
        worker.join();
        let available = Arc::new(BoundedQueue::new(1));
        assert_eq!(
            worker.start(available, Arc::new(Counters::default())),
            Err(PoolError::AlreadyStarted)
        );
    }

    #[test]
    fn test_worker_publishes_runs_and_stops() {
        let available: Arc<BoundedQueue<Intake>> = Arc::new(BoundedQueue::new(1));
        let counters = Arc::new(Counters::default());
        let mut worker = Worker::new("unit", 0, DEFAULT_STACK_SIZE);
        worker
            .start(Arc::clone(&available), Arc::clone(&counters))
            .unwrap();

        let intake = available.recv().unwrap();
        let job = Job::from_fn(|w| assert_eq!(w.id(), 0));
        let handle = job.handle();
        intake.send(job).unwrap();
        handle.wait().unwrap();

        // Idle again after the job
        let _again = available.recv().unwrap();
        worker.stop();
        worker.join();
        assert!(!worker.is_running());
        assert_eq!(counters.snapshot_completed(), 1);
    }

    #[test]
    fn test_panicking_job_is_contained() {
        let available: Arc<BoundedQueue<Intake>> = Arc::new(BoundedQueue::new(1));
        let counters = Arc::new(Counters::default());
        let mut worker = Worker::new("unit", 1, DEFAULT_STACK_SIZE);
        worker
            .start(Arc::clone(&available), Arc::clone(&counters))
            .unwrap();

        let intake = available.recv().unwrap();
        let job = Job::from_fn(|_| panic!("handler exploded"));
        let handle = job.handle();
        intake.send(job).unwrap();
        assert_eq!(handle.wait(), Ok(()));

        // Same worker takes the next job
        let intake = available.recv().unwrap();
        let job = Job::from_fn(|_| {});
        let handle = job.handle();
        intake.send(job).unwrap();
        assert_eq!(handle.wait(), Ok(()));

        worker.stop();
        worker.join();
        assert_eq!(counters.snapshot_completed(), 2);
    }
}
