#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::setup_may_runtime;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use webqueue::{
    Completion, CompletionState, PoolConfig, PoolError, Work, WorkerInfo, WorkerPool,
};

fn started_pool(name: &str, workers: usize, queue_depth: usize) -> WorkerPool {
    setup_may_runtime();
    let pool = WorkerPool::new(name, PoolConfig::new(workers, queue_depth)).unwrap();
    pool.start().unwrap();
    pool
}

/// Poll until `cond` holds or two seconds pass
fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_concurrency_never_exceeds_pool_size() {
    let pool = started_pool("bounded", 3, 10);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            pool.submit_fn(move |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                may::coroutine::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();

    for h in &handles {
        h.wait().unwrap();
    }
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak} exceeded 3 workers");
    assert!(peak >= 2, "jobs never overlapped");
    assert_eq!(pool.stats().completed, 12);

    pool.stop();
    pool.wait_stopped();
}

#[test]
fn test_single_worker_runs_jobs_in_fifo_order() {
    let pool = started_pool("fifo", 1, 8);
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let order = Arc::clone(&order);
            pool.submit_fn(move |_| order.lock().unwrap().push(i)).unwrap()
        })
        .collect();
    for h in &handles {
        h.wait().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);

    pool.stop();
    pool.wait_stopped();
}

/// With every worker busy and the backlog full, the next dispatch blocks
/// until a worker frees up
#[test]
fn test_full_backlog_blocks_submitter() {
    let pool = started_pool("backpressure", 1, 2);
    let gate = Arc::new(Completion::new());

    let first = {
        let gate = Arc::clone(&gate);
        pool.submit_fn(move |_| {
            gate.wait().unwrap();
        })
        .unwrap()
    };
    wait_until(|| pool.stats().in_flight == 1);

    let queued: Vec<_> = (0..2).map(|_| pool.submit_fn(|_| {}).unwrap()).collect();
    assert_eq!(pool.stats().backlog, 2);

    let returned = Arc::new(AtomicBool::new(false));
    let blocked = {
        let pool = pool.clone();
        let returned = Arc::clone(&returned);
        thread::spawn(move || {
            let handle = pool.submit_fn(|_| {}).unwrap();
            returned.store(true, Ordering::SeqCst);
            handle
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!returned.load(Ordering::SeqCst), "dispatch should block on a full backlog");

    gate.signal();
    let last = blocked.join().unwrap();
    assert!(returned.load(Ordering::SeqCst));

    first.wait().unwrap();
    for h in &queued {
        h.wait().unwrap();
    }
    last.wait().unwrap();

    pool.stop();
    pool.wait_stopped();
}

/// A waiter that times out does not cancel the job, and the worker becomes
/// available again once the job finishes
#[test]
fn test_deadline_wait_leaves_job_running() {
    let pool = started_pool("deadline", 1, 4);
    let finished = Arc::new(AtomicBool::new(false));

    let slow = {
        let finished = Arc::clone(&finished);
        pool.submit_fn(move |_| {
            may::coroutine::sleep(Duration::from_millis(150));
            finished.store(true, Ordering::SeqCst);
        })
        .unwrap()
    };

    let err = slow.wait_deadline(Duration::from_millis(30)).unwrap_err();
    assert!(matches!(err, PoolError::Timeout(_)));
    assert!(!finished.load(Ordering::SeqCst));

    slow.wait().unwrap();
    assert!(finished.load(Ordering::SeqCst));

    let next = pool.submit_fn(|_| {}).unwrap();
    next.wait_deadline(Duration::from_secs(2)).unwrap();

    pool.stop();
    pool.wait_stopped();
}

/// 4 jobs of 50ms on 2 workers take about two rounds, not four
#[test]
fn test_two_workers_run_four_jobs_in_two_rounds() {
    let pool = started_pool("rounds", 2, 2);
    // Let both workers announce themselves before timing
    wait_until(|| pool.stats().idle_workers == 2);

    let start = Instant::now();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            pool.submit_fn(|_| may::coroutine::sleep(Duration::from_millis(50)))
                .unwrap()
        })
        .collect();
    for h in &handles {
        h.wait().unwrap();
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(95), "finished too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(190), "jobs ran serially: {elapsed:?}");

    pool.stop();
    pool.wait_stopped();
}

/// Shutdown finishes in-flight jobs, rejects queued ones and refuses new work
#[test]
fn test_graceful_shutdown() {
    let pool = started_pool("shutdown", 2, 4);
    let finished = Arc::new(AtomicUsize::new(0));

    let running: Vec<_> = (0..2)
        .map(|_| {
            let finished = Arc::clone(&finished);
            pool.submit_fn(move |_| {
                may::coroutine::sleep(Duration::from_millis(100));
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    wait_until(|| pool.stats().in_flight == 2);

    let queued: Vec<_> = (0..3).map(|_| pool.submit_fn(|_| {}).unwrap()).collect();

    pool.stop();
    assert!(pool.is_shutting_down());
    pool.wait_stopped();
    assert!(pool.is_stopped());

    assert_eq!(finished.load(Ordering::SeqCst), 2);
    for h in &running {
        assert_eq!(h.state(), CompletionState::Done);
    }
    for h in &queued {
        assert_eq!(h.wait(), Err(PoolError::Rejected));
    }
    let stats = pool.stats();
    assert_eq!(stats.rejected, 3);
    assert_eq!(stats.in_flight, 0);

    assert_eq!(
        pool.submit_fn(|_| {}).unwrap_err(),
        PoolError::ShuttingDown
    );
    // Idempotent
    pool.stop();
    pool.wait_stopped_deadline(Duration::from_millis(10)).unwrap();
}

struct Tracked {
    ran: Arc<AtomicBool>,
    rejected: Arc<AtomicBool>,
}

impl Work for Tracked {
    fn execute(&mut self, _worker: &WorkerInfo) {
        self.ran.store(true, Ordering::SeqCst);
    }

    fn rejected(&mut self) {
        self.rejected.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_jobs_queued_before_start_run_after_start() {
    setup_may_runtime();
    let pool = WorkerPool::new("early", PoolConfig::new(1, 4)).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let rejected = Arc::new(AtomicBool::new(false));
    let handle = pool
        .submit(Tracked {
            ran: Arc::clone(&ran),
            rejected: Arc::clone(&rejected),
        })
        .unwrap();
    assert_eq!(pool.stats().backlog, 1);

    pool.start().unwrap();
    handle.wait().unwrap();
    assert!(ran.load(Ordering::SeqCst));
    assert!(!rejected.load(Ordering::SeqCst));
    assert_eq!(pool.start(), Err(PoolError::AlreadyStarted));

    pool.stop();
    pool.wait_stopped();
}

#[test]
fn test_stop_without_start_notifies_payload() {
    setup_may_runtime();
    let pool = WorkerPool::new("never", PoolConfig::new(1, 4)).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let rejected = Arc::new(AtomicBool::new(false));
    let handle = pool
        .submit(Tracked {
            ran: Arc::clone(&ran),
            rejected: Arc::clone(&rejected),
        })
        .unwrap();

    pool.stop();
    assert_eq!(handle.wait(), Err(PoolError::Rejected));
    assert!(rejected.load(Ordering::SeqCst));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(pool.is_stopped());
    assert_eq!(pool.start(), Err(PoolError::ShuttingDown));
}

#[test]
fn test_panicking_job_does_not_kill_worker() {
    let pool = started_pool("panicky", 1, 4);

    let bad = pool.submit_fn(|_| panic!("job exploded")).unwrap();
    bad.wait().unwrap();

    let ok = Arc::new(AtomicBool::new(false));
    let good = {
        let ok = Arc::clone(&ok);
        pool.submit_fn(move |_| ok.store(true, Ordering::SeqCst)).unwrap()
    };
    good.wait().unwrap();
    assert!(ok.load(Ordering::SeqCst));
    assert_eq!(pool.stats().panicked, 1);

    pool.stop();
    pool.wait_stopped();
}

#[test]
fn test_worker_identity_is_passed_to_jobs() {
    let pool = started_pool("named", 2, 4);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let seen = Arc::clone(&seen);
            pool.submit_fn(move |w: &WorkerInfo| {
                seen.lock().unwrap().push((w.name().to_string(), w.id()));
            })
            .unwrap()
        })
        .collect();
    for h in &handles {
        h.wait().unwrap();
    }
    for (name, id) in seen.lock().unwrap().iter() {
        assert_eq!(name, "named");
        assert!(*id < 2);
    }

    pool.stop();
    pool.wait_stopped();
}

#[test]
fn test_idle_pool_reports_every_worker_idle() {
    let pool = started_pool("idle", 3, 4);
    wait_until(|| pool.stats().idle_workers == 3);

    let gate = Arc::new(Completion::new());
    let busy = {
        let gate = Arc::clone(&gate);
        pool.submit_fn(move |_| {
            gate.wait().unwrap();
        })
        .unwrap()
    };
    wait_until(|| pool.stats().in_flight == 1);
    wait_until(|| pool.stats().idle_workers == 2);

    gate.signal();
    busy.wait().unwrap();
    wait_until(|| pool.stats().idle_workers == 3);

    pool.stop();
    pool.wait_stopped();
}

/// Connection handlers wait from coroutines, so the deadline has to fire there
#[test]
fn test_deadline_wait_from_coroutine_times_out() {
    let pool = started_pool("co-deadline", 1, 2);
    let slow = pool
        .submit_fn(|_| may::coroutine::sleep(Duration::from_millis(300)))
        .unwrap();

    let waiter = slow.clone();
    let (result, elapsed) = may::go!(move || {
        let start = Instant::now();
        let result = waiter.wait_deadline(Duration::from_millis(30));
        (result, start.elapsed())
    })
    .join()
    .unwrap();

    assert_eq!(result, Err(PoolError::Timeout(Duration::from_millis(30))));
    assert!(elapsed < Duration::from_millis(250), "waited {elapsed:?}");
    assert_eq!(slow.state(), CompletionState::Pending);

    slow.wait().unwrap();
    pool.stop();
    pool.wait_stopped();
}
