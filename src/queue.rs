//! # Bounded Queue Module
//!
//! A closable, bounded, FIFO channel shared by any number of producers and
//! consumers. The worker pool uses it three ways:
//!
//! - **Backlog queue**: pending jobs, capacity = configured queue depth
//! - **Availability queue**: idle worker intake handles, capacity = worker count
//! - **Worker intake**: a single-slot queue that carries one job to one worker
//!
//! Blocking is built on `may::sync::{Mutex, Condvar}`, so a full or empty queue
//! parks a coroutine without stalling the scheduler thread underneath it, and
//! plain OS threads can use the same queue.
//!
//! ## Semantics
//!
//! - `send` blocks while the queue is full and fails once it is closed
//! - `recv` blocks while the queue is empty and returns `None` only when it is
//!   closed **and** drained, so nothing accepted before `close` is lost
//! - `close` wakes every blocked producer and consumer

use may::sync::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::PoisonError;

/// Returned by [`BoundedQueue::send`] when the queue has been closed.
///
/// Carries the rejected item back to the caller.
#[derive(PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sending on a closed queue")
    }
}

/// Returned by [`BoundedQueue::try_send`].
#[derive(PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The queue is at capacity
    Full(T),
    /// The queue has been closed
    Closed(T),
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer multi-consumer FIFO queue.
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// A capacity of zero is raised to one; the pool validates its sizing
    /// before it ever gets here.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item inside [`SendError`] if the queue is (or becomes)
    /// closed before there is room for it.
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(SendError(item));
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Append an item without blocking.
    ///
    /// # Errors
    ///
    /// [`TrySendError::Full`] when at capacity, [`TrySendError::Closed`] when closed.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(TrySendError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(TrySendError::Full(item));
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and every item has been taken.
    pub fn recv(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove the oldest item if there is one.
    pub fn try_recv(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Take every queued item at once, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.lock();
        let items: Vec<T> = state.items.drain(..).collect();
        self.not_full.notify_all();
        items
    }

    /// Close the queue. Idempotent.
    ///
    /// Blocked senders fail; blocked receivers drain what is left and then
    /// observe `None`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of items currently queued
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let q = BoundedQueue::new(4);
        for i in 0..4 {
            q.send(i).unwrap();
        }
        assert_eq!(q.len(), 4);
        let got: Vec<i32> = (0..4).filter_map(|_| q.recv()).collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_try_send_full_and_closed() {
        let q = BoundedQueue::new(1);
        assert!(q.try_send(1).is_ok());
        assert_eq!(q.try_send(2), Err(TrySendError::Full(2)));
        q.close();
        assert_eq!(q.try_send(3), Err(TrySendError::Closed(3)));
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let q: BoundedQueue<u8> = BoundedQueue::new(0);
        assert_eq!(q.capacity(), 1);
    }

    #[test]
    fn test_recv_drains_before_reporting_closed() {
        let q = BoundedQueue::new(2);
        q.send("a").unwrap();
        q.close();
        assert!(q.is_closed());
        assert_eq!(q.recv(), Some("a"));
        assert_eq!(q.recv(), None);
        assert!(q.send("b").is_err());
    }

    #[test]
    fn test_send_blocks_until_slot_frees() {
        let q = Arc::new(BoundedQueue::new(1));
        q.send(1).unwrap();

        let sent = Arc::new(AtomicBool::new(false));
        let producer = {
            let q = Arc::clone(&q);
            let sent = Arc::clone(&sent);
            thread::spawn(move || {
                q.send(2).unwrap();
                sent.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!sent.load(Ordering::SeqCst), "send must block while full");

        assert_eq!(q.recv(), Some(1));
        producer.join().unwrap();
        assert!(sent.load(Ordering::SeqCst));
        assert_eq!(q.recv(), Some(2));
    }

    #[test]
    fn test_close_wakes_blocked_sender() {
        let q = Arc::new(BoundedQueue::new(1));
        q.send(1).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.send(2))
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(producer.join().unwrap(), Err(SendError(2)));
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.recv())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_drain_takes_everything() {
        let q = BoundedQueue::new(3);
        q.send(1).unwrap();
        q.send(2).unwrap();
        assert_eq!(q.drain(), vec![1, 2]);
        assert!(q.try_recv().is_none());
    }
}
