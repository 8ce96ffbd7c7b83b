//! Bounded Connection Pool
//!
//! A pool is a LIFO deque of idle connections guarded by a mutex plus an
//! atomic count of open connections. The count covers idle connections and
//! connections currently checked out, so `open <= capacity` holds no matter
//! where a connection is.
//!
//! ```text
//!            pop (head)                       sweep (tail)
//!               │                                  │
//!               ▼                                  ▼
//!        ┌────┬────┬────┬────┬────┐
//!        │ c4 │ c3 │ c2 │ c1 │ c0 │   idle, most recent first
//!        └────┴────┴────┴────┴────┘
//!               ▲
//!               │
//!            push (head)
//! ```
//!
//! Async pools use the same type but are only touched by the worker loop
//! that owns them, so their mutex is never contended. The open counter is
//! still read from other threads.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct ConnectionPool<C> {
    idle: Mutex<VecDeque<C>>,
    open: AtomicUsize,
    capacity: usize,
}

impl<C> ConnectionPool<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            open: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Takes the most recently used idle connection.
    pub fn pop(&self) -> Option<C> {
        self.idle.lock().pop_front()
    }

    /// Claims a slot for a new connection. Fails when the pool is full.
    pub fn try_reserve(&self) -> bool {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.capacity).then_some(open + 1)
            })
            .is_ok()
    }

    /// Gives back a slot after its connection was closed or never opened.
    pub fn release_slot(&self) {
        let _ = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| open.checked_sub(1));
    }

    /// Returns a connection to the head of the pool.
    ///
    /// When the pool has no room the connection is handed back and the
    /// caller must close it and call [`ConnectionPool::release_slot`].
    pub fn push(&self, conn: C) -> Result<(), C> {
        let mut idle = self.idle.lock();
        if idle.len() >= self.capacity {
            return Err(conn);
        }
        idle.push_front(conn);
        Ok(())
    }

    /// Closes idle connections from the tail while `is_stale` says so.
    /// Stops at the first connection that is still fresh.
    pub fn sweep(&self, mut is_stale: impl FnMut(&C) -> bool) -> usize {
        let mut closed = 0;
        loop {
            let conn = {
                let mut idle = self.idle.lock();
                match idle.pop_back() {
                    Some(conn) if is_stale(&conn) => conn,
                    Some(conn) => {
                        idle.push_back(conn);
                        break;
                    }
                    None => break,
                }
            };
            drop(conn);
            self.release_slot();
            closed += 1;
        }
        closed
    }

    /// Removes every idle connection and gives back their slots.
    pub fn drain(&self) -> usize {
        let drained: Vec<C> = self.idle.lock().drain(..).collect();
        for _ in &drained {
            self.release_slot();
        }
        drained.len()
    }
}

/// Splits `max` connections across `pools`, handing the remainder to the
/// first pools.
pub fn split_capacity(max: usize, pools: usize) -> Vec<usize> {
    if pools == 0 {
        return Vec::new();
    }
    let base = max / pools;
    let rem = max % pools;
    (0..pools).map(|i| base + usize::from(i < rem)).collect()
}

/// Order in which sync pools are tried, starting at `initial`: downwards to
/// the first pool, then upwards from `initial + 1`.
pub fn scan_order(initial: usize, pools: usize) -> impl Iterator<Item = usize> {
    let initial = initial.min(pools.saturating_sub(1));
    (0..=initial).rev().chain(initial + 1..pools)
}
