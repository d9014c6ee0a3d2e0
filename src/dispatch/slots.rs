use crate::core::cancel::CancellationToken;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Longest single wait on the condition variable, so cancellation is noticed
/// even when no slot is released.
const WAIT_TICK: Duration = Duration::from_millis(50);

/// Bounded pool of concurrency slots
#[derive(Debug)]
pub struct SlotPool {
    capacity: usize,
    available: Mutex<usize>,
    released: Condvar,
}

/// Result of waiting for admission
#[derive(Debug)]
pub enum Admission {
    Granted(SlotGuard),
    TimedOut,
    Cancelled,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            available: Mutex::new(capacity),
            released: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.lock()
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut available = self.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(SlotGuard {
            pool: Arc::clone(self),
        })
    }

    /// Wait up to `max_wait` for a slot, giving up early on cancellation
    pub fn acquire(self: &Arc<Self>, max_wait: Duration, cancel: &CancellationToken) -> Admission {
        let deadline = Instant::now() + max_wait;
        let mut available = self.lock();

        loop {
            if cancel.is_cancelled() {
                return Admission::Cancelled;
            }
            if *available > 0 {
                *available -= 1;
                return Admission::Granted(SlotGuard {
                    pool: Arc::clone(self),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Admission::TimedOut;
            }

            let tick = (deadline - now).min(WAIT_TICK);
            available = self
                .released
                .wait_timeout(available, tick)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self) {
        let mut available = self.lock();
        if *available < self.capacity {
            *available += 1;
        }
        drop(available);
        self.released.notify_one();
    }

    // The counter stays consistent even if a holder panicked
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held slot; returned to the pool on drop
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<SlotPool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release();
    }
}
