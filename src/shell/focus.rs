//! Fair counting semaphore.
//!
//! Waiters are granted permits strictly in arrival order. A session's focus
//! lock is one of these with a single permit; exit waits use zero permits.

use parking_lot::{Condvar, Mutex};

struct Tickets {
    permits: usize,
    /// Next ticket handed to an arriving waiter
    next: u64,
    /// Ticket allowed to take the next permit
    serving: u64,
}

/// Semaphore granting permits first come, first served
pub struct FairSemaphore {
    state: Mutex<Tickets>,
    changed: Condvar,
}

impl FairSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(Tickets {
                permits,
                next: 0,
                serving: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// Block until a permit is available and it is this caller's turn
    pub fn acquire(&self) {
        let mut state = self.state.lock();
        let ticket = state.next;
        state.next += 1;
        while state.serving != ticket || state.permits == 0 {
            self.changed.wait(&mut state);
        }
        state.permits -= 1;
        state.serving += 1;
        drop(state);
        // The next ticket holder may be able to proceed too
        self.changed.notify_all();
    }

    /// Take a permit only if one is free and nobody is queued
    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.permits > 0 && state.serving == state.next {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        self.state.lock().permits += 1;
        self.changed.notify_all();
    }

    /// Take every free permit; returns how many were taken
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let taken = state.permits;
        state.permits = 0;
        taken
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.state.lock().permits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_permit() {
        let sem = FairSemaphore::new(1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert_eq!(sem.available(), 1);
        sem.acquire();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_drain() {
        let sem = FairSemaphore::new(3);
        assert_eq!(sem.drain(), 3);
        assert_eq!(sem.drain(), 0);
        assert!(!sem.try_acquire());
    }

    #[test]
    fn test_zero_permit_waits_for_release() {
        let sem = Arc::new(FairSemaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.acquire())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        sem.release();
        waiter.join().unwrap();
    }

    #[test]
    fn test_grants_in_arrival_order() {
        let sem = Arc::new(FairSemaphore::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for i in 0..5 {
            let sem = sem.clone();
            let order = order.clone();
            waiters.push(thread::spawn(move || {
                sem.acquire();
                order.lock().push(i);
                sem.release();
            }));
            // Let each waiter take its ticket before the next arrives
            thread::sleep(Duration::from_millis(30));
        }

        sem.release();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_try_acquire_respects_queue() {
        let sem = Arc::new(FairSemaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.acquire())
        };
        thread::sleep(Duration::from_millis(50));
        // A queued waiter owns the next permit
        sem.release();
        assert!(!sem.try_acquire());
        waiter.join().unwrap();
    }
}
