//! Open/closed gate shared by the read loop, the decode pause and the flush barrier.
//!
//! A gate is a boolean guarded by a mutex plus a condition variable. Threads that
//! must not proceed while the gate is closed call [`Gate::wait`]; whoever opens the
//! gate broadcasts to every waiter.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            cv: Condvar::new(),
        }
    }

    pub fn open(&self) {
        self.set(true);
    }

    pub fn close(&self) {
        self.set(false);
    }

    /// Change the gate state; opening wakes every blocked waiter.
    pub fn set(&self, open: bool) {
        let mut g = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        *g = open;
        drop(g);
        if open {
            self.cv.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the gate is open.
    pub fn wait(&self) {
        let mut g = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        while !*g {
            g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the gate is open or `timeout` elapses.
    ///
    /// Returns `true` if the gate was open on return.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let g = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let (g, _timeout) = self
            .cv
            .wait_timeout_while(g, timeout, |open| !*open)
            .unwrap_or_else(PoisonError::into_inner);
        *g
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_immediately_when_open() {
        let gate = Gate::new(true);
        gate.wait();
        assert!(gate.is_open());
    }

    #[test]
    fn open_wakes_every_waiter() {
        let gate = Arc::new(Gate::new(false));
        let barrier = Arc::new(std::sync::Barrier::new(3));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    gate.wait();
                })
            })
            .collect();

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        gate.open();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn wait_timeout_reports_closed_gate() {
        let gate = Gate::new(false);
        assert!(!gate.wait_timeout(Duration::from_millis(10)));
        gate.open();
        assert!(gate.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn close_after_open_blocks_again() {
        let gate = Gate::new(true);
        gate.close();
        assert!(!gate.is_open());
        assert!(!gate.wait_timeout(Duration::from_millis(5)));
    }
}
