//! Condition-variable-backed cell with a guarded transactional update.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::time::Instant;

thread_local! {
    static CRITICAL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// True while the current thread is inside a [`GuardedCell`] critical
/// section. Blocking on a future in that state would hold the lock across
/// a suspension of unbounded length, so `join` treats it as fatal misuse.
pub(crate) fn in_critical_section() -> bool {
    CRITICAL_DEPTH.with(|d| d.get() > 0)
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        CRITICAL_DEPTH.with(|d| d.set(d.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CRITICAL_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// A mutable cell whose every update is a small transaction.
///
/// Readers take a snapshot with [`value`](GuardedCell::value); writers go
/// through [`guarded_access`](GuardedCell::guarded_access), which retries
/// (waiting on the condvar) until the supplied function accepts the
/// current state. Waiters wake only on state transitions.
pub struct GuardedCell<T> {
    name: &'static str,
    state: Mutex<T>,
    cond: Condvar,
}

impl<T: Send> GuardedCell<T> {
    /// The name is for diagnostics only.
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            state: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Snapshot of the current state. No freshness guarantee: the value
    /// may be stale by the time the caller looks at it.
    pub fn value(&self) -> T
    where
        T: Clone,
    {
        self.state.lock().clone()
    }

    /// Atomically evaluate `f` against the current state. `None` means
    /// "not yet": the lock is released, the thread waits on the condvar,
    /// and the transaction is retried. `Some(r)` commits whatever `f` did
    /// to the state, wakes all waiters, and returns `r`.
    pub fn guarded_access<R>(&self, mut f: impl FnMut(&mut T) -> Option<R>) -> R {
        let _depth = DepthGuard::enter();
        let mut state = self.state.lock();
        loop {
            if let Some(result) = f(&mut state) {
                self.cond.notify_all();
                return result;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Unconditional update.
    pub fn change(&self, f: impl FnOnce(&mut T)) {
        let _depth = DepthGuard::enter();
        let mut state = self.state.lock();
        f(&mut state);
        self.cond.notify_all();
    }

    /// Unconditional update that also returns a value.
    pub fn change_result<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _depth = DepthGuard::enter();
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.cond.notify_all();
        result
    }

    /// As [`guarded_access`](GuardedCell::guarded_access), but gives up
    /// with [`Error::Unavailable`] once `deadline` passes.
    pub fn timed_access<R>(
        &self,
        deadline: Instant,
        mut f: impl FnMut(&mut T) -> Option<R>,
    ) -> Result<R> {
        let _depth = DepthGuard::enter();
        let mut state = self.state.lock();
        loop {
            if let Some(result) = f(&mut state) {
                self.cond.notify_all();
                return Ok(result);
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::Unavailable);
            }
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for GuardedCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedCell")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_value_and_change() {
        let cell = GuardedCell::new("counter", 0i32);
        assert_eq!(cell.value(), 0);

        cell.change(|v| *v += 5);
        assert_eq!(cell.value(), 5);

        let doubled = cell.change_result(|v| {
            *v *= 2;
            *v
        });
        assert_eq!(doubled, 10);
    }

    #[test]
    fn test_guarded_access_waits_for_condition() {
        let cell = Arc::new(GuardedCell::new("gate", false));

        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || {
                cell.guarded_access(|open| if *open { Some(42) } else { None })
            })
        };

        thread::sleep(Duration::from_millis(20));
        cell.change(|open| *open = true);

        assert_eq!(waiter.join().unwrap(), 42);
    }

    #[test]
    fn test_timed_access_gives_up() {
        let cell = GuardedCell::new("never", ());
        let deadline = Instant::now() + Duration::from_millis(20);
        let result: Result<()> = cell.timed_access(deadline, |_| None);
        assert!(matches!(result, Err(Error::Unavailable)));
    }

    #[test]
    fn test_timed_access_succeeds_before_deadline() {
        let cell = GuardedCell::new("soon", 1i32);
        let deadline = Instant::now() + Duration::from_secs(5);
        let result = cell.timed_access(deadline, |v| Some(*v + 1));
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_critical_section_tracking() {
        assert!(!in_critical_section());
        let cell = GuardedCell::new("depth", ());
        cell.change(|_| assert!(in_critical_section()));
        assert!(!in_critical_section());
    }
}
