//! Write-once cell with a blocking read.

use crate::util::Backoff;
use parking_lot::{Condvar, Mutex};

/// Single-assignment cell.
///
/// The slot is written at most once; readers block until it is. An
/// assignment happens-before every `peek`/`wait` that observes it (the
/// slot sits behind a mutex).
pub struct AssignCell<T> {
    name: &'static str,
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Send> AssignCell<T> {
    /// The name is for diagnostics only.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_assigned(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// The assigned value, if any, without blocking.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.slot.lock().clone()
    }

    /// Block until the cell is assigned and return the value. Spins
    /// briefly first: assignments are usually already in flight when a
    /// reader arrives.
    pub fn wait(&self) -> T
    where
        T: Clone,
    {
        let mut backoff = Backoff::new();
        while !backoff.is_exhausted() {
            if let Some(value) = self.peek() {
                return value;
            }
            backoff.spin();
        }

        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.cond.wait(&mut slot);
        }
    }

    /// Write the value. Returns `false` if the cell was already assigned
    /// (the new value is dropped and the original stays).
    pub fn assign(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.cond.notify_all();
        true
    }
}

impl<T> std::fmt::Debug for AssignCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignCell")
            .field("name", &self.name)
            .field("assigned", &self.slot.lock().is_some())
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
    fn test_assign_once() {
        let cell = AssignCell::new("x");
        assert_eq!(cell.peek(), None);

        assert!(cell.assign(7));
        assert_eq!(cell.peek(), Some(7));

        assert!(!cell.assign(8));
        assert_eq!(cell.peek(), Some(7));
    }

    #[test]
    fn test_peek_is_stable() {
        let cell = AssignCell::new("stable");
        cell.assign("v");
        for _ in 0..10 {
            assert_eq!(cell.peek(), Some("v"));
        }
    }

    #[test]
    fn test_wait_blocks_until_assigned() {
        let cell = Arc::new(AssignCell::new("later"));

        let reader = {
            let cell = cell.clone();
            thread::spawn(move || cell.wait())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(cell.assign(99));

        assert_eq!(reader.join().unwrap(), 99);
    }

    #[test]
    fn test_many_waiters() {
        let cell = Arc::new(AssignCell::new("shared"));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || cell.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        cell.assign(1234);

        for reader in readers {
            assert_eq!(reader.join().unwrap(), 1234);
        }
    }
}
