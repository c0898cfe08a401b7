// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization helpers shared by the job engine.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Returns a copy of the current status value, without blocking on the
    /// [`Condvar`].
    pub fn get(&self) -> T
    where
        T: Copy,
    {
        *self.mutex.lock().unwrap()
    }

    /// Sets the status to the given value and notifies all waiting threads.
    pub fn notify_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Waits until the predicate is false on this status, or until the timeout
    /// elapses, whichever comes first.
    ///
    /// This returns a [`MutexGuard`] together with a flag indicating whether
    /// the wait timed out with the predicate still true.
    pub fn wait_timeout_while(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<T>, bool) {
        let (guard, result) = self
            .condvar
            .wait_timeout_while(self.mutex.lock().unwrap(), timeout, predicate)
            .unwrap();
        (guard, result.timed_out())
    }
}
