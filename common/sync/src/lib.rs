// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lock primitives whose methods panic rather than return an error on poison.
//!
//! The resource manager takes several of these locks in a fixed hierarchy on every command path.
//! A panic while one is held already takes the process down (release builds use panic=abort), so
//! callers are never asked to handle a poisoned lock and `.lock().unwrap()` never shows up at call
//! sites.

mod condvar;
mod mutex;

use std::sync::Arc;
use std::time::Duration;

pub use crate::condvar::Condvar;
pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;

/// One-shot completion signal, the waiting half.
///
/// Created together with a [`Promise`] by [`create_promise_and_waitable`]. The core layer keeps
/// the `Promise` and signals it when a command completes; the resource manager waits on the
/// `Waitable` with a bounded timeout.
pub struct Waitable(Arc<(Condvar, Mutex<bool>)>);

impl Waitable {
    /// Returns an already-signaled Waitable.
    pub fn signaled() -> Self {
        Waitable(Arc::new((Condvar::new(), Mutex::new(true))))
    }

    /// Blocks until signaled or `timeout` elapsed. Returns true when signaled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (ref condvar, ref signaled) = *self.0;
        let (guard, _) = condvar.wait_timeout_while(signaled.lock(), timeout, |done| !*done);
        *guard
    }

    /// Non-blocking check.
    pub fn is_signaled(&self) -> bool {
        *(self.0).1.lock()
    }
}

/// One-shot completion signal, the signaling half.
#[derive(Clone)]
pub struct Promise(Arc<(Condvar, Mutex<bool>)>);

impl Promise {
    /// Signals this promise and wakes every waiter of the paired Waitable.
    pub fn signal(&self) {
        let (ref condvar, ref signaled) = *self.0;
        *signaled.lock() = true;
        condvar.notify_all();
    }
}

/// Creates a paired Promise and Waitable.
pub fn create_promise_and_waitable() -> (Promise, Waitable) {
    let inner = Arc::new((Condvar::new(), Mutex::new(false)));
    (Promise(Arc::clone(&inner)), Waitable(inner))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn waitable_times_out_without_signal() {
        let (_promise, waitable) = create_promise_and_waitable();
        assert!(!waitable.wait(Duration::from_millis(10)));
        assert!(!waitable.is_signaled());
    }

    #[test]
    fn promise_wakes_waiter() {
        let (promise, waitable) = create_promise_and_waitable();
        let signaler = thread::spawn(move || promise.signal());
        assert!(waitable.wait(Duration::from_secs(5)));
        signaler.join().unwrap();
    }

    #[test]
    fn signaled_waitable_returns_immediately() {
        assert!(Waitable::signaled().wait(Duration::ZERO));
    }

    #[test]
    fn try_lock_reports_contention() {
        let m = Mutex::new(1u32);
        let guard = m.lock();
        assert_eq!(m.try_lock().err(), Some(WouldBlock));
        drop(guard);
        assert_eq!(*m.try_lock().unwrap(), 1);
    }
}
