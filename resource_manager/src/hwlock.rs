// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-core exclusive hardware access token.

use std::collections::BTreeSet;
use std::time::Duration;

use log::debug;
use sync::Condvar;
use sync::Mutex;

use crate::CoreId;
use crate::Error;
use crate::InstanceId;
use crate::Result;

/// Holder of a hardware lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    /// The resource manager itself, for mode switches and migrations.
    Manager,
    /// The command layer running a command for an instance.
    Instance(InstanceId),
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<LockOwner>,
    // Instances that found the lock busy and must be re-dispatched by whoever ends up owning
    // their context.
    waiters: BTreeSet<InstanceId>,
}

/// A non-reentrant lock that must be held before any command is sent to a core.
///
/// Acquisition is bounded by a timeout so a wedged core surfaces as a retryable error instead of
/// hanging the caller.
#[derive(Debug)]
pub struct HwLock {
    core: CoreId,
    state: Mutex<LockState>,
    released: Condvar,
    timeout: Duration,
}

impl HwLock {
    pub fn new(core: CoreId, timeout: Duration) -> HwLock {
        HwLock {
            core,
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Blocks until the lock is free or the timeout expires.
    pub fn acquire(&self, owner: LockOwner) -> Result<HwLockGuard> {
        let state = self.state.lock();
        let (mut state, _) = self
            .released
            .wait_timeout_while(state, self.timeout, |s| s.owner.is_some());
        if let Some(holder) = state.owner {
            debug!("{}: hwlock held by {:?}, {:?} gave up", self.core, holder, owner);
            return Err(Error::HwLockTimeout(self.core));
        }
        state.owner = Some(owner);
        Ok(HwLockGuard { lock: self })
    }

    /// Takes the lock only if it is free right now.
    pub fn try_acquire(&self, owner: LockOwner) -> Option<HwLockGuard> {
        let mut state = self.state.lock();
        if state.owner.is_some() {
            return None;
        }
        state.owner = Some(owner);
        Some(HwLockGuard { lock: self })
    }

    pub fn owner(&self) -> Option<LockOwner> {
        self.state.lock().owner
    }

    pub fn add_waiter(&self, id: InstanceId) {
        self.state.lock().waiters.insert(id);
    }

    pub fn remove_waiter(&self, id: InstanceId) -> bool {
        self.state.lock().waiters.remove(&id)
    }

    pub fn waiters(&self) -> Vec<InstanceId> {
        self.state.lock().waiters.iter().copied().collect()
    }

    /// Carries a pending waiter of `from` over to `to` when the instance's context moves.
    pub fn transfer_waiter(from: &HwLock, to: &HwLock, id: InstanceId) {
        if from.remove_waiter(id) {
            to.add_waiter(id);
        }
    }

    fn release(&self) {
        self.state.lock().owner = None;
        self.released.notify_all();
    }
}

/// Releases the hardware lock when dropped.
#[must_use]
pub struct HwLockGuard<'a> {
    lock: &'a HwLock,
}

impl<'a> HwLockGuard<'a> {
    pub fn core(&self) -> CoreId {
        self.lock.core
    }
}

impl<'a> Drop for HwLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Hardware locks taken in order and released in reverse order on every exit path.
#[derive(Default)]
pub struct HwLockSet<'a> {
    guards: Vec<HwLockGuard<'a>>,
}

impl<'a> HwLockSet<'a> {
    pub fn push(&mut self, guard: HwLockGuard<'a>) {
        self.guards.push(guard);
    }

    pub fn holds(&self, core: CoreId) -> bool {
        self.guards.iter().any(|g| g.core() == core)
    }
}

impl<'a> Drop for HwLockSet<'a> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}
