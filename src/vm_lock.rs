/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The VM-wide advisory lock coordinating the VCPU thread with
//! VM-management threads during relocation and teardown.
//!
//! The transition driver never takes this lock itself; callers
//! orchestrating relocation or teardown hold it around those operations.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use tracing::{Span, instrument};

use crate::{Result, log_then_return};

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A recursive advisory lock with a queryable owner.
#[derive(Default)]
pub struct VmLock {
    state: Mutex<LockState>,
    freed: Condvar,
}

impl VmLock {
    /// An unowned lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is held by the calling thread. Re-acquiring
    /// on the owning thread nests; every acquire needs a matching
    /// [`Self::release`].
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn acquire(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock()?;
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return Ok(());
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return Ok(());
                }
                Some(_) => state = self.freed.wait(state)?,
            }
        }
    }

    /// Take the lock if it is free or already ours; never blocks
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn try_acquire(&self) -> Result<bool> {
        let me = thread::current().id();
        let mut state = self.state.lock()?;
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                Ok(true)
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Release one level of ownership. Releasing a lock the calling
    /// thread does not hold is an error.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock()?;
        if state.owner != Some(me) {
            log_then_return!("VM lock released by a non-owning thread");
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.freed.notify_one();
        }
        Ok(())
    }

    /// The thread currently holding the lock, if any
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn owner(&self) -> Result<Option<ThreadId>> {
        Ok(self.state.lock()?.owner)
    }

    /// Whether the calling thread holds the lock
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn is_owner(&self) -> Result<bool> {
        Ok(self.state.lock()?.owner == Some(thread::current().id()))
    }
}
