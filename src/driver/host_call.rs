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

//! The host-call protocol: the request record guest-context code files
//! when it needs the host to do something, and the dispatch that services
//! it.
//!
//! At most one request exists per VCPU at any time, by construction: the
//! guest parks itself after filing one and the driver services it to
//! completion before resuming.

use tracing::{Span, instrument};

use crate::services::HostServices;
use crate::{Result, metrics};

/// The operations guest-context code can request from the host
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HostCallOp {
    /// No request pending
    None,
    /// Acquire a contended lock on the guest's behalf
    AcquireLock,
    /// Flush a pending-items queue
    FlushQueue,
    /// Grow the shadow-page pool
    GrowPool,
    /// Map a memory chunk
    MapChunk,
    /// Replenish the pre-allocated page set
    AllocatePages,
    /// Replay pending access-handler notifications
    ReplayNotifications,
    /// Flush the ring-0 logger (serviced by the unconditional drain that
    /// follows every transition, so dispatch itself has nothing to do)
    FlushLogger,
    /// Publish an error message
    SetError,
    /// Publish a runtime error message
    SetRuntimeError,
    /// A guest-context assertion fired; cancel the transition
    FatalAssertion,
}

impl HostCallOp {
    /// A stable name for this operation, used as a metric label
    pub fn name(&self) -> &'static str {
        match self {
            HostCallOp::None => "none",
            HostCallOp::AcquireLock => "acquire_lock",
            HostCallOp::FlushQueue => "flush_queue",
            HostCallOp::GrowPool => "grow_pool",
            HostCallOp::MapChunk => "map_chunk",
            HostCallOp::AllocatePages => "allocate_pages",
            HostCallOp::ReplayNotifications => "replay_notifications",
            HostCallOp::FlushLogger => "flush_logger",
            HostCallOp::SetError => "set_error",
            HostCallOp::SetRuntimeError => "set_runtime_error",
            HostCallOp::FatalAssertion => "fatal_assertion",
        }
    }
}

/// The per-VCPU request slot shared with guest-context code.
///
/// Guest code fills `op` and `arg` and parks; the dispatch stores the
/// collaborator's answer in `result` and resets `op` to
/// [`HostCallOp::None`]. The result slot survives the reset so the guest
/// can read it after resuming.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CallHostRequest {
    /// The requested operation
    pub op: HostCallOp,
    /// The operation's opaque argument
    pub arg: u64,
    /// The slot the operation's result is stored in
    pub result: u64,
}

impl CallHostRequest {
    /// An empty slot with no request pending
    pub fn new() -> Self {
        Self {
            op: HostCallOp::None,
            arg: 0,
            result: 0,
        }
    }

    /// File a request. Used by executor implementations on the guest's
    /// behalf.
    pub fn file(&mut self, op: HostCallOp, arg: u64) {
        self.op = op;
        self.arg = arg;
    }

    /// Reset the slot to no-request-pending, keeping the result readable
    pub fn clear(&mut self) {
        self.op = HostCallOp::None;
        self.arg = 0;
    }
}

impl Default for CallHostRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// What servicing a request decided about the in-flight transition.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServiceOutcome {
    /// The request was serviced; resume the transition
    Serviced,
    /// A fatal guest assertion; the transition is cancelled and must not
    /// be resumed
    FatalAssertion,
}

/// Service exactly one pending request: dispatch by tag to `host`, store
/// the result, and clear the tag. The tag is cleared on the failure exit
/// as well; a request whose dispatch failed must not be serviced again.
///
/// The fatal-assertion tag takes a different exit: the request is
/// cleared, nothing is stored, and the caller is told to cancel instead
/// of resume. Servicing an empty slot means the guest-side protocol and
/// this dispatch are out of sync, which is unrecoverable.
#[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
pub(crate) fn service(
    req: &mut CallHostRequest,
    host: &mut dyn HostServices,
) -> Result<ServiceOutcome> {
    let op = req.op;
    metrics::record_host_call(op);
    let result = match op {
        HostCallOp::None => panic!("host call serviced with no pending request"),
        HostCallOp::AcquireLock => host.acquire_lock(req.arg),
        HostCallOp::FlushQueue => host.flush_queue(req.arg),
        HostCallOp::GrowPool => host.grow_pool(req.arg),
        HostCallOp::MapChunk => host.map_chunk(req.arg),
        HostCallOp::AllocatePages => host.allocate_pages(req.arg),
        HostCallOp::ReplayNotifications => host.replay_notifications(req.arg),
        HostCallOp::FlushLogger => Ok(0),
        HostCallOp::SetError => host.set_error(req.arg),
        HostCallOp::SetRuntimeError => host.set_runtime_error(req.arg),
        HostCallOp::FatalAssertion => {
            req.clear();
            return Ok(ServiceOutcome::FatalAssertion);
        }
    };
    match result {
        Ok(val) => {
            req.result = val;
            req.clear();
            Ok(ServiceOutcome::Serviced)
        }
        Err(e) => {
            req.clear();
            Err(e)
        }
    }
}
