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

//! The collaborator interfaces this crate consumes.
//!
//! The world-switch core is an embedded library component; everything
//! that touches real pages, symbols, timers or the raw transition
//! primitive is supplied by the orchestrating VM layer through these
//! traits. Tests substitute in-memory doubles.

use crate::Result;
use crate::driver::host_call::CallHostRequest;
use crate::mem::ptr::RawPtr;
use crate::switcher::fixup::{ArchSelectors, CpuCapabilities};

/// One physically-contiguous allocation, visible both as a host ring-0
/// address and as its backing physical address.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ContiguousAlloc {
    /// The host ring-0 mapping of the allocation
    pub host_ring0: u64,
    /// The physical address of the first page
    pub phys: u64,
}

/// Page-level memory operations supplied by the VM's memory manager.
pub trait MemoryServices {
    /// Allocate `size` bytes of page-aligned physically contiguous memory
    fn alloc_contiguous(&mut self, size: usize) -> Result<ContiguousAlloc>;

    /// Release an allocation obtained from [`Self::alloc_contiguous`]
    fn free_contiguous(&mut self, alloc: &ContiguousAlloc) -> Result<()>;

    /// Establish the identity (virtual == physical) mapping for the
    /// range. Failing with
    /// [`IntermediateMappingConflict`](crate::WorldSwitchError::IntermediateMappingConflict)
    /// is recoverable; the caller retries with a fresh allocation.
    fn map_intermediate(&mut self, phys: u64, size: usize) -> Result<()>;

    /// Tear down an identity mapping established by
    /// [`Self::map_intermediate`]
    fn unmap_intermediate(&mut self, phys: u64, size: usize) -> Result<()>;

    /// Map `size` bytes at host ring-0 address `host` into the guest
    /// hypervisor area and return the guest address
    fn map_into_guest(&mut self, host: u64, size: usize) -> Result<u64>;

    /// Remove a guest mapping established by [`Self::map_into_guest`]
    fn unmap_from_guest(&mut self, guest: u64, size: usize) -> Result<()>;

    /// The current guest address of host ring-0 address `host`. The
    /// answer changes across relocations.
    fn host_to_guest(&self, host: u64) -> Result<u64>;

    /// Reserve an inaccessible page-aligned region bracketing a stack
    fn reserve_guard_region(&mut self, guest: u64, size: usize) -> Result<()>;
}

/// A terminal result of running guest-context code: the transition
/// completed and control is back with the caller.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TerminalStatus {
    /// The guest ran to the requested completion point
    Success,
    /// The guest hit something raw-mode execution cannot handle; the
    /// caller must fall back to emulation
    EmulationRequired,
    /// Guest-context hypervisor code panicked in a trap handler
    TrapPanic,
    /// A guest-context assertion fired; the transition was cancelled
    HyperAssertion,
}

impl TerminalStatus {
    /// A stable name for this status, used as a metric label
    pub fn name(&self) -> &'static str {
        match self {
            TerminalStatus::Success => "success",
            TerminalStatus::EmulationRequired => "emulation_required",
            TerminalStatus::TrapPanic => "trap_panic",
            TerminalStatus::HyperAssertion => "hyper_assertion",
        }
    }
}

/// What a single transition attempt came back with.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunExit {
    /// The transition is over; control returns to the caller
    Completed(TerminalStatus),
    /// A host interrupt fired while hypervisor code was running. Purely
    /// transient; the driver retries without surfacing it.
    InterruptHyper,
    /// Guest-context code filed a host-call request and parked itself
    CallHost,
}

/// The raw transition primitive and the per-VCPU guest context around it.
///
/// One implementation exists per VCPU; the driver's state machine is
/// confined to that VCPU's thread.
pub trait GuestExecutor {
    /// Enter the switcher at host ring-0 address `entry` and run until an
    /// exit condition
    fn switch_to_guest(&mut self, entry: u64) -> Result<RunExit>;

    /// Re-enter guest context where the last exit left off
    fn resume(&mut self) -> Result<RunExit>;

    /// Set the guest-context instruction pointer used on the next entry
    fn set_resume_target(&mut self, target: u64);

    /// Set the guest-context stack pointer used on the next entry
    fn set_stack_pointer(&mut self, sp: u64);

    /// Whether the guest EFLAGS VM bit is set (virtual-8086 mode)
    fn is_v86(&self) -> bool;

    /// The shared host-call request slot for this VCPU
    fn host_call_request(&mut self) -> &mut CallHostRequest;

    /// The two assertion message buffers guest-context code writes before
    /// raising a fatal assertion
    fn assertion_text(&self) -> (String, String);

    /// Flush the guest-context scratch log buffer. Best-effort, no
    /// error return.
    fn drain_guest_log(&mut self);

    /// Flush the host ring-0 scratch log buffer. Best-effort, no error
    /// return.
    fn drain_ring0_log(&mut self);
}

/// Symbol resolution supplied by the VM's module loader.
pub trait LoaderServices {
    /// Resolve a named guest-context symbol to its current guest address
    fn guest_symbol(&self, name: &str) -> Result<RawPtr>;

    /// The nearest symbol at or below `guest_addr`, with its address,
    /// if any module covers it
    fn nearest_symbol(&self, guest_addr: u64) -> Option<(String, u64)>;
}

/// The host-side operations guest-context code can request through the
/// host-call protocol. Each takes the request's opaque argument and
/// produces the value stored in the request's result slot.
pub trait HostServices {
    /// Acquire the contended lock identified by `arg`
    fn acquire_lock(&mut self, arg: u64) -> Result<u64>;

    /// Flush the pending-items queue identified by `arg`
    fn flush_queue(&mut self, arg: u64) -> Result<u64>;

    /// Grow the shadow-page pool
    fn grow_pool(&mut self, arg: u64) -> Result<u64>;

    /// Map the memory chunk identified by `arg`
    fn map_chunk(&mut self, arg: u64) -> Result<u64>;

    /// Replenish the pre-allocated page set
    fn allocate_pages(&mut self, arg: u64) -> Result<u64>;

    /// Replay pending access-handler notifications
    fn replay_notifications(&mut self, arg: u64) -> Result<u64>;

    /// Publish an error message from guest context
    fn set_error(&mut self, arg: u64) -> Result<u64>;

    /// Publish a runtime error message from guest context
    fn set_runtime_error(&mut self, arg: u64) -> Result<u64>;
}

/// The periodic timer used by the EMT yield heuristic.
pub trait TimerService {
    /// Milliseconds of monotonic time
    fn now_millis(&self) -> u64;

    /// How far virtual-sync time lags behind real time, in milliseconds
    fn virtual_sync_lag_millis(&self) -> u64;

    /// Yield the current host thread
    fn yield_now(&mut self);

    /// Arm the yield timer to fire once after `millis`
    fn arm_yield_timer(&mut self, millis: u32);

    /// Cancel a pending yield-timer expiry, if any
    fn cancel_yield_timer(&mut self);

    /// When the armed yield timer will fire, in monotonic milliseconds,
    /// or `None` if it is not armed
    fn yield_timer_expiry(&self) -> Option<u64>;
}

/// Architecture state the fixup engine needs at relocation time.
pub trait ArchServices {
    /// The hypervisor selector values currently installed and the guest
    /// address of the hypervisor GDT
    fn selectors(&self) -> ArchSelectors;

    /// The host capability flags gating conditional patch points
    fn capabilities(&self) -> CpuCapabilities;
}
