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

//! In-memory doubles for the collaborator traits, shared by the unit
//! tests.

use std::collections::HashMap;

use crate::Result;
use crate::driver::host_call::{CallHostRequest, HostCallOp};
use crate::driver::{RESUME_GUEST_SYMBOL, RESUME_GUEST_V86_SYMBOL};
use crate::error::WorldSwitchError;
use crate::mem::ptr::RawPtr;
use crate::services::{
    ArchServices, ContiguousAlloc, GuestExecutor, HostServices, LoaderServices, MemoryServices,
    RunExit, TimerService,
};
use crate::switcher::fixup::{ArchSelectors, CpuCapabilities};

const HOST_RING0_BASE: u64 = 0xffff_8000_0040_0000;
const PHYS_BASE: u64 = 0x0040_0000;
const GUEST_BASE: u64 = 0xa000_0000;

/// A page-level memory manager double with a scriptable number of
/// identity-mapping conflicts.
pub(crate) struct MockMemory {
    alloc_count: usize,
    live: Vec<ContiguousAlloc>,
    conflicts_remaining: usize,
    fail_guest_unmap: bool,
    intermediate: Vec<u64>,
    guest_cursor: u64,
    guest_delta: i64,
    guest_mappings: HashMap<u64, u64>,
    guards: Vec<(u64, usize)>,
}

impl MockMemory {
    pub(crate) fn new() -> Self {
        Self {
            alloc_count: 0,
            live: Vec::new(),
            conflicts_remaining: 0,
            fail_guest_unmap: false,
            intermediate: Vec::new(),
            guest_cursor: GUEST_BASE,
            guest_delta: 0,
            guest_mappings: HashMap::new(),
            guards: Vec::new(),
        }
    }

    /// Fail the first `n` intermediate-mapping attempts with a conflict
    pub(crate) fn with_intermediate_conflicts(mut self, n: usize) -> Self {
        self.conflicts_remaining = n;
        self
    }

    /// Fail every attempt to unmap a guest mapping
    pub(crate) fn with_failing_guest_unmap(mut self) -> Self {
        self.fail_guest_unmap = true;
        self
    }

    /// Total allocations handed out
    pub(crate) fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    /// Allocations handed out and not yet freed
    pub(crate) fn live_allocs(&self) -> usize {
        self.live.len()
    }

    /// Simulate the guest hypervisor area moving by `delta` bytes
    pub(crate) fn move_guest_area(&mut self, delta: i64) {
        self.guest_delta += delta;
    }

    /// The guard regions reserved so far
    pub(crate) fn guard_regions(&self) -> &[(u64, usize)] {
        &self.guards
    }
}

impl MemoryServices for MockMemory {
    fn alloc_contiguous(&mut self, size: usize) -> Result<ContiguousAlloc> {
        let slot = u64::try_from(self.alloc_count)? * u64::try_from(size.max(0x1000))?;
        self.alloc_count += 1;
        let alloc = ContiguousAlloc {
            host_ring0: HOST_RING0_BASE + slot,
            phys: PHYS_BASE + slot,
        };
        self.live.push(alloc);
        Ok(alloc)
    }

    fn free_contiguous(&mut self, alloc: &ContiguousAlloc) -> Result<()> {
        let before = self.live.len();
        self.live.retain(|a| a != alloc);
        if self.live.len() == before {
            return Err(WorldSwitchError::Error("freeing unknown allocation".to_string()));
        }
        Ok(())
    }

    fn map_intermediate(&mut self, phys: u64, _size: usize) -> Result<()> {
        if self.conflicts_remaining > 0 {
            self.conflicts_remaining = self.conflicts_remaining.saturating_sub(1);
            return Err(WorldSwitchError::IntermediateMappingConflict(phys));
        }
        self.intermediate.push(phys);
        Ok(())
    }

    fn unmap_intermediate(&mut self, phys: u64, _size: usize) -> Result<()> {
        self.intermediate.retain(|p| *p != phys);
        Ok(())
    }

    fn map_into_guest(&mut self, host: u64, size: usize) -> Result<u64> {
        let guest = self.guest_cursor;
        self.guest_cursor += u64::try_from(size)? + 0x1000;
        self.guest_mappings.insert(host, guest);
        Ok(guest)
    }

    fn unmap_from_guest(&mut self, _guest: u64, _size: usize) -> Result<()> {
        if self.fail_guest_unmap {
            return Err(WorldSwitchError::Error("guest unmap refused".to_string()));
        }
        Ok(())
    }

    fn host_to_guest(&self, host: u64) -> Result<u64> {
        let guest = self
            .guest_mappings
            .get(&host)
            .ok_or_else(|| WorldSwitchError::Error("host address not mapped".to_string()))?;
        Ok(guest.wrapping_add_signed(self.guest_delta))
    }

    fn reserve_guard_region(&mut self, guest: u64, size: usize) -> Result<()> {
        self.guards.push((guest, size));
        Ok(())
    }
}

/// A guest executor double that replays a scripted sequence of exits.
pub(crate) struct MockExecutor {
    script: Vec<RunExit>,
    next: usize,
    transitions: usize,
    guest_drains: usize,
    ring0_drains: usize,
    resume_target: u64,
    stack_pointer: u64,
    is_v86: bool,
    request: CallHostRequest,
    assertion: (String, String),
    entries: Vec<u64>,
}

impl MockExecutor {
    pub(crate) fn new(script: Vec<RunExit>) -> Self {
        Self {
            script,
            next: 0,
            transitions: 0,
            guest_drains: 0,
            ring0_drains: 0,
            resume_target: 0,
            stack_pointer: 0,
            is_v86: false,
            request: CallHostRequest::new(),
            assertion: (String::new(), String::new()),
            entries: Vec::new(),
        }
    }

    pub(crate) fn v86(mut self, v86: bool) -> Self {
        self.is_v86 = v86;
        self
    }

    pub(crate) fn file_host_call(&mut self, op: HostCallOp, arg: u64) {
        self.request.file(op, arg);
    }

    pub(crate) fn set_assertion_text(&mut self, msg1: &str, msg2: &str) {
        self.assertion = (msg1.to_string(), msg2.to_string());
    }

    pub(crate) fn transition_count(&self) -> usize {
        self.transitions
    }

    pub(crate) fn guest_drains(&self) -> usize {
        self.guest_drains
    }

    pub(crate) fn ring0_drains(&self) -> usize {
        self.ring0_drains
    }

    pub(crate) fn resume_target(&self) -> u64 {
        self.resume_target
    }

    pub(crate) fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    /// Host ring-0 entry addresses passed to `switch_to_guest`
    pub(crate) fn entries(&self) -> &[u64] {
        &self.entries
    }

    fn step(&mut self) -> Result<RunExit> {
        self.transitions += 1;
        let Some(exit) = self.script.get(self.next) else {
            panic!("executor script exhausted after {} transitions", self.next);
        };
        self.next += 1;
        Ok(*exit)
    }
}

impl GuestExecutor for MockExecutor {
    fn switch_to_guest(&mut self, entry: u64) -> Result<RunExit> {
        self.entries.push(entry);
        self.step()
    }

    fn resume(&mut self) -> Result<RunExit> {
        self.step()
    }

    fn set_resume_target(&mut self, target: u64) {
        self.resume_target = target;
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.stack_pointer = sp;
    }

    fn is_v86(&self) -> bool {
        self.is_v86
    }

    fn host_call_request(&mut self) -> &mut CallHostRequest {
        &mut self.request
    }

    fn assertion_text(&self) -> (String, String) {
        self.assertion.clone()
    }

    fn drain_guest_log(&mut self) {
        self.guest_drains += 1;
    }

    fn drain_ring0_log(&mut self) {
        self.ring0_drains += 1;
    }
}

/// A host-services double that answers every operation with its argument.
pub(crate) struct MockHost {
    failing: bool,
    grow_pool_calls: usize,
    total_calls: usize,
}

impl MockHost {
    pub(crate) fn new() -> Self {
        Self {
            failing: false,
            grow_pool_calls: 0,
            total_calls: 0,
        }
    }

    /// Make every operation fail
    pub(crate) fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub(crate) fn grow_pool_calls(&self) -> usize {
        self.grow_pool_calls
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.total_calls
    }

    fn answer(&mut self, arg: u64) -> Result<u64> {
        self.total_calls += 1;
        if self.failing {
            return Err(WorldSwitchError::Error("host service failed".to_string()));
        }
        Ok(arg)
    }
}

impl HostServices for MockHost {
    fn acquire_lock(&mut self, arg: u64) -> Result<u64> {
        self.answer(arg)
    }

    fn flush_queue(&mut self, arg: u64) -> Result<u64> {
        self.answer(arg)
    }

    fn grow_pool(&mut self, arg: u64) -> Result<u64> {
        self.grow_pool_calls += 1;
        self.answer(arg)
    }

    fn map_chunk(&mut self, arg: u64) -> Result<u64> {
        self.answer(arg)
    }

    fn allocate_pages(&mut self, arg: u64) -> Result<u64> {
        self.answer(arg)
    }

    fn replay_notifications(&mut self, arg: u64) -> Result<u64> {
        self.answer(arg)
    }

    fn set_error(&mut self, arg: u64) -> Result<u64> {
        self.answer(arg)
    }

    fn set_runtime_error(&mut self, arg: u64) -> Result<u64> {
        self.answer(arg)
    }
}

/// A loader double with a small fixed symbol table.
pub(crate) struct MockLoader {
    symbols: HashMap<String, u64>,
}

impl MockLoader {
    pub(crate) fn new() -> Self {
        let mut symbols = HashMap::new();
        symbols.insert(RESUME_GUEST_SYMBOL.to_string(), 0xa0f0_0000);
        symbols.insert(RESUME_GUEST_V86_SYMBOL.to_string(), 0xa0f0_0100);
        Self { symbols }
    }

    pub(crate) fn with_symbol(mut self, name: &str, addr: u64) -> Self {
        self.symbols.insert(name.to_string(), addr);
        self
    }
}

impl LoaderServices for MockLoader {
    fn guest_symbol(&self, name: &str) -> Result<RawPtr> {
        self.symbols
            .get(name)
            .map(|addr| RawPtr::from(*addr))
            .ok_or_else(|| WorldSwitchError::Error(format!("symbol {name} not found")))
    }

    fn nearest_symbol(&self, guest_addr: u64) -> Option<(String, u64)> {
        self.symbols
            .iter()
            .filter(|(_, addr)| **addr <= guest_addr)
            .max_by_key(|(_, addr)| **addr)
            .map(|(name, addr)| (name.clone(), *addr))
    }
}

/// An architecture-services double with fixed selectors and all
/// capabilities present.
pub(crate) struct MockArch {
    selectors: ArchSelectors,
    caps: CpuCapabilities,
}

impl MockArch {
    pub(crate) fn new() -> Self {
        Self {
            selectors: ArchSelectors {
                cs: 0x08,
                ds: 0x10,
                tss: 0x28,
                cs64: 0x38,
                gdt: 0xa0e1_0000,
            },
            caps: CpuCapabilities::default(),
        }
    }

    pub(crate) fn without_sysenter(mut self) -> Self {
        self.caps.sysenter = false;
        self
    }
}

impl ArchServices for MockArch {
    fn selectors(&self) -> ArchSelectors {
        self.selectors
    }

    fn capabilities(&self) -> CpuCapabilities {
        self.caps
    }
}

/// A timer-service double with manually advanced time.
pub(crate) struct MockTimer {
    pub(crate) now: u64,
    pub(crate) lag: u64,
    yields: usize,
    armed: Vec<u32>,
    expiry: Option<u64>,
    cancels: usize,
}

impl MockTimer {
    pub(crate) fn new() -> Self {
        Self {
            now: 0,
            lag: 0,
            yields: 0,
            armed: Vec::new(),
            expiry: None,
            cancels: 0,
        }
    }

    pub(crate) fn yields(&self) -> usize {
        self.yields
    }

    pub(crate) fn armed(&self) -> &[u32] {
        &self.armed
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels
    }
}

impl TimerService for MockTimer {
    fn now_millis(&self) -> u64 {
        self.now
    }

    fn virtual_sync_lag_millis(&self) -> u64 {
        self.lag
    }

    fn yield_now(&mut self) {
        self.yields += 1;
    }

    fn arm_yield_timer(&mut self, millis: u32) {
        self.armed.push(millis);
        self.expiry = Some(self.now + u64::from(millis));
    }

    fn cancel_yield_timer(&mut self) {
        self.expiry = None;
        self.cancels += 1;
    }

    fn yield_timer_expiry(&self) -> Option<u64> {
        self.expiry
    }
}
