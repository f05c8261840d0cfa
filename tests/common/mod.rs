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

//! Collaborator doubles for driving the crate through its public API.

use std::collections::{HashMap, VecDeque};

use worldswitch::driver::host_call::{CallHostRequest, HostCallOp};
use worldswitch::mem::ptr::RawPtr;
use worldswitch::services::{
    ArchServices, ContiguousAlloc, GuestExecutor, HostServices, LoaderServices, MemoryServices,
    RunExit,
};
use worldswitch::switcher::fixup::{ArchSelectors, CpuCapabilities};
use worldswitch::{Result, WorldSwitchError, new_error};

pub const HOST_RING0_BASE: u64 = 0xffff_8000_1000_0000;
pub const PHYS_BASE: u64 = 0x0080_0000;
pub const GUEST_HYPER_BASE: u64 = 0xa000_0000;

pub const RESUME_GUEST_ADDR: u64 = 0xa0f0_0000;
pub const RESUME_GUEST_V86_ADDR: u64 = 0xa0f0_0100;

/// A page-table-free memory manager: hands out addresses from three
/// bump cursors and keeps the host-to-guest translations it has made.
pub struct TestMemory {
    next_host: u64,
    next_phys: u64,
    next_guest: u64,
    guest_mappings: HashMap<u64, u64>,
    live: Vec<ContiguousAlloc>,
    conflicts_remaining: usize,
    alloc_count: usize,
}

impl TestMemory {
    pub fn new() -> Self {
        Self {
            next_host: HOST_RING0_BASE,
            next_phys: PHYS_BASE,
            next_guest: GUEST_HYPER_BASE,
            guest_mappings: HashMap::new(),
            live: Vec::new(),
            conflicts_remaining: 0,
            alloc_count: 0,
        }
    }

    /// Fail the next `n` intermediate mappings with a conflict
    pub fn with_intermediate_conflicts(mut self, n: usize) -> Self {
        self.conflicts_remaining = n;
        self
    }

    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    pub fn live_allocs(&self) -> usize {
        self.live.len()
    }
}

impl MemoryServices for TestMemory {
    fn alloc_contiguous(&mut self, size: usize) -> Result<ContiguousAlloc> {
        let alloc = ContiguousAlloc {
            host_ring0: self.next_host,
            phys: self.next_phys,
        };
        let size = u64::try_from(size)?;
        self.next_host += size;
        self.next_phys += size;
        self.alloc_count += 1;
        self.live.push(alloc);
        Ok(alloc)
    }

    fn free_contiguous(&mut self, alloc: &ContiguousAlloc) -> Result<()> {
        match self.live.iter().position(|a| a == alloc) {
            Some(idx) => {
                self.live.remove(idx);
                Ok(())
            }
            None => Err(new_error!("free of an unknown allocation")),
        }
    }

    fn map_intermediate(&mut self, phys: u64, _size: usize) -> Result<()> {
        if self.conflicts_remaining > 0 {
            self.conflicts_remaining -= 1;
            return Err(WorldSwitchError::IntermediateMappingConflict(phys));
        }
        Ok(())
    }

    fn unmap_intermediate(&mut self, _phys: u64, _size: usize) -> Result<()> {
        Ok(())
    }

    fn map_into_guest(&mut self, host: u64, size: usize) -> Result<u64> {
        let guest = self.next_guest;
        self.next_guest += u64::try_from(size)?;
        self.guest_mappings.insert(host, guest);
        Ok(guest)
    }

    fn unmap_from_guest(&mut self, _guest: u64, _size: usize) -> Result<()> {
        Ok(())
    }

    fn host_to_guest(&self, host: u64) -> Result<u64> {
        self.guest_mappings
            .get(&host)
            .copied()
            .ok_or_else(|| new_error!("host address {:#x} is not guest-mapped", host))
    }

    fn reserve_guard_region(&mut self, _guest: u64, _size: usize) -> Result<()> {
        Ok(())
    }
}

/// A scripted transition primitive: each entry or resume consumes the
/// next exit from the script.
pub struct TestExecutor {
    script: VecDeque<RunExit>,
    request: CallHostRequest,
    resume_target: u64,
    stack_pointer: u64,
    transitions: usize,
}

impl TestExecutor {
    pub fn new(script: Vec<RunExit>) -> Self {
        Self {
            script: script.into(),
            request: CallHostRequest::new(),
            resume_target: 0,
            stack_pointer: 0,
            transitions: 0,
        }
    }

    /// File a host call serviced on the script's next `CallHost` exit
    pub fn file_host_call(&mut self, op: HostCallOp, arg: u64) {
        self.request.file(op, arg);
    }

    pub fn transitions(&self) -> usize {
        self.transitions
    }

    pub fn last_result(&self) -> u64 {
        self.request.result
    }

    fn next_exit(&mut self) -> Result<RunExit> {
        self.transitions += 1;
        match self.script.pop_front() {
            Some(exit) => Ok(exit),
            None => panic!("executor script exhausted"),
        }
    }
}

impl GuestExecutor for TestExecutor {
    fn switch_to_guest(&mut self, _entry: u64) -> Result<RunExit> {
        self.next_exit()
    }

    fn resume(&mut self) -> Result<RunExit> {
        self.next_exit()
    }

    fn set_resume_target(&mut self, target: u64) {
        self.resume_target = target;
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.stack_pointer = sp;
    }

    fn is_v86(&self) -> bool {
        false
    }

    fn host_call_request(&mut self) -> &mut CallHostRequest {
        &mut self.request
    }

    fn assertion_text(&self) -> (String, String) {
        ("assertion".to_string(), String::new())
    }

    fn drain_guest_log(&mut self) {}

    fn drain_ring0_log(&mut self) {}
}

/// Answers every request with its argument and counts dispatches.
#[derive(Default)]
pub struct TestHost {
    calls: Vec<(&'static str, u64)>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[(&'static str, u64)] {
        &self.calls
    }

    fn note(&mut self, what: &'static str, arg: u64) -> Result<u64> {
        self.calls.push((what, arg));
        Ok(arg)
    }
}

impl HostServices for TestHost {
    fn acquire_lock(&mut self, arg: u64) -> Result<u64> {
        self.note("acquire_lock", arg)
    }

    fn flush_queue(&mut self, arg: u64) -> Result<u64> {
        self.note("flush_queue", arg)
    }

    fn grow_pool(&mut self, arg: u64) -> Result<u64> {
        self.note("grow_pool", arg)
    }

    fn map_chunk(&mut self, arg: u64) -> Result<u64> {
        self.note("map_chunk", arg)
    }

    fn allocate_pages(&mut self, arg: u64) -> Result<u64> {
        self.note("allocate_pages", arg)
    }

    fn replay_notifications(&mut self, arg: u64) -> Result<u64> {
        self.note("replay_notifications", arg)
    }

    fn set_error(&mut self, arg: u64) -> Result<u64> {
        self.note("set_error", arg)
    }

    fn set_runtime_error(&mut self, arg: u64) -> Result<u64> {
        self.note("set_runtime_error", arg)
    }
}

/// A symbol table seeded with the required resume symbols.
pub struct TestLoader {
    symbols: HashMap<String, u64>,
}

impl TestLoader {
    pub fn new() -> Self {
        let mut symbols = HashMap::new();
        symbols.insert("resume_guest".to_string(), RESUME_GUEST_ADDR);
        symbols.insert("resume_guest_v86".to_string(), RESUME_GUEST_V86_ADDR);
        Self { symbols }
    }
}

impl LoaderServices for TestLoader {
    fn guest_symbol(&self, name: &str) -> Result<RawPtr> {
        self.symbols
            .get(name)
            .map(|addr| RawPtr::from(*addr))
            .ok_or_else(|| new_error!("symbol {} not found", name))
    }

    fn nearest_symbol(&self, guest_addr: u64) -> Option<(String, u64)> {
        self.symbols
            .iter()
            .filter(|(_, addr)| **addr <= guest_addr)
            .max_by_key(|(_, addr)| **addr)
            .map(|(name, addr)| (name.clone(), *addr))
    }
}

/// Ring-0 selector values and a fully capable host CPU.
pub struct TestArch;

impl ArchServices for TestArch {
    fn selectors(&self) -> ArchSelectors {
        ArchSelectors {
            cs: 0x08,
            ds: 0x10,
            tss: 0x28,
            cs64: 0x38,
            gdt: 0xa0e1_0000,
        }
    }

    fn capabilities(&self) -> CpuCapabilities {
        CpuCapabilities::default()
    }
}
