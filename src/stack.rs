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

use tracing::{Span, instrument};

use crate::Result;
use crate::config::VmmConfiguration;
use crate::error::WorldSwitchError;
use crate::mem::PAGE_SIZE_USIZE;
use crate::services::MemoryServices;

/// The fixed-size stack hypervisor code runs on in guest context. It is
/// dual-mapped: the host sees the buffer directly, guest-context code
/// sees it at `guest_base`. The stack grows down from [`Self::bottom`].
///
/// Invariant: `bottom() - capacity() <= sp() <= bottom()` at every
/// transition boundary.
pub struct HypervisorStack {
    buf: Vec<u8>,
    guest_base: u64,
    sp: u64,
}

impl HypervisorStack {
    /// The pattern unused stack bytes are filled with before a
    /// trampoline call, making consumed depth visible in dumps
    pub const FILL_BYTE: u8 = 0xaa;

    /// Allocate the stack, map it into the guest hypervisor area, and in
    /// strict builds bracket it with guard pages.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(config: &VmmConfiguration, mem: &mut dyn MemoryServices) -> Result<Self> {
        let size = config.get_stack_size().div_ceil(PAGE_SIZE_USIZE) * PAGE_SIZE_USIZE;
        let buf = vec![0u8; size];
        let guest_base = mem.map_into_guest(buf.as_ptr() as u64, size)?;
        cfg_if::cfg_if! {
            if #[cfg(feature = "strict-stack")] {
                let page = u64::try_from(PAGE_SIZE_USIZE)?;
                mem.reserve_guard_region(guest_base - page, PAGE_SIZE_USIZE)?;
                mem.reserve_guard_region(guest_base + u64::try_from(size)?, PAGE_SIZE_USIZE)?;
            }
        }
        let mut stack = Self {
            buf,
            guest_base,
            sp: 0,
        };
        stack.sp = stack.bottom();
        Ok(stack)
    }

    /// The stack's capacity in bytes (page granular)
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The guest address just past the highest stack byte; the initial
    /// stack pointer
    pub fn bottom(&self) -> u64 {
        self.guest_base + self.buf.len() as u64
    }

    /// The current guest-space stack pointer
    pub fn sp(&self) -> u64 {
        self.sp
    }

    /// Set the stack pointer, rejecting values outside the stack
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_sp(&mut self, sp: u64) -> Result<()> {
        if sp < self.guest_base || sp > self.bottom() {
            return Err(WorldSwitchError::BoundsCheckFailed(sp, self.capacity()));
        }
        self.sp = sp;
        Ok(())
    }

    /// Overwrite the whole buffer with [`Self::FILL_BYTE`]
    pub fn fill(&mut self) {
        self.buf.fill(Self::FILL_BYTE);
    }

    /// Push one 32-bit word
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn push_u32(&mut self, val: u32) -> Result<()> {
        let new_sp = self.sp.wrapping_sub(4);
        if new_sp < self.guest_base || new_sp > self.bottom() {
            return Err(WorldSwitchError::BoundsCheckFailed(new_sp, self.capacity()));
        }
        let idx = usize::try_from(new_sp - self.guest_base)?;
        self.buf[idx..idx + 4].copy_from_slice(&val.to_le_bytes());
        self.sp = new_sp;
        Ok(())
    }

    /// Place a call frame of argument words at the bottom of the stack:
    /// `args` are written in call order starting at `bottom - 4 * N`
    /// (first argument nearest the resulting stack pointer), and the
    /// stack pointer is left at `bottom - 4 * N`.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn place_frame(&mut self, args: &[u32]) -> Result<()> {
        let frame = args
            .len()
            .checked_mul(4)
            .ok_or_else(|| WorldSwitchError::Error("argument frame too large".to_string()))?;
        if frame > self.capacity() {
            return Err(WorldSwitchError::BoundsCheckFailed(
                frame as u64,
                self.capacity(),
            ));
        }
        let start = self.capacity() - frame;
        for (i, arg) in args.iter().enumerate() {
            let idx = start + i * 4;
            self.buf[idx..idx + 4].copy_from_slice(&arg.to_le_bytes());
        }
        self.sp = self.bottom() - frame as u64;
        Ok(())
    }

    /// Shift the guest-space pointers after the hypervisor area moved by
    /// `delta` bytes
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn relocate(&mut self, delta: i64) {
        self.guest_base = self.guest_base.wrapping_add_signed(delta);
        self.sp = self.sp.wrapping_add_signed(delta);
    }

    /// The raw stack bytes, lowest address first
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable access to the raw stack bytes, for saved-state restore
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::HypervisorStack;
    use crate::config::VmmConfiguration;
    use crate::testing::MockMemory;

    fn stack() -> HypervisorStack {
        let config = VmmConfiguration::default();
        let mut mem = MockMemory::new();
        HypervisorStack::new(&config, &mut mem).unwrap()
    }

    #[test]
    fn starts_empty_at_bottom() {
        let stack = stack();
        assert_eq!(stack.bottom(), stack.sp());
        assert_eq!(VmmConfiguration::DEFAULT_STACK_SIZE, stack.capacity());
    }

    #[test]
    fn push_moves_down_and_bounds() {
        let mut stack = stack();
        stack.push_u32(0xdead_beef).unwrap();
        assert_eq!(stack.bottom() - 4, stack.sp());
        let len = stack.capacity();
        assert_eq!(
            0xdead_beefu32,
            u32::from_le_bytes(stack.bytes()[len - 4..len].try_into().unwrap())
        );

        // drain to the top, then one more must fail
        while stack.sp() > stack.bottom() - stack.capacity() as u64 {
            stack.push_u32(0).unwrap();
        }
        assert!(stack.push_u32(0).is_err());
    }

    #[test]
    fn place_frame_orders_args() {
        let mut stack = stack();
        stack.fill();
        stack.place_frame(&[1, 2, 3]).unwrap();
        assert_eq!(stack.bottom() - 12, stack.sp());
        let len = stack.capacity();
        let words: Vec<u32> = stack.bytes()[len - 12..]
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vec![1, 2, 3], words);
    }

    #[test]
    fn relocate_shifts_pointers() {
        let mut stack = stack();
        stack.push_u32(7).unwrap();
        let bottom = stack.bottom();
        let sp = stack.sp();
        stack.relocate(0x1000);
        assert_eq!(bottom + 0x1000, stack.bottom());
        assert_eq!(sp + 0x1000, stack.sp());
        stack.relocate(-0x1000);
        assert_eq!(bottom, stack.bottom());
        assert_eq!(sp, stack.sp());
    }

    #[cfg(feature = "strict-stack")]
    #[test]
    fn strict_builds_bracket_with_guard_pages() {
        let config = VmmConfiguration::default();
        let mut mem = MockMemory::new();
        let stack = HypervisorStack::new(&config, &mut mem).unwrap();
        let guards = mem.guard_regions();
        assert_eq!(2, guards.len());
        assert_eq!(stack.bottom() - stack.capacity() as u64 - 0x1000, guards[0].0);
        assert_eq!(stack.bottom(), guards[1].0);
    }

    #[cfg(not(feature = "strict-stack"))]
    #[test]
    fn default_builds_reserve_no_guard_pages() {
        let config = VmmConfiguration::default();
        let mut mem = MockMemory::new();
        let _stack = HypervisorStack::new(&config, &mut mem).unwrap();
        assert!(mem.guard_regions().is_empty());
    }

    #[test]
    fn set_sp_rejects_out_of_range() {
        let mut stack = stack();
        assert!(stack.set_sp(stack.bottom() + 4).is_err());
        let top = stack.bottom() - stack.capacity() as u64;
        assert!(stack.set_sp(top).is_ok());
        assert!(stack.set_sp(top - 4).is_err());
    }
}
