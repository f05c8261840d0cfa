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

//! The fixup engine.
//!
//! Every switcher blob carries a compact byte stream of fixup records
//! describing the locations that must be patched once the blob's final
//! addresses in the host, identity and guest mappings are known. The
//! stream is decoded once into structured [`Fixup`] records; the apply
//! engine then rewrites the blob in place using [`TriBase`] arithmetic,
//! never raw integers.
//!
//! A malformed stream (unknown kind, truncated record) means every
//! subsequent offset is untrustworthy, so the decoder halts the process
//! rather than returning an error.

use tracing::{Span, instrument};

use super::SwitcherDefinition;
use crate::Result;
use crate::mem::ptr_offset::Offset;
use crate::mem::tri_addr::TriBase;

/// Selector values and the descriptor-table pointer supplied by the
/// architecture layer at relocation time
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ArchSelectors {
    /// The hypervisor code selector
    pub cs: u16,
    /// The hypervisor data selector
    pub ds: u16,
    /// The hypervisor task-state selector
    pub tss: u16,
    /// The 64-bit hypervisor code selector
    pub cs64: u16,
    /// The guest address of the hypervisor GDT
    pub gdt: u64,
}

/// Host CPU capabilities that gate the conditional patch points
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CpuCapabilities {
    /// Whether the host supports FXSAVE/FXRSTOR
    pub fxsave: bool,
    /// Whether SYSENTER/SYSEXIT is in use on the host
    pub sysenter: bool,
    /// Whether SYSCALL/SYSRET is in use on the host
    pub syscall: bool,
}

impl Default for CpuCapabilities {
    fn default() -> Self {
        Self {
            fxsave: true,
            sysenter: true,
            syscall: true,
        }
    }
}

/// One of the three mappings of the core-code image
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Space {
    /// The host ring-0 mapping
    Host,
    /// The identity (physical == virtual) mapping
    Identity,
    /// The guest mapping
    Guest,
}

/// The selector slots a raw selector-store fixup can write
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SelectorKind {
    /// The hypervisor code selector
    Code,
    /// The hypervisor data selector
    Data,
    /// The hypervisor task-state selector
    Tss,
    /// The 64-bit hypervisor code selector
    Code64,
}

/// The host capabilities a conditional jump patch can key on
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Capability {
    /// FXSAVE/FXRSTOR support
    Fxsave,
    /// SYSENTER/SYSEXIT in use
    Sysenter,
    /// SYSCALL/SYSRET in use
    Syscall,
}

/// A decoded fixup record. All offsets are blob-relative.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Fixup {
    /// A 32-bit relative displacement written at `at`: the distance from
    /// the end of the displacement field (resolved in `from`) to `target`
    /// (resolved in `to`)
    NearRel {
        /// Space the patched instruction executes in
        from: Space,
        /// Space the jump target lives in
        to: Space,
        /// Location of the rel32 field
        at: Offset,
        /// Blob-relative jump target
        target: Offset,
    },
    /// A 16:32 far pointer: 32-bit absolute target in `to` followed by a
    /// selector word (the guest code selector, or the 64-bit code
    /// selector for identity-space targets)
    Far32 {
        /// Space the far target lives in
        to: Space,
        /// Location of the 6-byte far pointer
        at: Offset,
        /// Blob-relative far target
        target: Offset,
    },
    /// A 32-bit absolute pointer into `to`
    Abs32 {
        /// Space the pointer resolves in
        to: Space,
        /// Location of the 4-byte pointer
        at: Offset,
        /// Blob-relative target
        target: Offset,
    },
    /// A 64-bit absolute pointer into `to`
    Abs64 {
        /// Space the pointer resolves in
        to: Space,
        /// Location of the 8-byte pointer
        at: Offset,
        /// Blob-relative target
        target: Offset,
    },
    /// A raw 16-bit selector store
    StoreSelector {
        /// Which selector value to store
        which: SelectorKind,
        /// Location of the selector word
        at: Offset,
    },
    /// The guest address of the TSS descriptor's second dword inside the
    /// hypervisor GDT, stored as a 32-bit pointer. The GDT lives outside
    /// the blob, so the value comes from the architecture layer, not from
    /// a blob-relative target.
    TssGdtEntry {
        /// Location of the 4-byte pointer
        at: Offset,
    },
    /// A feature-detection patch point: when the capability is absent,
    /// a `jmp rel32` bypassing the region is emitted at `at`; when it is
    /// present, the original five instruction bytes are written back
    CapabilityJump {
        /// The capability gating the patched region
        cap: Capability,
        /// Location of the 5-byte patch point
        at: Offset,
        /// Blob-relative target of the bypass jump
        target: Offset,
        /// The original instruction bytes, carried in the stream
        original: [u8; 5],
    },
}

// Wire kinds. The stream is a sequence of records each starting with one
// of these bytes, terminated by KIND_THE_END.
const KIND_THE_END: u8 = 0x00;
const KIND_HOST_2_GUEST_NEAR_REL: u8 = 0x01;
const KIND_HOST_2_ID_NEAR_REL: u8 = 0x02;
const KIND_ID_2_HOST_NEAR_REL: u8 = 0x03;
const KIND_ID_2_GUEST_NEAR_REL: u8 = 0x04;
const KIND_GUEST_2_HOST_NEAR_REL: u8 = 0x05;
const KIND_GUEST_2_ID_NEAR_REL: u8 = 0x06;
const KIND_GUEST_FAR32: u8 = 0x07;
const KIND_ID_FAR32: u8 = 0x08;
const KIND_GUEST_ABS32: u8 = 0x09;
const KIND_ID_ABS32: u8 = 0x0a;
const KIND_HOST_ABS64: u8 = 0x0b;
const KIND_STORE_CS: u8 = 0x0c;
const KIND_STORE_DS: u8 = 0x0d;
const KIND_STORE_TSS: u8 = 0x0e;
const KIND_STORE_CS64: u8 = 0x0f;
const KIND_TSS_GDT_ENTRY: u8 = 0x10;
const KIND_NO_FXSAVE_JMP: u8 = 0x11;
const KIND_NO_SYSENTER_JMP: u8 = 0x12;
const KIND_NO_SYSCALL_JMP: u8 = 0x13;

struct StreamReader<'a> {
    stream: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    fn new(stream: &'a [u8]) -> Self {
        Self { stream, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let Some(val) = self.stream.get(self.pos) else {
            panic!("truncated fixup stream at byte {}", self.pos);
        };
        self.pos += 1;
        *val
    }

    fn u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        for b in &mut bytes {
            *b = self.u8();
        }
        u32::from_le_bytes(bytes)
    }

    fn offset(&mut self) -> Offset {
        Offset::from(self.u32())
    }

    fn bytes5(&mut self) -> [u8; 5] {
        let mut bytes = [0u8; 5];
        for b in &mut bytes {
            *b = self.u8();
        }
        bytes
    }
}

/// Decode an encoded fixup stream into structured records.
///
/// An unknown kind or a truncated record is a programmer-error condition
/// (the table and the code that generated it are out of sync) and halts
/// the process.
#[instrument(skip_all, parent = Span::current(), level= "Trace")]
pub fn decode(stream: &[u8]) -> Vec<Fixup> {
    let mut reader = StreamReader::new(stream);
    let mut fixups = Vec::new();
    loop {
        let kind = reader.u8();
        let fixup = match kind {
            KIND_THE_END => return fixups,
            KIND_HOST_2_GUEST_NEAR_REL => Fixup::NearRel {
                from: Space::Host,
                to: Space::Guest,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_HOST_2_ID_NEAR_REL => Fixup::NearRel {
                from: Space::Host,
                to: Space::Identity,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_ID_2_HOST_NEAR_REL => Fixup::NearRel {
                from: Space::Identity,
                to: Space::Host,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_ID_2_GUEST_NEAR_REL => Fixup::NearRel {
                from: Space::Identity,
                to: Space::Guest,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_GUEST_2_HOST_NEAR_REL => Fixup::NearRel {
                from: Space::Guest,
                to: Space::Host,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_GUEST_2_ID_NEAR_REL => Fixup::NearRel {
                from: Space::Guest,
                to: Space::Identity,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_GUEST_FAR32 => Fixup::Far32 {
                to: Space::Guest,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_ID_FAR32 => Fixup::Far32 {
                to: Space::Identity,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_GUEST_ABS32 => Fixup::Abs32 {
                to: Space::Guest,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_ID_ABS32 => Fixup::Abs32 {
                to: Space::Identity,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_HOST_ABS64 => Fixup::Abs64 {
                to: Space::Host,
                at: reader.offset(),
                target: reader.offset(),
            },
            KIND_STORE_CS => Fixup::StoreSelector {
                which: SelectorKind::Code,
                at: reader.offset(),
            },
            KIND_STORE_DS => Fixup::StoreSelector {
                which: SelectorKind::Data,
                at: reader.offset(),
            },
            KIND_STORE_TSS => Fixup::StoreSelector {
                which: SelectorKind::Tss,
                at: reader.offset(),
            },
            KIND_STORE_CS64 => Fixup::StoreSelector {
                which: SelectorKind::Code64,
                at: reader.offset(),
            },
            KIND_TSS_GDT_ENTRY => Fixup::TssGdtEntry {
                at: reader.offset(),
            },
            KIND_NO_FXSAVE_JMP => Fixup::CapabilityJump {
                cap: Capability::Fxsave,
                at: reader.offset(),
                target: reader.offset(),
                original: reader.bytes5(),
            },
            KIND_NO_SYSENTER_JMP => Fixup::CapabilityJump {
                cap: Capability::Sysenter,
                at: reader.offset(),
                target: reader.offset(),
                original: reader.bytes5(),
            },
            KIND_NO_SYSCALL_JMP => Fixup::CapabilityJump {
                cap: Capability::Syscall,
                at: reader.offset(),
                target: reader.offset(),
                original: reader.bytes5(),
            },
            unknown => panic!(
                "unknown fixup kind {:#04x} at stream byte {}",
                unknown,
                reader.pos - 1
            ),
        };
        fixups.push(fixup);
    }
}

/// Everything a relocation callback needs: the blob's three mapping bases
/// plus the selector values and capability flags of the host.
#[derive(Debug, Clone, Copy)]
pub struct RelocationCtx {
    /// The blob's base address in all three mappings
    pub tri: TriBase,
    /// Selector values to store at selector fixup points
    pub selectors: ArchSelectors,
    /// Capability flags gating the conditional patch points
    pub caps: CpuCapabilities,
}

impl RelocationCtx {
    fn resolve(&self, space: Space, off: Offset) -> Result<u64> {
        let addr = self.tri.address_of(off);
        match space {
            Space::Host => addr.in_host(),
            Space::Identity => addr.in_identity(),
            Space::Guest => addr.in_guest(),
        }
    }
}

fn write_u16(code: &mut [u8], at: usize, val: u16) {
    code[at..at + 2].copy_from_slice(&val.to_le_bytes());
}

fn write_u32(code: &mut [u8], at: usize, val: u32) {
    code[at..at + 4].copy_from_slice(&val.to_le_bytes());
}

fn write_u64(code: &mut [u8], at: usize, val: u64) {
    code[at..at + 8].copy_from_slice(&val.to_le_bytes());
}

#[cfg(debug_assertions)]
fn assert_in_region(def: &SwitcherDefinition, space: Space, target: Offset) {
    let off = u32::try_from(u64::from(target)).unwrap_or(u32::MAX);
    debug_assert!(
        def.space_contains(space, off),
        "{}: fixup target {:#x} outside every {:?} region",
        def.description,
        off,
        space
    );
}

#[cfg(not(debug_assertions))]
fn assert_in_region(_def: &SwitcherDefinition, _space: Space, _target: Offset) {}

/// Apply `fixups` (the records decoded from `def`'s stream at image-build
/// time) to `code`, the blob's bytes inside the writable image mapping.
#[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
pub fn apply(
    def: &SwitcherDefinition,
    ctx: &RelocationCtx,
    fixups: &[Fixup],
    code: &mut [u8],
) -> Result<()> {
    for fixup in fixups {
        apply_one(def, ctx, code, fixup)?;
    }
    Ok(())
}

fn apply_one(
    def: &SwitcherDefinition,
    ctx: &RelocationCtx,
    code: &mut [u8],
    fixup: &Fixup,
) -> Result<()> {
    match *fixup {
        Fixup::NearRel {
            from,
            to,
            at,
            target,
        } => {
            assert_in_region(def, to, target);
            let src_end = ctx.resolve(from, at)?.wrapping_add(4);
            let dst = ctx.resolve(to, target)?;
            write_u32(code, usize::try_from(at)?, dst.wrapping_sub(src_end) as u32);
        }
        Fixup::Far32 { to, at, target } => {
            assert_in_region(def, to, target);
            let dst = ctx.resolve(to, target)?;
            let at = usize::try_from(at)?;
            write_u32(code, at, dst as u32);
            let selector = match to {
                Space::Identity => ctx.selectors.cs64,
                _ => ctx.selectors.cs,
            };
            write_u16(code, at + 4, selector);
        }
        Fixup::Abs32 { to, at, target } => {
            assert_in_region(def, to, target);
            let dst = ctx.resolve(to, target)?;
            write_u32(code, usize::try_from(at)?, dst as u32);
        }
        Fixup::Abs64 { to, at, target } => {
            assert_in_region(def, to, target);
            let dst = ctx.resolve(to, target)?;
            write_u64(code, usize::try_from(at)?, dst);
        }
        Fixup::StoreSelector { which, at } => {
            let selector = match which {
                SelectorKind::Code => ctx.selectors.cs,
                SelectorKind::Data => ctx.selectors.ds,
                SelectorKind::Tss => ctx.selectors.tss,
                SelectorKind::Code64 => ctx.selectors.cs64,
            };
            write_u16(code, usize::try_from(at)?, selector);
        }
        Fixup::TssGdtEntry { at } => {
            // second dword of the TSS descriptor: gdt + (tss & ~7) + 4
            let dw2 = ctx
                .selectors
                .gdt
                .wrapping_add(u64::from(ctx.selectors.tss & !7))
                .wrapping_add(4);
            write_u32(code, usize::try_from(at)?, dw2 as u32);
        }
        Fixup::CapabilityJump {
            cap,
            at,
            target,
            original,
        } => {
            let present = match cap {
                Capability::Fxsave => ctx.caps.fxsave,
                Capability::Sysenter => ctx.caps.sysenter,
                Capability::Syscall => ctx.caps.syscall,
            };
            let at_usize = usize::try_from(at)?;
            if present {
                code[at_usize..at_usize + 5].copy_from_slice(&original);
            } else {
                // jmp rel32 past the gated region; both offsets are in the
                // same space so the displacement is blob-relative
                let rel = (u64::from(target) as u32).wrapping_sub(u64::from(at) as u32 + 5);
                code[at_usize] = 0xe9;
                write_u32(code, at_usize + 1, rel);
            }
        }
    }
    Ok(())
}
