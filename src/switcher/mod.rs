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

/// The static switcher catalog
pub mod catalog;
/// The fixup record model, decoder and apply engine
pub mod fixup;

use tracing::{Span, instrument};

use self::fixup::{Fixup, RelocationCtx, Space};
use crate::Result;
use crate::error::WorldSwitchError;

/// Every host-addressing-mode to guest-addressing-mode combination a
/// switcher can exist for. Not every combination is implemented; looking
/// one of those up yields no definition.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum SwitcherKind {
    /// 32-bit host to 32-bit guest
    X32ToX32 = 0,
    /// 32-bit host to PAE guest
    X32ToPae = 1,
    /// 32-bit host to AMD64 guest
    X32ToAmd64 = 2,
    /// PAE host to 32-bit guest
    PaeToX32 = 3,
    /// PAE host to PAE guest
    PaeToPae = 4,
    /// PAE host to AMD64 guest
    PaeToAmd64 = 5,
    /// AMD64 host to PAE guest
    Amd64ToPae = 6,
    /// AMD64 host to AMD64 guest
    Amd64ToAmd64 = 7,
}

/// The number of `SwitcherKind` variants, which is also the size of the
/// catalog table.
pub const SWITCHER_KIND_COUNT: usize = 8;

impl SwitcherKind {
    /// Every kind, in catalog order
    pub fn all() -> [SwitcherKind; SWITCHER_KIND_COUNT] {
        [
            SwitcherKind::X32ToX32,
            SwitcherKind::X32ToPae,
            SwitcherKind::X32ToAmd64,
            SwitcherKind::PaeToX32,
            SwitcherKind::PaeToPae,
            SwitcherKind::PaeToAmd64,
            SwitcherKind::Amd64ToPae,
            SwitcherKind::Amd64ToAmd64,
        ]
    }
}

impl TryFrom<u8> for SwitcherKind {
    type Error = WorldSwitchError;
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    fn try_from(val: u8) -> Result<Self> {
        SwitcherKind::all()
            .into_iter()
            .find(|kind| *kind as u8 == val)
            .ok_or(WorldSwitchError::InvalidSwitcherIndex(val))
    }
}

/// A sub-region of a switcher blob, expressed as blob-relative bounds
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Region {
    /// Blob-relative start of the region
    pub offset: u32,
    /// Length of the region in bytes
    pub len: u32,
}

impl Region {
    /// Create a new region from its blob-relative start and length
    pub const fn new(offset: u32, len: u32) -> Self {
        Self { offset, len }
    }

    /// Whether the blob-relative offset `off` falls inside this region
    pub fn contains(&self, off: u32) -> bool {
        off >= self.offset && off < self.offset + self.len
    }
}

/// The immutable per-kind descriptor for one switcher: its code blob, the
/// sub-regions that execute in each address space, the named entry-point
/// offsets, the encoded fixup stream and the relocation callback that
/// drives the fixup engine with the right selector values.
///
/// Instances live in the static catalog and are never mutated.
pub struct SwitcherDefinition {
    /// Which combination this switcher implements
    pub kind: SwitcherKind,
    /// Human-readable description, used in logs and the fatal dump
    pub description: &'static str,
    /// The relocatable code blob
    pub code: &'static [u8],
    /// First region executing in the host ring-0 mapping
    pub host0: Region,
    /// First region executing in the identity mapping
    pub id0: Region,
    /// Region executing in the guest mapping
    pub guest: Region,
    /// Second region executing in the identity mapping
    pub id1: Region,
    /// Second region executing in the host ring-0 mapping
    pub host1: Region,
    /// The encoded fixup stream for this blob
    pub fixups: &'static [u8],
    /// The relocation callback: applies the blob's decoded fixup records
    /// with the selector values appropriate for this switcher's mode pair
    pub relocate: fn(&SwitcherDefinition, &RelocationCtx, &[Fixup], &mut [u8]) -> Result<()>,
    /// Blob-relative offset of the host-to-guest entry point
    pub off_host_to_guest: u32,
    /// Blob-relative offset of the guest-to-host entry point
    pub off_guest_to_host: u32,
    /// Blob-relative offset of the call trampoline entry point
    pub off_call_trampoline: u32,
    /// Blob-relative offset of the raw-asm guest-to-host entry
    pub off_guest_to_host_asm: u32,
    /// Blob-relative offset of the raw-asm guest-to-host entry that keeps
    /// the hypervisor context
    pub off_guest_to_host_asm_hyper_ctx: u32,
    /// Blob-relative offset of the raw-asm guest-to-host entry that keeps
    /// the guest context
    pub off_guest_to_host_asm_guest_ctx: u32,
}

impl SwitcherDefinition {
    /// Whether the blob-relative offset `off` falls inside a region
    /// declared for `space`
    pub fn space_contains(&self, space: Space, off: u32) -> bool {
        match space {
            Space::Host => self.host0.contains(off) || self.host1.contains(off),
            Space::Identity => self.id0.contains(off) || self.id1.contains(off),
            Space::Guest => self.guest.contains(off),
        }
    }
}

/// Look up the definition for `kind`. `None` means the combination is not
/// implemented on this host.
#[instrument(skip_all, parent = Span::current(), level= "Trace")]
pub fn lookup(kind: SwitcherKind) -> Option<&'static SwitcherDefinition> {
    catalog::CATALOG[kind as usize]
}

/// Iterate over every switcher present in the catalog
pub fn present() -> impl Iterator<Item = &'static SwitcherDefinition> {
    catalog::CATALOG.iter().flatten().copied()
}
