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

use super::PAGE_SIZE_USIZE;
use super::ptr_addr_space::AddressSpace;
use super::ptr_offset::Offset;
use super::tri_addr::TriBase;
use crate::config::VmmConfiguration;
use crate::error::WorldSwitchError;
use crate::services::{ContiguousAlloc, MemoryServices};
use crate::switcher::fixup::{self, ArchSelectors, CpuCapabilities, Fixup, RelocationCtx};
use crate::switcher::{SWITCHER_KIND_COUNT, SwitcherKind};
use crate::{Result, switcher};

/// The one contiguous block holding every present switcher blob, mapped
/// simultaneously into the host ring-0, identity and guest address
/// spaces.
///
/// Owned exclusively by one VM instance. The host and identity bases are
/// fixed once built; the guest base is recomputed on every relocation.
pub struct CoreCodeImage {
    buffer: Vec<u8>,
    alloc: ContiguousAlloc,
    size: usize,
    tri: TriBase,
    offsets: [Option<Offset>; SWITCHER_KIND_COUNT],
    fixups: [Vec<Fixup>; SWITCHER_KIND_COUNT],
}

impl CoreCodeImage {
    /// Each blob is aligned to this boundary within the image
    const BLOB_ALIGNMENT: u64 = 32;

    /// Lay out every present switcher blob, allocate backing memory with
    /// identity-mapping conflict retry, copy the blobs in, decode each
    /// blob's fixup stream, and map the image into the guest hypervisor
    /// area.
    ///
    /// On any failure every partial allocation and mapping is released.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn build(config: &VmmConfiguration, mem: &mut dyn MemoryServices) -> Result<Self> {
        let mut offsets: [Option<Offset>; SWITCHER_KIND_COUNT] = [None; SWITCHER_KIND_COUNT];
        let mut cursor = Offset::zero();
        for def in switcher::present() {
            offsets[def.kind as usize] = Some(cursor);
            // one spare byte after each blob keeps the following blob's
            // first instruction off a shared alignment slot
            let len = Offset::try_from(def.code.len() + 1)?;
            cursor = (cursor + len).round_up_to(Self::BLOB_ALIGNMENT);
        }
        let size = usize::try_from(cursor.round_up_to(u64::try_from(PAGE_SIZE_USIZE)?))?;

        let alloc = Self::alloc_with_retry(config, mem, size)?;

        let mut buffer = vec![0u8; size];
        let mut fixups: [Vec<Fixup>; SWITCHER_KIND_COUNT] = Default::default();
        for def in switcher::present() {
            if let Some(offset) = offsets[def.kind as usize] {
                let start = usize::try_from(offset)?;
                buffer[start..start + def.code.len()].copy_from_slice(def.code);
                fixups[def.kind as usize] = fixup::decode(def.fixups);
            }
        }

        let guest = match mem.map_into_guest(alloc.host_ring0, size) {
            Ok(guest) => guest,
            Err(e) => {
                Self::release_allocs(mem, &[alloc], size);
                return Err(WorldSwitchError::GuestMappingFailed(e.to_string()));
            }
        };

        let tri = TriBase::new(alloc.host_ring0, alloc.phys, guest);
        log::debug!(
            "core code image: {:#x} bytes, host ring-0 {:#x}, identity {:#x}, guest {:#x}",
            size,
            alloc.host_ring0,
            alloc.phys,
            guest
        );

        Ok(Self {
            buffer,
            alloc,
            size,
            tri,
            offsets,
            fixups,
        })
    }

    /// Allocate the image with bounded retry on identity-mapping
    /// conflicts. Conflicting allocations are kept alive until a mapping
    /// succeeds, otherwise the allocator would hand back the same pages
    /// on every attempt; they are all released before returning.
    fn alloc_with_retry(
        config: &VmmConfiguration,
        mem: &mut dyn MemoryServices,
        size: usize,
    ) -> Result<ContiguousAlloc> {
        let attempts = config.get_id_map_retry_attempts();
        let mut failed: Vec<ContiguousAlloc> = Vec::new();
        let mut chosen: Option<ContiguousAlloc> = None;
        for attempt in 1..=attempts {
            let alloc = match mem.alloc_contiguous(size) {
                Ok(alloc) => alloc,
                Err(e) => {
                    Self::release_failed(mem, &failed);
                    return Err(e);
                }
            };
            match mem.map_intermediate(alloc.phys, size) {
                Ok(()) => {
                    chosen = Some(alloc);
                    break;
                }
                Err(WorldSwitchError::IntermediateMappingConflict(addr)) => {
                    log::debug!(
                        "intermediate mapping at {:#x} conflicted on attempt {}, retrying",
                        addr,
                        attempt
                    );
                    failed.push(alloc);
                }
                Err(e) => {
                    Self::release_failed(mem, &failed);
                    Self::release_failed(mem, &[alloc]);
                    return Err(e);
                }
            }
        }
        Self::release_failed(mem, &failed);
        match chosen {
            Some(alloc) => Ok(alloc),
            None => Err(WorldSwitchError::IntermediateMappingExhausted(attempts)),
        }
    }

    fn release_failed(mem: &mut dyn MemoryServices, allocs: &[ContiguousAlloc]) {
        for alloc in allocs {
            if let Err(e) = mem.free_contiguous(alloc) {
                log::error!("failed to release contiguous allocation: {}", e);
            }
        }
    }

    fn release_allocs(mem: &mut dyn MemoryServices, allocs: &[ContiguousAlloc], size: usize) {
        for alloc in allocs {
            if let Err(e) = mem.unmap_intermediate(alloc.phys, size) {
                log::error!("failed to tear down intermediate mapping: {}", e);
            }
        }
        Self::release_failed(mem, allocs);
    }

    /// Total image size in bytes (page granular)
    pub fn size(&self) -> usize {
        self.size
    }

    /// The image's three mapping bases
    pub fn tri(&self) -> TriBase {
        self.tri
    }

    /// The image-relative offset `kind`'s blob was placed at, or `None`
    /// when the kind is not in the catalog
    pub fn offset_of(&self, kind: SwitcherKind) -> Option<Offset> {
        self.offsets[kind as usize]
    }

    /// The three mapping bases of `kind`'s blob within the image
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn blob_tri(&self, kind: SwitcherKind) -> Result<TriBase> {
        let offset = self
            .offset_of(kind)
            .ok_or(WorldSwitchError::SwitcherNotImplemented(kind))?;
        let addr = self.tri.address_of(offset);
        Ok(TriBase::new(
            addr.in_host()?,
            addr.in_identity()?,
            addr.in_guest()?,
        ))
    }

    /// The writable bytes of `kind`'s blob within the image
    // No #[instrument] here: the attribute wraps the body in a closure,
    // which cannot return a borrow of `self.buffer`.
    pub fn code_mut(&mut self, kind: SwitcherKind) -> Result<&mut [u8]> {
        let def = switcher::lookup(kind).ok_or(WorldSwitchError::SwitcherNotImplemented(kind))?;
        let offset = self
            .offset_of(kind)
            .ok_or(WorldSwitchError::SwitcherNotImplemented(kind))?;
        let start = usize::try_from(offset)?;
        Ok(&mut self.buffer[start..start + def.code.len()])
    }

    /// Run `kind`'s relocation callback over its blob with the given
    /// selector values and capability flags
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn apply_fixups(
        &mut self,
        kind: SwitcherKind,
        selectors: ArchSelectors,
        caps: CpuCapabilities,
    ) -> Result<()> {
        let def = switcher::lookup(kind).ok_or(WorldSwitchError::SwitcherNotImplemented(kind))?;
        let ctx = RelocationCtx {
            tri: self.blob_tri(kind)?,
            selectors,
            caps,
        };
        let fixups = std::mem::take(&mut self.fixups[kind as usize]);
        let result = (def.relocate)(def, &ctx, &fixups, self.code_mut(kind)?);
        self.fixups[kind as usize] = fixups;
        result
    }

    /// If `guest_addr` falls inside the image's guest mapping, the
    /// image-relative offset it corresponds to
    pub fn guest_offset_of_addr(&self, guest_addr: u64) -> Option<Offset> {
        let base = self.tri.guest().base();
        let end = base.checked_add(u64::try_from(self.size).ok()?)?;
        if guest_addr >= base && guest_addr < end {
            Some(Offset::from(guest_addr - base))
        } else {
            None
        }
    }

    /// Recompute the guest base after the guest hypervisor area moved
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn relocate_guest_base(&mut self, mem: &dyn MemoryServices) -> Result<()> {
        let guest = mem.host_to_guest(self.alloc.host_ring0)?;
        self.tri = self.tri.with_guest(guest);
        Ok(())
    }

    /// Tear down every mapping and release the backing allocation. Every
    /// step is attempted even when an earlier one fails; the first
    /// failure is returned.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn release(self, mem: &mut dyn MemoryServices) -> Result<()> {
        let mut first_err = None;
        if let Err(e) = mem.unmap_from_guest(self.tri.guest().base(), self.size) {
            log::error!("failed to unmap core code from the guest: {}", e);
            first_err.get_or_insert(e);
        }
        if let Err(e) = mem.unmap_intermediate(self.alloc.phys, self.size) {
            log::error!("failed to tear down intermediate mapping: {}", e);
            first_err.get_or_insert(e);
        }
        if let Err(e) = mem.free_contiguous(&self.alloc) {
            log::error!("failed to release contiguous allocation: {}", e);
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
