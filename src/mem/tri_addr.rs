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

use super::ptr::Ptr;
use super::ptr_addr_space::{GuestAddressSpace, HostAddressSpace, IdentityAddressSpace};
use super::ptr_offset::Offset;
use crate::Result;

/// The three base addresses the core-code image is simultaneously mapped
/// at. Switcher code runs from all three mappings during a single
/// transition, so relocation must be able to express any image offset in
/// any of them.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TriBase {
    host: HostAddressSpace,
    identity: IdentityAddressSpace,
    guest: GuestAddressSpace,
}

impl TriBase {
    /// Create a new `TriBase` from the three mapping bases
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(host: u64, identity: u64, guest: u64) -> Self {
        Self {
            host: HostAddressSpace::new(host),
            identity: IdentityAddressSpace::new(identity),
            guest: GuestAddressSpace::new(guest),
        }
    }

    /// Return a copy of `self` with the guest base replaced. The host and
    /// identity bases are fixed for the lifetime of the image; only the
    /// guest base moves when the hypervisor area is relocated.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn with_guest(self, guest: u64) -> Self {
        Self {
            guest: GuestAddressSpace::new(guest),
            ..self
        }
    }

    /// The host ring-0 base of the image
    pub fn host(&self) -> HostAddressSpace {
        self.host
    }

    /// The identity-mapped base of the image
    pub fn identity(&self) -> IdentityAddressSpace {
        self.identity
    }

    /// The guest base of the image
    pub fn guest(&self) -> GuestAddressSpace {
        self.guest
    }

    /// Resolve `offset` against all three bases at once
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn address_of(&self, offset: Offset) -> TriAddress {
        TriAddress { base: *self, offset }
    }
}

/// One offset into the core-code image, resolvable in the host, identity
/// and guest address spaces.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TriAddress {
    base: TriBase,
    offset: Offset,
}

impl TriAddress {
    /// The image offset this address was made from
    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// The absolute address in the host ring-0 mapping
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn in_host(&self) -> Result<u64> {
        Ptr::from_offset(self.base.host, self.offset).absolute()
    }

    /// The absolute address in the identity mapping
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn in_identity(&self) -> Result<u64> {
        Ptr::from_offset(self.base.identity, self.offset).absolute()
    }

    /// The absolute address in the guest mapping
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn in_guest(&self) -> Result<u64> {
        Ptr::from_offset(self.base.guest, self.offset).absolute()
    }
}

#[cfg(test)]
mod tests {
    use super::TriBase;
    use crate::mem::ptr_offset::Offset;

    #[test]
    fn resolves_in_all_three_spaces() {
        let base = TriBase::new(0xffff_8000_0000_0000, 0x0010_0000, 0xa000_0000);
        let addr = base.address_of(Offset::from(0x40_u64));
        assert_eq!(0xffff_8000_0000_0040, addr.in_host().unwrap());
        assert_eq!(0x0010_0040, addr.in_identity().unwrap());
        assert_eq!(0xa000_0040, addr.in_guest().unwrap());
    }

    #[test]
    fn with_guest_moves_only_the_guest_base() {
        let base = TriBase::new(0x1000, 0x2000, 0x3000);
        let moved = base.with_guest(0x9000);
        let addr = moved.address_of(Offset::from(8_u64));
        assert_eq!(0x1008, addr.in_host().unwrap());
        assert_eq!(0x2008, addr.in_identity().unwrap());
        assert_eq!(0x9008, addr.in_guest().unwrap());
    }
}
