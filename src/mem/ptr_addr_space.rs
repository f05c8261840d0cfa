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

/// A representation of a specific address space
pub trait AddressSpace: std::cmp::Eq {
    /// The base address for this address space
    fn base(&self) -> u64;
}

/// The host ring-0 address space the switcher code executes in before and
/// after the actual transition.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HostAddressSpace(u64);
impl HostAddressSpace {
    /// Create a new instance of a `HostAddressSpace` with the given base
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(base: u64) -> Self {
        Self(base)
    }
}
impl AddressSpace for HostAddressSpace {
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    fn base(&self) -> u64 {
        self.0
    }
}

/// The identity-mapped (physical == virtual) address space used by the
/// portion of switcher code that runs while paging is being switched.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct IdentityAddressSpace(u64);
impl IdentityAddressSpace {
    /// Create a new instance of an `IdentityAddressSpace` with the given base
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(base: u64) -> Self {
        Self(base)
    }
}
impl AddressSpace for IdentityAddressSpace {
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    fn base(&self) -> u64 {
        self.0
    }
}

/// The guest address space the hypervisor occupies while guest-context
/// code runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GuestAddressSpace(u64);
impl GuestAddressSpace {
    /// Create a new instance of a `GuestAddressSpace` with the given base
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(base: u64) -> Self {
        Self(base)
    }
}
impl AddressSpace for GuestAddressSpace {
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    fn base(&self) -> u64 {
        self.0
    }
}
