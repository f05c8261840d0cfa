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

/// The core-code image: one contiguous block holding every switcher blob,
/// mapped into host, identity and guest address spaces.
pub mod core_code;
/// A generic wrapper for a raw pointer inside an address space
pub mod ptr;
/// The host, identity and guest address spaces
pub mod ptr_addr_space;
/// A generic wrapper for an offset into an address space
pub mod ptr_offset;
/// One offset resolvable against all three address spaces at once
pub mod tri_addr;

/// The page size used when rounding allocations.
pub const PAGE_SIZE_USIZE: usize = 0x1000;
