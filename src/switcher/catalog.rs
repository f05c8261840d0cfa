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

//! The static switcher catalog.
//!
//! One entry per addressing-mode pair. Entries are `None` for pairs that
//! have no switcher on this host: a 32-bit or PAE host cannot run an
//! AMD64 guest in raw mode, and an AMD64-to-AMD64 transition never leaves
//! long mode, so no switcher is required for it.
//!
//! Each blob is laid out as five sub-regions executed in turn during a
//! transition: host ring-0 prologue, first identity stretch (paging off),
//! the guest-context body, second identity stretch, host ring-0 epilogue.

use super::fixup::{self, ArchSelectors, Fixup, RelocationCtx};
use super::{Region, SWITCHER_KIND_COUNT, SwitcherDefinition, SwitcherKind};
use crate::Result;

const BLOB_LEN: usize = 128;

const HOST0: Region = Region::new(0, 32);
const ID0: Region = Region::new(32, 16);
const GUEST: Region = Region::new(48, 48);
const ID1: Region = Region::new(96, 16);
const HOST1: Region = Region::new(112, 16);

const OFF_HOST_TO_GUEST: u32 = 0;
const OFF_GUEST_TO_HOST: u32 = 56;
const OFF_CALL_TRAMPOLINE: u32 = 64;
const OFF_GUEST_TO_HOST_ASM: u32 = 72;
const OFF_GUEST_TO_HOST_ASM_HYPER_CTX: u32 = 76;
const OFF_GUEST_TO_HOST_ASM_GUEST_CTX: u32 = 80;

const fn blob(tag: u8) -> [u8; BLOB_LEN] {
    let mut code = [0x90u8; BLOB_LEN];
    code[0] = 0xfa; // cli
    code[1] = tag;
    code[BLOB_LEN - 1] = 0xc3; // ret
    code
}

static X32_TO_X32_CODE: [u8; BLOB_LEN] = blob(0x01);
static X32_TO_PAE_CODE: [u8; BLOB_LEN] = blob(0x02);
static PAE_TO_X32_CODE: [u8; BLOB_LEN] = blob(0x03);
static PAE_TO_PAE_CODE: [u8; BLOB_LEN] = blob(0x04);
static AMD64_TO_PAE_CODE: [u8; BLOB_LEN] = blob(0x05);

#[rustfmt::skip]
static X32_TO_X32_FIXUPS: [u8; 33] = [
    0x02, 8, 0, 0, 0, 36, 0, 0, 0,      // host -> id0 near rel
    0x04, 40, 0, 0, 0, 52, 0, 0, 0,     // id0 -> guest near rel
    0x0d, 50, 0, 0, 0,                  // hypervisor ds
    0x05, 60, 0, 0, 0, 116, 0, 0, 0,    // guest -> host1 near rel
    0x00,
];

#[rustfmt::skip]
static X32_TO_PAE_FIXUPS: [u8; 37] = [
    0x02, 8, 0, 0, 0, 36, 0, 0, 0,      // host -> id0 near rel
    0x04, 40, 0, 0, 0, 52, 0, 0, 0,     // id0 -> guest near rel
    0x07, 84, 0, 0, 0, 56, 0, 0, 0,     // far 16:32 into the guest body
    0x05, 60, 0, 0, 0, 116, 0, 0, 0,    // guest -> host1 near rel
    0x00,
];

#[rustfmt::skip]
static PAE_TO_X32_FIXUPS: [u8; 42] = [
    0x02, 8, 0, 0, 0, 36, 0, 0, 0,      // host -> id0 near rel
    0x04, 40, 0, 0, 0, 52, 0, 0, 0,     // id0 -> guest near rel
    0x0c, 44, 0, 0, 0,                  // hypervisor cs
    0x06, 60, 0, 0, 0, 100, 0, 0, 0,    // guest -> id1 near rel
    0x05, 66, 0, 0, 0, 116, 0, 0, 0,    // guest -> host1 near rel
    0x00,
];

#[rustfmt::skip]
static PAE_TO_PAE_FIXUPS: [u8; 47] = [
    0x02, 8, 0, 0, 0, 36, 0, 0, 0,      // host -> id0 near rel
    0x04, 40, 0, 0, 0, 52, 0, 0, 0,     // id0 -> guest near rel
    0x10, 84, 0, 0, 0,                  // pointer to the TSS GDT descriptor
    0x12, 60, 0, 0, 0, 76, 0, 0, 0,     // no-sysenter bypass
    0x8b, 0x44, 0x24, 0x04, 0x90,       //   original bytes
    0x05, 68, 0, 0, 0, 116, 0, 0, 0,    // guest -> host1 near rel
    0x00,
];

#[rustfmt::skip]
static AMD64_TO_PAE_FIXUPS: [u8; 56] = [
    0x02, 8, 0, 0, 0, 36, 0, 0, 0,      // host -> id0 near rel
    0x0b, 16, 0, 0, 0, 24, 0, 0, 0,     // 64-bit host pointer
    0x08, 40, 0, 0, 0, 100, 0, 0, 0,    // far 16:32 into id1 (drops to 32-bit)
    0x0f, 104, 0, 0, 0,                 // 64-bit cs for the return far jump
    0x11, 60, 0, 0, 0, 76, 0, 0, 0,     // no-fxsave bypass
    0x0f, 0xae, 0x04, 0x24, 0x90,       //   original bytes
    0x05, 68, 0, 0, 0, 116, 0, 0, 0,    // guest -> host1 near rel
    0x00,
];

/// Relocation for switchers whose host side runs in legacy (32-bit or
/// PAE) mode: no 64-bit code selector is ever reachable mid-switch.
fn relocate_legacy(
    def: &SwitcherDefinition,
    ctx: &RelocationCtx,
    fixups: &[Fixup],
    code: &mut [u8],
) -> Result<()> {
    let ctx = RelocationCtx {
        selectors: ArchSelectors {
            cs64: 0,
            ..ctx.selectors
        },
        ..*ctx
    };
    fixup::apply(def, &ctx, fixups, code)
}

/// Relocation for switchers whose host side runs in long mode: the
/// 64-bit code selector is needed for the mode drop and re-entry.
fn relocate_amd64(
    def: &SwitcherDefinition,
    ctx: &RelocationCtx,
    fixups: &[Fixup],
    code: &mut [u8],
) -> Result<()> {
    fixup::apply(def, ctx, fixups, code)
}

macro_rules! switcher_def {
    ($kind:expr, $desc:literal, $code:expr, $fixups:expr, $relocate:expr) => {
        SwitcherDefinition {
            kind: $kind,
            description: $desc,
            code: &$code,
            host0: HOST0,
            id0: ID0,
            guest: GUEST,
            id1: ID1,
            host1: HOST1,
            fixups: &$fixups,
            relocate: $relocate,
            off_host_to_guest: OFF_HOST_TO_GUEST,
            off_guest_to_host: OFF_GUEST_TO_HOST,
            off_call_trampoline: OFF_CALL_TRAMPOLINE,
            off_guest_to_host_asm: OFF_GUEST_TO_HOST_ASM,
            off_guest_to_host_asm_hyper_ctx: OFF_GUEST_TO_HOST_ASM_HYPER_CTX,
            off_guest_to_host_asm_guest_ctx: OFF_GUEST_TO_HOST_ASM_GUEST_CTX,
        }
    };
}

static X32_TO_X32: SwitcherDefinition = switcher_def!(
    SwitcherKind::X32ToX32,
    "32-bit to 32-bit",
    X32_TO_X32_CODE,
    X32_TO_X32_FIXUPS,
    relocate_legacy
);

static X32_TO_PAE: SwitcherDefinition = switcher_def!(
    SwitcherKind::X32ToPae,
    "32-bit to PAE",
    X32_TO_PAE_CODE,
    X32_TO_PAE_FIXUPS,
    relocate_legacy
);

static PAE_TO_X32: SwitcherDefinition = switcher_def!(
    SwitcherKind::PaeToX32,
    "PAE to 32-bit",
    PAE_TO_X32_CODE,
    PAE_TO_X32_FIXUPS,
    relocate_legacy
);

static PAE_TO_PAE: SwitcherDefinition = switcher_def!(
    SwitcherKind::PaeToPae,
    "PAE to PAE",
    PAE_TO_PAE_CODE,
    PAE_TO_PAE_FIXUPS,
    relocate_legacy
);

static AMD64_TO_PAE: SwitcherDefinition = switcher_def!(
    SwitcherKind::Amd64ToPae,
    "AMD64 to PAE",
    AMD64_TO_PAE_CODE,
    AMD64_TO_PAE_FIXUPS,
    relocate_amd64
);

/// The catalog table, indexed by `SwitcherKind as usize`
pub static CATALOG: [Option<&'static SwitcherDefinition>; SWITCHER_KIND_COUNT] = [
    Some(&X32_TO_X32),
    Some(&X32_TO_PAE),
    None, // 32-bit host cannot switch to an AMD64 guest
    Some(&PAE_TO_X32),
    Some(&PAE_TO_PAE),
    None, // PAE host cannot switch to an AMD64 guest
    Some(&AMD64_TO_PAE),
    None, // long mode is never left, no switcher needed
];
