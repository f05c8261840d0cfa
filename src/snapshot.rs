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

//! Saved-state serialization for the hypervisor stack.
//!
//! The unit is `{version, stack-bottom pointer, stack pointer, raw stack
//! bytes, terminator}`. On load the version must match exactly and the
//! pointer fields are used for consistency checks only; the bytes and the
//! consumed depth are what actually get restored, re-expressed against
//! the current guest mapping.

use std::io::{Read, Write};

use tracing::{Span, instrument};

use crate::Result;
use crate::error::WorldSwitchError;
use crate::stack::HypervisorStack;

/// The saved-state unit version this build writes and accepts
pub const SAVED_STATE_VERSION: u32 = 3;

/// Marker closing the unit, catching short or misaligned reads
pub const SAVED_STATE_TERMINATOR: u32 = !0u32;

fn write_u32(w: &mut dyn Write, val: u32) -> Result<()> {
    w.write_all(&val.to_le_bytes())?;
    Ok(())
}

fn write_u64(w: &mut dyn Write, val: u64) -> Result<()> {
    w.write_all(&val.to_le_bytes())?;
    Ok(())
}

fn read_u32(r: &mut dyn Read) -> Result<u32> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(r: &mut dyn Read) -> Result<u64> {
    let mut bytes = [0u8; 8];
    r.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Write the stack's saved-state unit to `w`
#[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
pub fn save(stack: &HypervisorStack, w: &mut dyn Write) -> Result<()> {
    write_u32(w, SAVED_STATE_VERSION)?;
    write_u64(w, stack.bottom())?;
    write_u64(w, stack.sp())?;
    w.write_all(stack.bytes())?;
    write_u32(w, SAVED_STATE_TERMINATOR)?;
    Ok(())
}

/// Read a saved-state unit from `r` and restore it into `stack`.
///
/// The recorded pointers belong to the mapping that existed at save time;
/// they are validated against each other and against the stack's
/// capacity, then discarded in favor of the current mapping.
#[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
pub fn load(stack: &mut HypervisorStack, r: &mut dyn Read) -> Result<()> {
    let version = read_u32(r)?;
    if version != SAVED_STATE_VERSION {
        return Err(WorldSwitchError::SavedStateUnsupportedVersion(
            version,
            SAVED_STATE_VERSION,
        ));
    }

    let bottom = read_u64(r)?;
    let sp = read_u64(r)?;
    let span = bottom
        .checked_sub(sp)
        .ok_or(WorldSwitchError::SavedStateStackMismatch(
            sp.wrapping_sub(bottom),
            0,
        ))?;
    if span > u64::try_from(stack.capacity())? {
        return Err(WorldSwitchError::SavedStateStackMismatch(
            span,
            stack.capacity(),
        ));
    }

    r.read_exact(stack.bytes_mut())?;

    let terminator = read_u32(r)?;
    if terminator != SAVED_STATE_TERMINATOR {
        return Err(WorldSwitchError::SavedStateBadTerminator(
            terminator,
            SAVED_STATE_TERMINATOR,
        ));
    }

    let new_sp = stack.bottom() - span;
    stack.set_sp(new_sp)?;
    Ok(())
}
