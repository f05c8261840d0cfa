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

use std::error::Error;
use std::num::TryFromIntError;
use std::sync::{MutexGuard, PoisonError};

use thiserror::Error;

use crate::switcher::SwitcherKind;

/// The error type for world-switch operations
#[derive(Error, Debug)]
pub enum WorldSwitchError {
    /// Memory access out of bounds
    #[error("Offset: {0} out of bounds, Max is: {1}")]
    BoundsCheckFailed(u64, usize),

    /// Checked Add Overflow
    #[error("Couldn't add offset to base address. Offset: {0}, Base Address: {1}")]
    CheckedAddOverflow(u64, u64),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// The guest mapping of the core-code image could not be established
    #[error("Failed to map core code into the guest address space: {0}")]
    GuestMappingFailed(String),

    /// Failed to convert to Integer
    #[error("Failed To Convert Size to usize")]
    IntConversionFailure(#[from] TryFromIntError),

    /// The identity mapping of the core-code image conflicted with an
    /// existing mapping. Recoverable; the image builder retries with a
    /// fresh allocation.
    #[error("Intermediate mapping conflict at {0:#x}")]
    IntermediateMappingConflict(u64),

    /// Every identity-mapping attempt conflicted
    #[error("Intermediate mapping still conflicting after {0} allocation attempts")]
    IntermediateMappingExhausted(usize),

    /// The configured virtual CPU count is out of range
    #[error("CPU count {0} is out of range [1..{1}]")]
    InvalidCpuCount(u32, u32),

    /// A raw switcher index did not correspond to any known switcher kind
    #[error("Switcher index {0} is not a valid switcher kind")]
    InvalidSwitcherIndex(u8),

    /// Reading Writing or Seeking data failed.
    #[error("Reading Writing or Seeking data failed {0:?}")]
    IOError(#[from] std::io::Error),

    /// An attempt to get a lock from a Mutex failed.
    #[error("Unable to lock resource")]
    LockAttemptFailed(String),

    /// Memory Allocation Failed.
    #[error("Memory Allocation Failed with OS Error {0:?}.")]
    MemoryAllocationFailed(Option<i32>),

    /// A saved-state unit ended with the wrong terminator marker
    #[error("Saved state terminator was {0:#x}, expected {1:#x}")]
    SavedStateBadTerminator(u32, u32),

    /// The saved-state stack did not fit the current stack buffer
    #[error("Saved state stack spans {0:#x} bytes, stack capacity is {1:#x}")]
    SavedStateStackMismatch(u64, usize),

    /// A saved-state unit carried an unsupported version tag
    #[error("Saved state version was {0}, expected {1}")]
    SavedStateUnsupportedVersion(u32, u32),

    /// The selected switcher is not available in this build/host combination
    #[error("Switcher {0:?} is not implemented on this host")]
    SwitcherNotImplemented(SwitcherKind),
}

impl From<&str> for WorldSwitchError {
    fn from(s: &str) -> Self {
        WorldSwitchError::Error(s.to_string())
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for WorldSwitchError {
    // Implemented this way rather than passing the error as a source to LockAttemptFailed as that would require
    // Box<dyn Error + Send + Sync> which is not easy to implement for PoisonError<MutexGuard<'_, T>>
    // This is a good enough solution and allows use to use the ? operator on lock() calls
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from(""),
        };
        WorldSwitchError::LockAttemptFailed(source)
    }
}

/// Creates a `WorldSwitchError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::WorldSwitchError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::WorldSwitchError::Error(__err_msg)
    }};
}
