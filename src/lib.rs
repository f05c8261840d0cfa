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
#![deny(dead_code, missing_docs, unused_mut)]
//! World-switching and execution-control core for a raw-mode hypervisor
//! host.
//!
//! This crate owns the machinery that moves a virtual CPU between host and
//! guest execution contexts: the catalog of relocatable switcher code
//! blobs, the fixup engine that patches them once their final addresses are
//! known, the core-code image they are laid out in, the context-switch
//! driver that performs transitions, and the dispatch loop that services
//! requests guest-context code makes back to the host.
//!
//! The crate is an embedded library component. Page mapping, symbol
//! resolution, timers and the raw transition primitive are collaborator
//! traits (see [`services`]) supplied by the orchestrating VM layer.

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

/// Configuration for a VM's world-switch subsystem.
pub mod config;
/// Diagnostics: info registry, dump sinks and the fatal dump report.
pub mod diag;
/// The context-switch driver and the host-call dispatch loop.
pub mod driver;
/// Dealing with errors, including errors crossing the world boundary
pub mod error;
/// The three-address-space memory model and the core-code image.
pub mod mem;
/// Metric definitions and helpers
pub mod metrics;
/// Collaborator interfaces supplied by the orchestrating VM layer.
pub mod services;
/// Saved-state serialization for the hypervisor stack.
pub mod snapshot;
/// The hypervisor stack shared between host and guest contexts.
pub mod stack;
/// Switcher definitions, the static catalog and the fixup engine.
pub mod switcher;
/// Shared test doubles for the collaborator traits
#[cfg(test)]
pub(crate) mod testing;
/// The VM-wide advisory lock used by orchestration threads.
pub mod vm_lock;
/// The EMT yield heuristic.
pub mod yield_timer;

/// The re-export for the `WorldSwitchError` type
pub use error::WorldSwitchError;

/// The universal `Result` type used throughout this crate.
pub type Result<T> = core::result::Result<T, error::WorldSwitchError>;

/// Logs an error then returns with it, more or less equivalent to the bail!
/// macro in anyhow but for WorldSwitchError instead of anyhow::Error
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        let __err = $crate::WorldSwitchError::Error(__err_msg);
        log::error!("{}", __err);
        return Err(__err);
    }};
    ($err:expr $(,)?) => {
        log::error!("{}", $err);
        return Err($err);
    };
    ($fmtstr:expr, $($arg:tt)*) => {
           let __err_msg = std::format!($fmtstr, $($arg)*);
           let __err = $crate::error::WorldSwitchError::Error(__err_msg);
           log::error!("{}", __err);
           return Err(__err);
    };
}
