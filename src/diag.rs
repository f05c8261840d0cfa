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

//! Diagnostics: the info registry, dump sinks and the fatal dump report.
//!
//! Any terminal non-success transition result ends in a structured dump
//! assembled from independent providers, each queried best-effort: one
//! failing provider never aborts the dump of the others.

use std::collections::BTreeMap;

use bitflags::bitflags;
use tracing::{Span, instrument};

use crate::mem::core_code::CoreCodeImage;
use crate::services::{LoaderServices, TerminalStatus};
use crate::stack::HypervisorStack;
use crate::{Result, new_error};

/// A printf-style output sink. The same dump code runs whether output
/// goes to a logger, a release logger or a console stream.
pub trait DumpSink {
    /// Emit one line of output
    fn line(&mut self, text: &str);
}

/// A sink that writes every line through the error logger
#[derive(Default)]
pub struct LogDumpSink;

impl DumpSink for LogDumpSink {
    fn line(&mut self, text: &str) {
        log::error!("{}", text);
    }
}

bitflags! {
    /// The VM-wide force-action flags the `ff` info provider reports.
    /// Each bit asks the execution loop to service something before the
    /// next transition.
    #[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
    pub struct ForceActionFlags: u32 {
        /// Expired timers need running
        const TIMERS_PENDING = 1 << 0;
        /// Pending queue items need flushing
        const QUEUES_PENDING = 1 << 1;
        /// A cross-thread request is waiting
        const REQUEST_PENDING = 1 << 2;
        /// VM termination was requested
        const TERMINATE = 1 << 3;
        /// VM reset was requested
        const RESET_REQUESTED = 1 << 4;
        /// Guest execution must return to the host loop
        const TO_HOST = 1 << 5;
    }
}

/// The assertion messages captured when a guest-context assertion fires,
/// kept for the fatal dump.
#[derive(Debug, Clone, Default)]
pub struct AssertionState {
    msg1: String,
    msg2: String,
}

impl AssertionState {
    /// Record the two assertion message buffers
    pub fn record(&mut self, msg1: String, msg2: String) {
        self.msg1 = msg1;
        self.msg2 = msg2;
    }

    /// Whether an assertion has been recorded
    pub fn is_set(&self) -> bool {
        !self.msg1.is_empty() || !self.msg2.is_empty()
    }

    /// The recorded messages
    pub fn messages(&self) -> (&str, &str) {
        (&self.msg1, &self.msg2)
    }
}

/// An introspection handler: writes one subsystem's state to a sink
pub type InfoProvider = Box<dyn Fn(&mut dyn DumpSink) -> Result<()> + Send>;

struct InfoHandler {
    description: String,
    provider: InfoProvider,
}

/// Named introspection handlers, looked up by the fatal dump and by
/// interactive debugging frontends.
#[derive(Default)]
pub struct InfoRegistry {
    handlers: BTreeMap<String, InfoHandler>,
}

impl InfoRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `name`. Names are unique; registering a
    /// duplicate is an error.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        provider: InfoProvider,
    ) -> Result<()> {
        if self.handlers.contains_key(name) {
            return Err(new_error!("info handler {} already registered", name));
        }
        self.handlers.insert(
            name.to_string(),
            InfoHandler {
                description: description.to_string(),
                provider,
            },
        );
        Ok(())
    }

    /// Register the standard `ff` provider reporting force-action flags
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn register_force_action_flags(
        &mut self,
        get: impl Fn() -> ForceActionFlags + Send + 'static,
    ) -> Result<()> {
        self.register(
            "ff",
            "Force action flags",
            Box::new(move |sink| {
                let flags = get();
                sink.line(&format!("ff: {:#x} ({:?})", flags.bits(), flags));
                Ok(())
            }),
        )
    }

    /// The description `name` was registered with, if present
    pub fn description(&self, name: &str) -> Option<&str> {
        self.handlers.get(name).map(|h| h.description.as_str())
    }

    /// Run `name`'s provider against `sink`
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn dump(&self, name: &str, sink: &mut dyn DumpSink) -> Result<()> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| new_error!("no info handler named {}", name))?;
        (handler.provider)(sink)
    }

    /// Run each named provider best-effort: absent names are skipped and
    /// a failing provider is reported inline without stopping the rest.
    pub fn dump_each(&self, names: &[&str], sink: &mut dyn DumpSink) {
        for name in names {
            let Some(handler) = self.handlers.get(*name) else {
                continue;
            };
            sink.line(&format!("!! {{{}}}", name));
            if let Err(e) = (handler.provider)(sink) {
                log::error!("info handler {} failed during dump: {}", name, e);
                sink.line(&format!("!! info handler {name} failed: {e}"));
            }
        }
    }
}

/// The fixed provider battery queried at the end of every fatal dump.
/// Providers not registered on this VM are skipped.
const FATAL_DUMP_BATTERY: [&str; 6] = ["ff", "cpum", "mode", "handlers", "mappings", "timers"];

/// Everything the fatal dump report draws on.
pub struct FatalDumpArgs<'a> {
    /// The terminal status that triggered the dump
    pub status: TerminalStatus,
    /// The guest-context instruction pointer at the time of death
    pub eip: u64,
    /// The guest-context stack pointer at the time of death
    pub esp: u64,
    /// Captured assertion messages, if any
    pub assertion: &'a AssertionState,
    /// The hypervisor stack to dump raw
    pub stack: &'a HypervisorStack,
    /// The core-code image, for instruction-pointer attribution
    pub image: &'a CoreCodeImage,
    /// Symbol resolution for instruction pointers outside the image
    pub loader: &'a dyn LoaderServices,
    /// The providers to query at the end
    pub registry: &'a InfoRegistry,
}

/// Assemble the full fatal-error report into `sink`.
///
/// Every section is best-effort; the report is for a VM that is already
/// considered unusable.
#[instrument(skip_all, parent = Span::current(), level= "Trace")]
pub fn fatal_dump(sink: &mut dyn DumpSink, args: &FatalDumpArgs<'_>) {
    sink.line("!!");
    sink.line(&format!(
        "!! Fatal error: {} (eip={:#010x} esp={:#010x})",
        args.status.name(),
        args.eip,
        args.esp
    ));
    sink.line("!!");

    if args.status == TerminalStatus::HyperAssertion && args.assertion.is_set() {
        let (msg1, msg2) = args.assertion.messages();
        sink.line("!! Assertion:");
        sink.line(&format!("!!   {}", msg1));
        sink.line(&format!("!!   {}", msg2));
        sink.line("!!");
    }

    match args.image.guest_offset_of_addr(args.eip) {
        Some(offset) => sink.line(&format!(
            "!! eip is inside the core code image at offset {:#x}",
            u64::from(offset)
        )),
        None => match args.loader.nearest_symbol(args.eip) {
            Some((symbol, addr)) => sink.line(&format!(
                "!! eip = {} + {:#x}",
                symbol,
                args.eip.wrapping_sub(addr)
            )),
            None => sink.line("!! eip is in unknown code"),
        },
    }
    sink.line("!!");

    sink.line(&format!(
        "!! Raw stack, bottom {:#010x}, sp {:#010x}:",
        args.stack.bottom(),
        args.stack.sp()
    ));
    hex_dump(
        sink,
        args.stack.bottom() - args.stack.capacity() as u64,
        args.stack.bytes(),
    );

    args.registry.dump_each(&FATAL_DUMP_BATTERY, sink);
}

fn hex_dump(sink: &mut dyn DumpSink, base: u64, bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let mut line = format!("{:#010x}:", base + (i * 16) as u64);
        for byte in chunk {
            line.push_str(&format!(" {:02x}", byte));
        }
        sink.line(&line);
    }
}
