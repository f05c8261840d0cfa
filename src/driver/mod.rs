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

//! The context-switch driver.
//!
//! One driver exists per VCPU and is confined to that VCPU's thread. It
//! owns the core-code image, the hypervisor stack and the active switcher
//! selection, and runs the outer transition loop: hypervisor interrupts
//! are retried invisibly, host-call requests are serviced synchronously
//! and resumed, and everything else is a terminal result handed back to
//! the caller.

/// The host-call request record and its dispatch
pub mod host_call;

use tracing::{Span, instrument};

use self::host_call::ServiceOutcome;
use crate::config::VmmConfiguration;
use crate::diag::AssertionState;
use crate::mem::core_code::CoreCodeImage;
use crate::mem::ptr_offset::Offset;
use crate::services::{
    ArchServices, GuestExecutor, LoaderServices, MemoryServices, RunExit, TerminalStatus,
};
use crate::stack::HypervisorStack;
use crate::switcher::{self, SwitcherDefinition, SwitcherKind};
use crate::{Result, log_then_return, metrics, new_error};

/// The guest-context symbol jumped to when resuming normal guest
/// execution
pub const RESUME_GUEST_SYMBOL: &str = "resume_guest";
/// The guest-context symbol jumped to when resuming a virtual-8086 mode
/// guest
pub const RESUME_GUEST_V86_SYMBOL: &str = "resume_guest_v86";

/// Where the driver's state machine currently is
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DriverState {
    /// No transition in flight
    Idle,
    /// A transition is in flight; guest-context code is (conceptually)
    /// running
    InGuestContext,
    /// A transition is parked while its host-call request is serviced
    ServicingHostCall,
}

/// The resolved entry points of the currently selected switcher. All
/// fields are absolute addresses: `host_to_guest` in the host ring-0
/// mapping, everything else in the guest mapping.
///
/// Recomputed wholesale on selection and relocation; no partial update is
/// ever visible.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ActiveSwitcherState {
    /// The selected switcher
    pub kind: SwitcherKind,
    /// Host ring-0 entry that starts a transition
    pub host_to_guest: u64,
    /// Guest-space entry that returns to the host
    pub guest_to_host: u64,
    /// Guest-space entry of the call trampoline
    pub call_trampoline: u64,
    /// Guest-space raw-asm return entry
    pub guest_to_host_asm: u64,
    /// Guest-space raw-asm return entry keeping the hypervisor context
    pub guest_to_host_asm_hyper_ctx: u64,
    /// Guest-space raw-asm return entry keeping the guest context
    pub guest_to_host_asm_guest_ctx: u64,
}

/// The per-VCPU context-switch driver.
pub struct ContextSwitchDriver {
    image: CoreCodeImage,
    stack: HypervisorStack,
    state: DriverState,
    disabled: bool,
    selected: Option<SwitcherKind>,
    active: Option<ActiveSwitcherState>,
    resume_guest: u64,
    resume_guest_v86: u64,
    assertion: AssertionState,
}

impl ContextSwitchDriver {
    /// Build the core-code image and the hypervisor stack and start out
    /// idle with no switcher selected.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(config: &VmmConfiguration, mem: &mut dyn MemoryServices) -> Result<Self> {
        let image = CoreCodeImage::build(config, mem)?;
        let stack = HypervisorStack::new(config, mem)?;
        Ok(Self {
            image,
            stack,
            state: DriverState::Idle,
            disabled: false,
            selected: None,
            active: None,
            resume_guest: 0,
            resume_guest_v86: 0,
            assertion: AssertionState::default(),
        })
    }

    /// Permanently disable switcher selection for this VM. Used by
    /// hardware-virtualization configurations that never leave the host
    /// context through core code. Irreversible; subsequent selections are
    /// accepted as no-ops.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn disable_switchers(&mut self) {
        log::info!("switchers disabled for this VM");
        self.disabled = true;
        self.selected = None;
        self.active = None;
    }

    /// Select `kind` as the current switcher and resolve its entry
    /// points. A silent no-op when switchers are disabled; an error when
    /// the catalog has no such switcher.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn select_switcher(&mut self, kind: SwitcherKind) -> Result<()> {
        if self.disabled {
            log::trace!("switchers disabled, ignoring selection of {:?}", kind);
            return Ok(());
        }
        let def = switcher::lookup(kind)
            .ok_or(crate::WorldSwitchError::SwitcherNotImplemented(kind))?;
        let active = self.entry_points(def)?;
        log::debug!(
            "selected switcher {:?}: host->guest {:#x}, guest->host {:#x}, trampoline {:#x}",
            kind,
            active.host_to_guest,
            active.guest_to_host,
            active.call_trampoline
        );
        self.selected = Some(kind);
        self.active = Some(active);
        Ok(())
    }

    fn entry_points(&self, def: &SwitcherDefinition) -> Result<ActiveSwitcherState> {
        let tri = self.image.blob_tri(def.kind)?;
        let guest_entry = |off: u32| tri.address_of(Offset::from(off)).in_guest();
        Ok(ActiveSwitcherState {
            kind: def.kind,
            host_to_guest: tri
                .address_of(Offset::from(def.off_host_to_guest))
                .in_host()?,
            guest_to_host: guest_entry(def.off_guest_to_host)?,
            call_trampoline: guest_entry(def.off_call_trampoline)?,
            guest_to_host_asm: guest_entry(def.off_guest_to_host_asm)?,
            guest_to_host_asm_hyper_ctx: guest_entry(def.off_guest_to_host_asm_hyper_ctx)?,
            guest_to_host_asm_guest_ctx: guest_entry(def.off_guest_to_host_asm_guest_ctx)?,
        })
    }

    /// Re-establish every address after the guest hypervisor area moved
    /// by `delta` bytes: recompute the image's guest base, shift the
    /// stack pointers, rerun every present switcher's relocation callback
    /// through the fixup engine, re-resolve the required resume symbols
    /// and recompute the active entry points.
    ///
    /// Idempotent: calling twice with the same layout produces identical
    /// state.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn relocate(
        &mut self,
        delta: i64,
        mem: &dyn MemoryServices,
        loader: &dyn LoaderServices,
        arch: &dyn ArchServices,
    ) -> Result<()> {
        debug_assert_eq!(DriverState::Idle, self.state);
        self.image.relocate_guest_base(mem)?;
        self.stack.relocate(delta);

        let selectors = arch.selectors();
        let caps = arch.capabilities();
        for def in switcher::present() {
            self.image.apply_fixups(def.kind, selectors, caps)?;
        }

        self.resume_guest = Self::required_symbol(loader, RESUME_GUEST_SYMBOL);
        self.resume_guest_v86 = Self::required_symbol(loader, RESUME_GUEST_V86_SYMBOL);

        if let Some(kind) = self.selected {
            let def = switcher::lookup(kind)
                .ok_or(crate::WorldSwitchError::SwitcherNotImplemented(kind))?;
            self.active = Some(self.entry_points(def)?);
        }
        Ok(())
    }

    /// Resolve a symbol the resume path cannot run without. Absence means
    /// the guest-context module set and this build are mismatched, which
    /// no caller can recover from.
    fn required_symbol(loader: &dyn LoaderServices, name: &str) -> u64 {
        match loader.guest_symbol(name) {
            Ok(ptr) => u64::from(ptr),
            Err(e) => panic!("required guest symbol {} missing: {}", name, e),
        }
    }

    /// Run the guest until a terminal result, entering at the normal (or
    /// virtual-8086) resume point.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn run_guest(
        &mut self,
        executor: &mut dyn GuestExecutor,
        host: &mut dyn crate::services::HostServices,
    ) -> Result<TerminalStatus> {
        let active = self.require_active()?;
        let resume = if executor.is_v86() {
            self.resume_guest_v86
        } else {
            self.resume_guest
        };
        executor.set_resume_target(resume);
        self.state = DriverState::InGuestContext;
        let first = Self::transition(executor, |e| e.switch_to_guest(active.host_to_guest));
        self.run_loop(first, executor, host)
    }

    /// Resume interrupted hypervisor code where it left off and run until
    /// a terminal result.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn resume_hyper(
        &mut self,
        executor: &mut dyn GuestExecutor,
        host: &mut dyn crate::services::HostServices,
    ) -> Result<TerminalStatus> {
        self.require_active()?;
        self.state = DriverState::InGuestContext;
        let first = Self::transition(executor, |e| e.resume());
        self.run_loop(first, executor, host)
    }

    /// Call a guest-context function synchronously: lay out the argument
    /// frame on the hypervisor stack, push the trampoline's two
    /// parameters (frame size, then the target), and enter through the
    /// call trampoline.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn call_guest_function(
        &mut self,
        executor: &mut dyn GuestExecutor,
        host: &mut dyn crate::services::HostServices,
        entry: u32,
        args: &[u32],
    ) -> Result<TerminalStatus> {
        let active = self.require_active()?;
        log::trace!("calling guest function {:#x} with {} args", entry, args.len());

        self.stack.fill();
        self.stack.place_frame(args)?;
        self.stack.push_u32(u32::try_from(args.len() * 4)?)?;
        self.stack.push_u32(entry)?;

        executor.set_stack_pointer(self.stack.sp());
        executor.set_resume_target(active.call_trampoline);
        self.state = DriverState::InGuestContext;
        let first = Self::transition(executor, |e| e.switch_to_guest(active.host_to_guest));
        self.run_loop(first, executor, host)
    }

    fn require_active(&self) -> Result<ActiveSwitcherState> {
        if self.state != DriverState::Idle {
            log_then_return!("transition already in flight");
        }
        self.active
            .ok_or_else(|| new_error!("no switcher selected"))
    }

    /// One transition attempt, with the unconditional log-buffer drain
    /// that follows every attempt regardless of its outcome.
    fn transition<F>(executor: &mut dyn GuestExecutor, attempt: F) -> Result<RunExit>
    where
        F: FnOnce(&mut dyn GuestExecutor) -> Result<RunExit>,
    {
        let exit = attempt(executor);
        executor.drain_guest_log();
        executor.drain_ring0_log();
        exit
    }

    fn run_loop(
        &mut self,
        first: Result<RunExit>,
        executor: &mut dyn GuestExecutor,
        host: &mut dyn crate::services::HostServices,
    ) -> Result<TerminalStatus> {
        let mut exit = first;
        loop {
            let exit_val = match exit {
                Ok(exit_val) => exit_val,
                Err(e) => {
                    self.state = DriverState::Idle;
                    return Err(e);
                }
            };
            match exit_val {
                RunExit::InterruptHyper => {
                    // a host interrupt preempted hypervisor code; fully
                    // masked, retry at the identical guest state
                    exit = Self::transition(executor, |e| e.resume());
                }
                RunExit::CallHost => {
                    self.state = DriverState::ServicingHostCall;
                    match host_call::service(executor.host_call_request(), host) {
                        Err(e) => {
                            self.state = DriverState::Idle;
                            return Err(e);
                        }
                        Ok(ServiceOutcome::FatalAssertion) => {
                            let (msg1, msg2) = executor.assertion_text();
                            log::error!("guest assertion: {} {}", msg1, msg2);
                            self.assertion.record(msg1, msg2);
                            self.resume_guest = 0;
                            self.resume_guest_v86 = 0;
                            executor.set_resume_target(0);
                            self.state = DriverState::Idle;
                            metrics::record_transition(TerminalStatus::HyperAssertion);
                            return Ok(TerminalStatus::HyperAssertion);
                        }
                        Ok(ServiceOutcome::Serviced) => {
                            self.state = DriverState::InGuestContext;
                            exit = Self::transition(executor, |e| e.resume());
                        }
                    }
                }
                RunExit::Completed(status) => {
                    self.state = DriverState::Idle;
                    metrics::record_transition(status);
                    return Ok(status);
                }
            }
        }
    }

    /// Where the state machine currently is
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Whether switcher selection has been permanently disabled
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// The currently resolved entry points, if a switcher is selected
    pub fn active(&self) -> Option<&ActiveSwitcherState> {
        self.active.as_ref()
    }

    /// The current normal-mode resume jump target (zero after a fatal
    /// assertion)
    pub fn resume_guest(&self) -> u64 {
        self.resume_guest
    }

    /// The current virtual-8086 resume jump target
    pub fn resume_guest_v86(&self) -> u64 {
        self.resume_guest_v86
    }

    /// The core-code image
    pub fn image(&self) -> &CoreCodeImage {
        &self.image
    }

    /// The hypervisor stack
    pub fn stack(&self) -> &HypervisorStack {
        &self.stack
    }

    /// Mutable access to the hypervisor stack, for saved-state restore
    pub fn stack_mut(&mut self) -> &mut HypervisorStack {
        &mut self.stack
    }

    /// The recorded assertion messages, if a fatal assertion fired
    pub fn assertion(&self) -> &AssertionState {
        &self.assertion
    }

    /// Release the image's mappings and allocation
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn teardown(self, mem: &mut dyn MemoryServices) -> Result<()> {
        self.image.release(mem)
    }
}
