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

//! The emulation-thread yield heuristic.
//!
//! A periodic timer gives the rest of the host system a chance to run.
//! The tuning is delicate in both directions, so the rule is: yield on
//! the default interval while there is no scheduling lag worth
//! mentioning, but once the guest starts accumulating lag stop yielding
//! entirely rather than starve it further.

use tracing::{Span, instrument};

use crate::config::VmmConfiguration;
use crate::services::TimerService;

/// Below this much virtual-sync lag the guest is keeping up and the
/// thread always yields.
const LOW_LAG_MILLIS: u64 = 50;

/// Above this much lag yielding stops unconditionally.
const HIGH_LAG_MILLIS: u64 = 1_000;

/// With moderate lag, keep yielding only while the previous yield was
/// this recent.
const RECENT_YIELD_MILLIS: u64 = 500;

/// Periodic host-thread yielding with suspend/resume bookkeeping.
///
/// Suspending captures the remaining time on the armed timer so a
/// matching [`Self::resume`] picks up mid-interval instead of granting
/// the guest a full extra interval.
pub struct EmtYielder {
    interval_millis: u32,
    last_yield_millis: u64,
    /// Non-zero while suspended or stopped: the interval to re-arm with
    resume_millis: u32,
}

impl EmtYielder {
    /// A yielder using the configured interval, not yet armed
    pub fn new(config: &VmmConfiguration) -> Self {
        Self {
            interval_millis: config.get_yield_interval_millis(),
            last_yield_millis: 0,
            resume_millis: 0,
        }
    }

    /// Arm the timer for the first time
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn start(&mut self, timer: &mut dyn TimerService) {
        timer.arm_yield_timer(self.interval_millis);
    }

    /// The timer fired: yield if the lag heuristic allows it, then re-arm
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn tick(&mut self, timer: &mut dyn TimerService) {
        let lag = timer.virtual_sync_lag_millis();
        let now = timer.now_millis();
        if lag < LOW_LAG_MILLIS
            || (lag < HIGH_LAG_MILLIS
                && now.saturating_sub(self.last_yield_millis) < RECENT_YIELD_MILLIS)
        {
            self.last_yield_millis = now;
            timer.yield_now();
            log::trace!("emt yield at {} ms, lag {} ms", now, lag);
        }
        timer.arm_yield_timer(self.interval_millis);
    }

    /// Pause yielding, remembering how much of the current interval was
    /// left. Nested suspends collapse into the first one.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn suspend(&mut self, timer: &mut dyn TimerService) {
        if self.resume_millis == 0 {
            let now = timer.now_millis();
            self.resume_millis = match timer.yield_timer_expiry() {
                Some(expiry) if expiry > now => {
                    u32::try_from(expiry - now).unwrap_or(self.interval_millis)
                }
                _ => self.interval_millis,
            };
            timer.cancel_yield_timer();
        }
        self.last_yield_millis = timer.now_millis();
    }

    /// Pause yielding, discarding any partial interval; the next
    /// [`Self::resume`] waits a full interval.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn stop(&mut self, timer: &mut dyn TimerService) {
        if self.resume_millis == 0 {
            timer.cancel_yield_timer();
        }
        self.resume_millis = self.interval_millis;
        self.last_yield_millis = timer.now_millis();
    }

    /// Undo a [`Self::suspend`] or [`Self::stop`]. Resuming while running
    /// is a no-op.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn resume(&mut self, timer: &mut dyn TimerService) {
        if self.resume_millis != 0 {
            timer.arm_yield_timer(self.resume_millis);
            self.resume_millis = 0;
        }
    }
}
