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

use std::cmp::max;
use std::time::Duration;

use tracing::{Span, instrument};

use crate::error::WorldSwitchError::InvalidCpuCount;
use crate::Result;

/// The complete set of configuration needed to bring up the world-switch
/// subsystem for one VM.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VmmConfiguration {
    /// The size of the hypervisor stack shared between host and guest
    /// contexts. The value is rounded up to page granularity when the
    /// stack is allocated.
    stack_size: usize,
    /// The interval of the EMT yield timer in milliseconds.
    yield_interval_millis: u32,
    /// How many fresh allocations to try when the identity mapping of the
    /// core-code image keeps conflicting with existing mappings.
    id_map_retry_attempts: usize,
    /// The number of virtual CPUs.
    cpu_count: u32,
}

impl VmmConfiguration {
    /// The default size of the hypervisor stack
    pub const DEFAULT_STACK_SIZE: usize = 0x2000;
    /// The minimum size of the hypervisor stack
    pub const MIN_STACK_SIZE: usize = 0x1000;
    /// The default EMT yield interval in milliseconds.
    /// Value arrived at after experimenting with the grub boot prompt.
    pub const DEFAULT_YIELD_INTERVAL_MILLIS: u32 = 23;
    /// The minimum EMT yield interval in milliseconds
    pub const MIN_YIELD_INTERVAL_MILLIS: u32 = 1;
    /// The default number of allocation attempts when the identity mapping
    /// keeps conflicting
    pub const DEFAULT_ID_MAP_RETRY_ATTEMPTS: usize = 8234;
    /// The minimum number of identity-mapping allocation attempts
    pub const MIN_ID_MAP_RETRY_ATTEMPTS: usize = 1;
    /// The maximum supported virtual CPU count
    pub const MAX_CPU_COUNT: u32 = 256;

    /// Create a new configuration with the given sizes, clamping each to
    /// its minimum. The CPU count is validated, not clamped: an
    /// out-of-range count is a configuration error the caller must see.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(
        stack_size: Option<usize>,
        yield_interval: Option<Duration>,
        id_map_retry_attempts: Option<usize>,
        cpu_count: u32,
    ) -> Result<Self> {
        if cpu_count == 0 || cpu_count > Self::MAX_CPU_COUNT {
            return Err(InvalidCpuCount(cpu_count, Self::MAX_CPU_COUNT));
        }
        let yield_interval_millis = match yield_interval {
            Some(interval) => max(
                u32::try_from(interval.as_millis()).unwrap_or(u32::MAX),
                Self::MIN_YIELD_INTERVAL_MILLIS,
            ),
            None => Self::DEFAULT_YIELD_INTERVAL_MILLIS,
        };
        Ok(Self {
            stack_size: max(
                stack_size.unwrap_or(Self::DEFAULT_STACK_SIZE),
                Self::MIN_STACK_SIZE,
            ),
            yield_interval_millis,
            id_map_retry_attempts: max(
                id_map_retry_attempts.unwrap_or(Self::DEFAULT_ID_MAP_RETRY_ATTEMPTS),
                Self::MIN_ID_MAP_RETRY_ATTEMPTS,
            ),
            cpu_count,
        })
    }

    /// Get the configured hypervisor stack size
    pub fn get_stack_size(&self) -> usize {
        self.stack_size
    }

    /// Get the EMT yield interval in milliseconds
    pub fn get_yield_interval_millis(&self) -> u32 {
        self.yield_interval_millis
    }

    /// Get the identity-mapping retry bound
    pub fn get_id_map_retry_attempts(&self) -> usize {
        self.id_map_retry_attempts
    }

    /// Get the configured virtual CPU count
    pub fn get_cpu_count(&self) -> u32 {
        self.cpu_count
    }
}

impl Default for VmmConfiguration {
    fn default() -> Self {
        // a CPU count of 1 can never fail validation
        #[allow(clippy::unwrap_used)]
        Self::new(None, None, None, 1).unwrap()
    }
}
