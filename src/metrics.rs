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

use crate::driver::host_call::HostCallOp;
use crate::services::TerminalStatus;

// Counter metric that counts completed guest transitions by terminal status
pub(crate) static METRIC_GUEST_TRANSITIONS: &str = "guest_transitions_total";
pub(crate) static METRIC_GUEST_TRANSITIONS_LABEL_STATUS: &str = "status";

// Counter metric that counts serviced host-call requests by operation
pub(crate) static METRIC_HOST_CALLS: &str = "host_calls_total";
pub(crate) static METRIC_HOST_CALLS_LABEL_OPERATION: &str = "operation";

/// Emit the transition counter for one completed guest run
pub(crate) fn record_transition(status: TerminalStatus) {
    metrics::counter!(
        METRIC_GUEST_TRANSITIONS,
        METRIC_GUEST_TRANSITIONS_LABEL_STATUS => status.name()
    )
    .increment(1);
}

/// Emit the host-call counter for one dispatched request
pub(crate) fn record_host_call(op: HostCallOp) {
    metrics::counter!(
        METRIC_HOST_CALLS,
        METRIC_HOST_CALLS_LABEL_OPERATION => op.name()
    )
    .increment(1);
}
