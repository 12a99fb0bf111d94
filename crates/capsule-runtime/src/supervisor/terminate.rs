//! Bounded thread termination
//!
//! Threads are never killed from the outside. Each attempt raises every
//! flag a live thread can observe (interrupt, low priority, stop) and then
//! waits up to the retry delay for the group to drain.

use crate::params::Termination;
use crate::task::group::ThreadGroup;

/// Stop every thread in `group`; `Err` carries the number still alive
pub(crate) fn escalate(group: &ThreadGroup, termination: &Termination) -> Result<(), usize> {
    for attempt in 1..=termination.retries {
        let live = group.live_controls();
        if live.is_empty() {
            return Ok(());
        }

        for control in &live {
            control.interrupt();
            control.lower_priority();
            control.request_stop();
        }

        if group.join_all(termination.retry_delay) {
            tracing::debug!(group = %group.id(), attempt, "group drained");
            return Ok(());
        }
        tracing::debug!(
            group = %group.id(),
            attempt,
            remaining = group.active_count(),
            "threads still running"
        );
    }

    match group.active_count() {
        0 => Ok(()),
        remaining => Err(remaining),
    }
}
