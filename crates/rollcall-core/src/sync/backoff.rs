//! Retry backoff and delayed work scheduling.
//!
//! The engine never sleeps inside a pass. When an attempt fails because the
//! remote was unreachable, the change is put on a [`RetryScheduler`] and the
//! driving loop wakes up at [`RetryScheduler::next_due`] to run another pass.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::ChangeId;
use crate::tenant::TenantId;

/// Delay before the given attempt (1-based); attempts past the ladder reuse its last step
pub fn retry_delay(delays: &[Duration], attempt: u32) -> Duration {
    let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
    delays
        .get(index)
        .or_else(|| delays.last())
        .copied()
        .unwrap_or(Duration::ZERO)
}

/// A change waiting for its next attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub due: Instant,
    pub change_id: ChangeId,
    pub tenant_id: TenantId,
    /// Attempt number this retry will be
    pub attempt: u32,
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.change_id.cmp(&other.change_id))
    }
}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of delayed retries ordered by due time
#[derive(Debug, Default)]
pub struct RetryScheduler {
    queue: BinaryHeap<Reverse<ScheduledRetry>>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `change_id` to be retried after `delay`; returns the due instant
    pub fn schedule(
        &mut self,
        change_id: ChangeId,
        tenant_id: TenantId,
        attempt: u32,
        delay: Duration,
    ) -> Instant {
        let due = Instant::now() + delay;
        self.queue.push(Reverse(ScheduledRetry {
            due,
            change_id,
            tenant_id,
            attempt,
        }));
        tracing::debug!("Retry of {change_id} (attempt {attempt}) scheduled in {delay:?}");
        due
    }

    /// Earliest due instant, if anything is scheduled
    pub fn next_due(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse(retry)| retry.due)
    }

    /// Remove and return every retry due at or before `now`, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<ScheduledRetry> {
        let mut due = Vec::new();
        while self.queue.peek().is_some_and(|Reverse(retry)| retry.due <= now) {
            if let Some(Reverse(retry)) = self.queue.pop() {
                due.push(retry);
            }
        }
        due
    }

    /// Forget scheduled retries of a change (delivered or failed meanwhile)
    pub fn cancel(&mut self, change_id: &ChangeId) {
        self.queue.retain(|Reverse(retry)| retry.change_id != *change_id);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
