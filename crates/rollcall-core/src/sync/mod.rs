//! Synchronization with the remote system-of-record.
//!
//! [`SyncEngine`] drains the [`MutationQueue`](crate::queue::MutationQueue)
//! through a [`RemoteApi`], retrying transient failures with backoff and
//! moving entries that can never succeed out of the queue. Conflicts between
//! local and remote copies resolve last-write-wins on the domain timestamp,
//! with ties going to the remote copy.

mod backoff;
mod conflict;
mod engine;
mod remote;

#[cfg(test)]
mod tests;

pub use backoff::{retry_delay, RetryScheduler, ScheduledRetry};
pub use conflict::{
    conflict_winner, list_conflicts, reconcile_attendance, resolve_conflict, Reconciliation,
    Timestamped,
};
pub use engine::{SkipReason, SyncEngine, SyncNotice, SyncOutcome, SyncReport, SyncSnapshot};
pub use remote::{HttpRemote, RemoteApi, RemoteError, RemoteRequest, RemoteResponse, RemoteResult};
