//! Data models for rollcall

mod attendance;
mod change;
mod payload;
mod sync_conflict;

pub use attendance::{AttendanceRecord, AttendanceStatus, SessionRecord, SessionStatus};
pub use change::{ActionKind, ChangeId, ChangeRecord, ChangeStatus};
pub use payload::{
    AttendanceBatchPayload, AttendanceSinglePayload, BatchSyncSummary, MarkedAttendance,
};
pub use sync_conflict::{ConflictWinner, SyncConflict};
