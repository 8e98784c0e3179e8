//! Client-facing services built on the store and queue.

mod attendance;

pub use attendance::{
    AttendanceCounts, AttendanceDraft, AttendanceRecorder, SavedAttendance,
};
