//! Shared sync status shown by clients.

use std::fmt;

/// Ambient sync indicator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Offline,
    Syncing,
    /// Changes waiting for the active tenant
    Pending(usize),
    Synced,
}

impl SyncStatus {
    /// Derive the indicator from connectivity, pass activity and queue depth
    pub const fn from_parts(online: bool, syncing: bool, pending: usize) -> Self {
        if !online {
            Self::Offline
        } else if syncing {
            Self::Syncing
        } else if pending > 0 {
            Self::Pending(pending)
        } else {
            Self::Synced
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => f.write_str("Offline"),
            Self::Syncing => f.write_str("Syncing…"),
            Self::Pending(count) => write!(f, "{count} pending"),
            Self::Synced => f.write_str("Synced"),
        }
    }
}
