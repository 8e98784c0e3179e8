//! rollcall-core - Offline-first attendance sync engine
//!
//! This crate contains the tenant-partitioned local store, the durable
//! mutation queue and the sync engine that delivers queued attendance writes
//! to the school's system-of-record once connectivity returns.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod services;
pub mod state;
pub mod store;
pub mod sync;
pub mod tenant;
mod util;

pub use config::{RemoteConfig, SyncConfig};
pub use error::{Error, Result};
pub use queue::MutationQueue;
pub use state::SyncStatus;
pub use store::{LocalStore, StorageBackend, TenantVisibility};
pub use sync::{HttpRemote, SyncEngine};
pub use tenant::{ActiveTenant, TenantId, TenantResolver};
