//! Tenant (school) identity and the active-tenant seam.
//!
//! Store and queue calls take the tenant explicitly: write paths require a
//! `&TenantId`, read paths accept `Option<&TenantId>` and return nothing when
//! no tenant is active. The resolver is only consulted by callers that need
//! "the current tenant" once per logical operation.

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of an isolated school/organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id, rejecting blank values.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput(
                "tenant id must not be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Source of the current tenant. May answer "none" (signed out, not yet resolved).
pub trait TenantResolver: Send + Sync {
    fn current_tenant(&self) -> Option<TenantId>;

    /// Resolve the tenant for a write, rejecting the call when none is active.
    fn require_tenant(&self) -> Result<TenantId> {
        self.current_tenant().ok_or(Error::TenantMissing)
    }
}

/// Session-scoped active tenant, switched when the user changes school.
#[derive(Debug, Default)]
pub struct ActiveTenant {
    current: RwLock<Option<TenantId>>,
}

impl ActiveTenant {
    /// No tenant active.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the given tenant active.
    pub fn with_tenant(tenant: TenantId) -> Self {
        Self {
            current: RwLock::new(Some(tenant)),
        }
    }

    /// Make `tenant` the active tenant. Data of the previous tenant is untouched.
    pub fn switch_to(&self, tenant: TenantId) {
        tracing::info!("Switching active tenant to {tenant}");
        *self.write_guard() = Some(tenant);
    }

    /// Clear the active tenant (sign-out).
    pub fn clear(&self) {
        *self.write_guard() = None;
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Option<TenantId>> {
        self.current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TenantResolver for ActiveTenant {
    fn current_tenant(&self) -> Option<TenantId> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
