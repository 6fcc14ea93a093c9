//! Segregation-of-duty validation
//!
//! Tenants configure pairs of conflicting roles. After role resolution the
//! validator reports every pair fully present in the effective set; the
//! orchestrator then blocks or flags per the tenant's enforcement mode.

use crate::types::{RoleId, TenantId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Tenant enforcement mode for SoD conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SodMode {
    /// Conflicting access is denied and flagged
    #[default]
    PreventAndAlert,

    /// Access proceeds but the conflict is flagged for audit
    AlertOnly,
}

/// A pair of roles one identity must not hold together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SodPair {
    pub tenant_id: TenantId,
    pub first: RoleId,
    pub second: RoleId,
}

impl SodPair {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        first: impl Into<RoleId>,
        second: impl Into<RoleId>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            first: first.into(),
            second: second.into(),
        }
    }

    fn matches(&self, effective: &HashSet<RoleId>) -> bool {
        effective.contains(&self.first) && effective.contains(&self.second)
    }
}

/// A detected conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SodConflict {
    pub first: RoleId,
    pub second: RoleId,
}

impl SodConflict {
    /// Audit flag form, e.g. "sod_conflict:data_modifier+approval_officer"
    pub fn flag(&self) -> String {
        format!("sod_conflict:{}+{}", self.first, self.second)
    }
}

#[derive(Default)]
struct TenantSod {
    pairs: Vec<SodPair>,
    mode: SodMode,
}

/// Holds per-tenant SoD configuration and checks effective role sets
pub struct SodValidator {
    tenants: DashMap<TenantId, TenantSod>,
}

impl SodValidator {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }

    /// Add a conflicting pair for a tenant; duplicates (in either order) are
    /// collapsed
    pub fn put_pair(&self, pair: SodPair) {
        let mut tenant = self.tenants.entry(pair.tenant_id.clone()).or_default();
        let exists = tenant.pairs.iter().any(|p| {
            (p.first == pair.first && p.second == pair.second)
                || (p.first == pair.second && p.second == pair.first)
        });
        if !exists {
            tenant.pairs.push(pair);
        }
    }

    /// Set the tenant's enforcement mode
    pub fn set_mode(&self, tenant_id: &str, mode: SodMode) {
        self.tenants.entry(tenant_id.to_string()).or_default().mode = mode;
    }

    pub fn mode(&self, tenant_id: &str) -> SodMode {
        self.tenants
            .get(tenant_id)
            .map(|t| t.mode)
            .unwrap_or_default()
    }

    /// Report every configured pair fully contained in the effective set
    pub fn check_conflicts(
        &self,
        tenant_id: &str,
        effective_roles: &HashSet<RoleId>,
    ) -> Vec<SodConflict> {
        self.tenants
            .get(tenant_id)
            .map(|tenant| {
                tenant
                    .pairs
                    .iter()
                    .filter(|pair| pair.matches(effective_roles))
                    .map(|pair| SodConflict {
                        first: pair.first.clone(),
                        second: pair.second.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for SodValidator {
    fn default() -> Self {
        Self::new()
    }
}
