//! Role delegation with bounded re-delegation depth
//!
//! A grant lets a delegatee exercise a role the delegator holds. Chains are
//! bounded (`max_depth`, default 3) and a grant that would hand a role back
//! to anyone earlier in its own chain is rejected at write time.

use crate::error::{AuthzError, Result};
use crate::types::{RoleId, TenantId, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum delegation chain depth
pub const DEFAULT_MAX_DEPTH: u32 = 3;

/// A delegation grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationGrant {
    pub id: String,
    pub tenant_id: TenantId,
    pub delegator: UserId,
    pub delegatee: UserId,
    pub role_id: RoleId,

    /// Position in the chain: 1 for a grant from a direct holder
    pub depth: u32,

    /// Chain bound, inherited from the parent grant on re-delegation
    pub max_depth: u32,

    /// Grants across department boundaries must be explicitly marked
    #[serde(default)]
    pub cross_department: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl DelegationGrant {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Parameters for a new grant
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub tenant_id: TenantId,
    pub delegator: UserId,
    pub delegatee: UserId,
    pub role_id: RoleId,
    pub max_depth: u32,
    pub cross_department: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl DelegationRequest {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        delegator: impl Into<UserId>,
        delegatee: impl Into<UserId>,
        role_id: impl Into<RoleId>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            delegator: delegator.into(),
            delegatee: delegatee.into(),
            role_id: role_id.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            cross_department: false,
            expires_at: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn expiring(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// In-memory delegation store, sharded by tenant
pub struct DelegationStore {
    tenants: DashMap<TenantId, Vec<DelegationGrant>>,
}

impl DelegationStore {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }

    /// Record a grant.
    ///
    /// `delegator_holds_directly` is supplied by the orchestrator (which can
    /// see the role store); when false the delegator must itself hold an
    /// active grant for the role, and the new grant extends that chain.
    pub fn grant(
        &self,
        request: DelegationRequest,
        delegator_holds_directly: bool,
        now: DateTime<Utc>,
    ) -> Result<DelegationGrant> {
        if request.delegator == request.delegatee {
            return Err(AuthzError::InvalidDelegation(
                "cannot delegate to self".to_string(),
            ));
        }
        if let Some(expires_at) = request.expires_at {
            if expires_at <= now {
                return Err(AuthzError::InvalidDelegation(
                    "expiry must be in the future".to_string(),
                ));
            }
        }

        let mut tenant = self.tenants.entry(request.tenant_id.clone()).or_default();

        let (depth, max_depth) = if delegator_holds_directly {
            (1, request.max_depth)
        } else {
            let parent = tenant
                .iter()
                .filter(|g| {
                    g.delegatee == request.delegator
                        && g.role_id == request.role_id
                        && g.is_active(now)
                })
                .max_by_key(|g| g.depth)
                .cloned()
                .ok_or_else(|| {
                    AuthzError::InvalidDelegation(format!(
                        "delegator '{}' does not hold role '{}'",
                        request.delegator, request.role_id
                    ))
                })?;

            let depth = parent.depth + 1;
            if depth > parent.max_depth {
                return Err(AuthzError::InvalidDelegation(format!(
                    "delegation depth {} exceeds chain limit {}",
                    depth, parent.max_depth
                )));
            }

            // Reject handing the role back to anyone earlier in the chain
            let mut chain = vec![parent.delegator.clone()];
            let mut cursor = parent.clone();
            while cursor.depth > 1 {
                match tenant.iter().find(|g| {
                    g.delegatee == cursor.delegator
                        && g.role_id == cursor.role_id
                        && g.depth == cursor.depth - 1
                }) {
                    Some(prev) => {
                        chain.push(prev.delegator.clone());
                        cursor = prev.clone();
                    }
                    None => break,
                }
            }
            if chain.contains(&request.delegatee) {
                return Err(AuthzError::InvalidDelegation(format!(
                    "delegation of '{}' back to '{}' closes a cycle",
                    request.role_id, request.delegatee
                )));
            }

            (depth, parent.max_depth)
        };

        let grant = DelegationGrant {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id,
            delegator: request.delegator,
            delegatee: request.delegatee,
            role_id: request.role_id,
            depth,
            max_depth,
            cross_department: request.cross_department,
            expires_at: request.expires_at,
        };

        tenant.push(grant.clone());
        Ok(grant)
    }

    /// Remove a grant by id
    pub fn revoke(&self, tenant_id: &str, grant_id: &str) -> Result<()> {
        let mut tenant = self
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| AuthzError::InvalidInput(format!("unknown grant '{}'", grant_id)))?;
        let before = tenant.len();
        tenant.retain(|g| g.id != grant_id);
        if tenant.len() == before {
            return Err(AuthzError::InvalidInput(format!("unknown grant '{}'", grant_id)));
        }
        Ok(())
    }

    /// Roles a user currently holds through active grants
    pub fn delegated_roles(&self, tenant_id: &str, user_id: &str, now: DateTime<Utc>) -> Vec<RoleId> {
        self.tenants
            .get(tenant_id)
            .map(|grants| {
                grants
                    .iter()
                    .filter(|g| g.delegatee == user_id && g.is_active(now))
                    .map(|g| g.role_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for DelegationStore {
    fn default() -> Self {
        Self::new()
    }
}
