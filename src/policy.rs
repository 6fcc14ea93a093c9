//! Policy definition, storage, and conflict resolution
//!
//! Policies are validated at write time: patterns normalize to canonical
//! segment form and conditions must pass schema validation, so evaluation
//! never encounters a malformed policy.

use crate::condition::ConditionExpr;
use crate::error::{AuthzError, Result};
use crate::pattern::SegmentPattern;
use crate::types::{PolicyId, RoleId, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Policy effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyEffect {
    /// Allow the action
    Allow,
    /// Deny the action
    Deny,
}

/// Policy definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy identifier
    pub id: PolicyId,

    /// Owning tenant
    pub tenant_id: TenantId,

    /// Allow or deny
    pub effect: PolicyEffect,

    /// Resource pattern in canonical segment form (e.g. "doc:*")
    pub resource: SegmentPattern,

    /// Action pattern (e.g. "read", "*")
    pub action: SegmentPattern,

    /// Role binding; empty means tenant-wide (applies to every subject)
    #[serde(default)]
    pub roles: Vec<RoleId>,

    /// Optional attribute condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpr>,

    /// Higher priority wins; deny beats allow at equal priority
    #[serde(default)]
    pub priority: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Build a policy, normalizing patterns at construction
    pub fn new(
        id: impl Into<PolicyId>,
        tenant_id: impl Into<TenantId>,
        effect: PolicyEffect,
        resource: &str,
        action: &str,
    ) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            effect,
            resource: SegmentPattern::parse(resource)?,
            action: SegmentPattern::parse(action)?,
            roles: Vec::new(),
            condition: None,
            priority: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_roles(mut self, roles: Vec<RoleId>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_condition(mut self, condition: ConditionExpr) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Write-time validation; malformed conditions never reach evaluation
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(AuthzError::InvalidPolicy("policy id cannot be empty".to_string()));
        }
        if self.tenant_id.is_empty() {
            return Err(AuthzError::InvalidPolicy(
                "policy tenant cannot be empty".to_string(),
            ));
        }
        if let Some(condition) = &self.condition {
            condition.validate()?;
        }
        Ok(())
    }

    /// Whether the policy's patterns cover the given resource and action
    pub fn covers(&self, resource: &str, action: &str) -> bool {
        self.resource.matches(resource) && self.action.matches(action)
    }

    /// Whether the policy applies to a subject holding `effective_roles`.
    /// Policies with no role binding are tenant-wide.
    pub fn binds(&self, effective_roles: &HashSet<RoleId>) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| effective_roles.contains(r))
    }
}

/// Select the winning policy among applicable ones.
///
/// Total order, so the same inputs always produce the same winner:
/// 1. highest priority
/// 2. deny beats allow at equal priority
/// 3. most recently updated
/// 4. id (final tie-break; two policies can never be "equal")
///
/// Pattern specificity is deliberately not part of the order; it is logged by
/// the engine for diagnostics only.
pub fn select_winner<'a>(applicable: &[&'a Policy]) -> Option<&'a Policy> {
    applicable.iter().copied().min_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| deny_rank(a).cmp(&deny_rank(b)))
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    })
}

fn deny_rank(policy: &Policy) -> u8 {
    match policy.effect {
        PolicyEffect::Deny => 0,
        PolicyEffect::Allow => 1,
    }
}

/// Policy store boundary
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, tenant_id: &str, policy_id: &str) -> Result<Option<Policy>>;

    /// Insert or update; validates the policy first
    async fn put(&self, policy: Policy) -> Result<()>;

    async fn delete(&self, tenant_id: &str, policy_id: &str) -> Result<()>;

    async fn list_tenant(&self, tenant_id: &str) -> Result<Vec<Policy>>;

    /// Policies whose patterns cover the resource and action
    async fn find_applicable(
        &self,
        tenant_id: &str,
        resource: &str,
        action: &str,
    ) -> Result<Vec<Policy>>;

    /// Whether any policy binds the given role
    async fn role_is_bound(&self, tenant_id: &str, role_id: &str) -> Result<bool>;
}

/// In-memory policy store, sharded by tenant
pub struct InMemoryPolicyStore {
    tenants: DashMap<TenantId, HashMap<PolicyId, Policy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get(&self, tenant_id: &str, policy_id: &str) -> Result<Option<Policy>> {
        Ok(self
            .tenants
            .get(tenant_id)
            .and_then(|policies| policies.get(policy_id).cloned()))
    }

    async fn put(&self, mut policy: Policy) -> Result<()> {
        policy.validate()?;
        policy.updated_at = Utc::now();
        self.tenants
            .entry(policy.tenant_id.clone())
            .or_default()
            .insert(policy.id.clone(), policy);
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, policy_id: &str) -> Result<()> {
        let removed = self
            .tenants
            .get_mut(tenant_id)
            .and_then(|mut policies| policies.remove(policy_id));
        if removed.is_none() {
            return Err(AuthzError::PolicyNotFound(policy_id.to_string()));
        }
        Ok(())
    }

    async fn list_tenant(&self, tenant_id: &str) -> Result<Vec<Policy>> {
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|policies| policies.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_applicable(
        &self,
        tenant_id: &str,
        resource: &str,
        action: &str,
    ) -> Result<Vec<Policy>> {
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|policies| {
                policies
                    .values()
                    .filter(|p| p.covers(resource, action))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn role_is_bound(&self, tenant_id: &str, role_id: &str) -> Result<bool> {
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|policies| {
                policies
                    .values()
                    .any(|p| p.roles.iter().any(|r| r == role_id))
            })
            .unwrap_or(false))
    }
}
