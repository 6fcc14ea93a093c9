//! Core authorization types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique policy identifier
pub type PolicyId = String;

/// Unique role identifier
pub type RoleId = String;

/// Tenant identifier
pub type TenantId = String;

/// User / subject identifier
pub type UserId = String;

/// Authorization request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthzRequest {
    /// Tenant the request is scoped to
    pub tenant_id: TenantId,

    /// Subject making the request (e.g. "user:alice@example.com")
    pub subject_id: UserId,

    /// Resource being accessed (e.g. "doc:42", "api/payments/refund")
    pub resource: String,

    /// Action being performed (read, write, delete, ...)
    pub action: String,

    /// Subject attributes for condition evaluation (department, clearance, ...)
    #[serde(default)]
    pub subject_attrs: HashMap<String, serde_json::Value>,

    /// Resource attributes for condition evaluation (owner, sensitivity, ...)
    #[serde(default)]
    pub resource_attrs: HashMap<String, serde_json::Value>,

    /// Additional context attributes (time-of-day, ip reputation, device
    /// trust, risk score, ...)
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl AuthzRequest {
    /// Create a request with empty context
    pub fn new(
        tenant_id: impl Into<TenantId>,
        subject_id: impl Into<UserId>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            subject_id: subject_id.into(),
            resource: resource.into(),
            action: action.into(),
            subject_attrs: HashMap::new(),
            resource_attrs: HashMap::new(),
            context: HashMap::new(),
        }
    }

    /// Add a context attribute
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Add a subject attribute
    pub fn with_subject_attr(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.subject_attrs.insert(key.into(), value);
        self
    }

    /// Add a resource attribute
    pub fn with_resource_attr(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.resource_attrs.insert(key.into(), value);
        self
    }
}

/// Reason for an authorization decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionReason {
    /// A policy matched and determined the outcome
    PolicyMatch,

    /// No applicable policy; default-deny posture
    DefaultDeny,

    /// Evaluation exceeded the per-request deadline
    Timeout,

    /// A segregation-of-duty conflict blocked the request
    SodViolation,

    /// A backing store was unavailable; engine failed closed
    StoreUnavailable,
}

/// Authorization decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Unique decision identifier
    pub id: String,

    /// Whether the request is allowed
    pub allowed: bool,

    /// Why the decision came out this way
    pub reason: DecisionReason,

    /// Policy that determined the decision, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_policy: Option<PolicyId>,

    /// Obligations attached to the decision (e.g. SoD alert flags)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<String>,

    /// Decision timestamp (milliseconds since epoch)
    pub timestamp: u64,
}

impl Decision {
    fn new(allowed: bool, reason: DecisionReason, matched_policy: Option<PolicyId>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            allowed,
            reason,
            matched_policy,
            obligations: Vec::new(),
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        }
    }

    /// Allow via a matched policy
    pub fn allow(policy_id: impl Into<PolicyId>) -> Self {
        Self::new(true, DecisionReason::PolicyMatch, Some(policy_id.into()))
    }

    /// Deny via a matched policy
    pub fn deny(policy_id: impl Into<PolicyId>) -> Self {
        Self::new(false, DecisionReason::PolicyMatch, Some(policy_id.into()))
    }

    /// Deny with a non-policy reason (default deny, timeout, SoD, store down)
    pub fn deny_with_reason(reason: DecisionReason) -> Self {
        Self::new(false, reason, None)
    }

    /// Attach an obligation flag
    pub fn with_obligation(mut self, obligation: impl Into<String>) -> Self {
        self.obligations.push(obligation.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = AuthzRequest::new("tenant-1", "user:alice", "doc:42", "read")
            .with_context("risk_score", serde_json::json!(12));

        assert_eq!(request.tenant_id, "tenant-1");
        assert_eq!(request.context.get("risk_score"), Some(&serde_json::json!(12)));
    }

    #[test]
    fn test_decision_creation() {
        let decision = Decision::allow("policy-1");
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::PolicyMatch);
        assert_eq!(decision.matched_policy.as_deref(), Some("policy-1"));
        assert!(!decision.id.is_empty());

        let deny = Decision::deny_with_reason(DecisionReason::DefaultDeny);
        assert!(!deny.allowed);
        assert!(deny.matched_policy.is_none());
    }

    #[test]
    fn test_decision_obligations() {
        let decision = Decision::allow("policy-1").with_obligation("sod_alert:auditor+payer");
        assert_eq!(decision.obligations.len(), 1);
    }
}
