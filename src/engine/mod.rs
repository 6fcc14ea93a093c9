//! Decision orchestrator
//!
//! Coordinates cache lookup, role resolution, policy evaluation, SoD
//! validation, cache population, and fire-and-forget audit emission.
//!
//! ```text
//! authorize → [cache] → RoleResolver → PolicyStore → conditions → SoD
//!                ↑                                                  │
//!                └───────────── cache put ── audit emit ────────────┘
//! ```
//!
//! The engine fails closed: store failures and deadline overruns surface as
//! deny decisions with a reason code, never as propagated errors.

pub mod audit;
pub mod cache;
pub mod metrics;

pub use audit::{AuditEvent, AuditPipeline, AuditSink, MemoryAuditSink};
pub use cache::{CacheConfig, CacheStats, DecisionCache};
pub use metrics::{EngineMetrics, MetricsCollector};

use crate::condition::EvalContext;
use crate::delegation::{DelegationGrant, DelegationRequest, DelegationStore};
use crate::error::{AuthzError, Result};
use crate::policy::{select_winner, Policy, PolicyEffect, PolicyStore};
use crate::role::{Role, RoleImplication, RoleResolver, RoleStore, UserRoleAssignment};
use crate::sod::{SodMode, SodPair, SodValidator};
use crate::types::{AuthzRequest, Decision, DecisionReason, RoleId};

use crate::policy::InMemoryPolicyStore;
use crate::role::InMemoryRoleStore;
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Enable the decision cache
    pub enable_cache: bool,

    /// Cache configuration
    pub cache_config: CacheConfig,

    /// Hard per-request deadline, well under the 200ms p95 budget
    pub request_timeout: Duration,

    /// Bounded audit queue capacity (drop-oldest on overflow)
    pub audit_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_config: CacheConfig::default(),
            request_timeout: Duration::from_millis(150),
            audit_queue_capacity: 4096,
        }
    }
}

/// Authorization decision engine
///
/// Safe under arbitrary concurrent `authorize` calls. The only mutable state
/// shared across calls is the per-tenant cache generation counter; stores are
/// read-mostly and tenant-sharded, so one tenant's write storm never takes a
/// lock another tenant's reads wait on.
pub struct AuthzEngine {
    role_store: Arc<dyn RoleStore>,
    policy_store: Arc<dyn PolicyStore>,
    resolver: RoleResolver,
    delegations: DelegationStore,
    sod: SodValidator,
    cache: DecisionCache,
    audit: AuditPipeline,
    metrics: MetricsCollector,
    config: EngineConfig,
}

impl AuthzEngine {
    /// Build an engine over the given store backends and audit sink
    pub fn new(
        config: EngineConfig,
        role_store: Arc<dyn RoleStore>,
        policy_store: Arc<dyn PolicyStore>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        let cache = DecisionCache::new(config.cache_config.clone());
        let audit = AuditPipeline::new(audit_sink, config.audit_queue_capacity);

        info!(
            cache = config.enable_cache,
            timeout_ms = config.request_timeout.as_millis() as u64,
            "authorization engine initialized"
        );

        Self {
            resolver: RoleResolver::new(Arc::clone(&role_store)),
            role_store,
            policy_store,
            delegations: DelegationStore::new(),
            sod: SodValidator::new(),
            cache,
            audit,
            metrics: MetricsCollector::new(),
            config,
        }
    }

    /// Engine over in-memory stores with an in-memory audit sink
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryRoleStore::new()),
            Arc::new(InMemoryPolicyStore::new()),
            Arc::new(MemoryAuditSink::new()),
        )
    }

    /// Evaluate an authorization request end to end
    pub async fn authorize(&self, request: &AuthzRequest) -> Result<Decision> {
        let start = Instant::now();
        let deadline = start + self.config.request_timeout;

        debug!(
            tenant = %request.tenant_id,
            subject = %request.subject_id,
            resource = %request.resource,
            action = %request.action,
            "authorization request"
        );

        // Cache lookup; a hit bypasses resolver and evaluator entirely
        let generation = self.cache.generation(&request.tenant_id);
        let key = DecisionCache::compute_key(request, generation);

        if self.config.enable_cache {
            if let Some(decision) = self.cache.get(&request.tenant_id, &key) {
                self.metrics.record_cache_hit();
                self.metrics.record_latency(start.elapsed());
                debug!(tenant = %request.tenant_id, "decision cache hit");
                return Ok(decision);
            }
            self.metrics.record_cache_miss();
        }

        // Role resolution, including roles held through delegation
        let now = Utc::now();
        let delegated = self
            .delegations
            .delegated_roles(&request.tenant_id, &request.subject_id, now);
        let effective = match self
            .resolver
            .resolve(&request.tenant_id, &request.subject_id, now, &delegated, deadline)
            .await
        {
            Ok(effective) => effective,
            Err(AuthzError::DeadlineExceeded) => {
                return Ok(self.finish_timeout(request, start));
            }
            Err(e) => return Ok(self.finish_unavailable(request, start, e)),
        };

        if Instant::now() >= deadline {
            return Ok(self.finish_timeout(request, start));
        }

        // Gather applicable policies and filter by role binding
        let candidates = match self
            .policy_store
            .find_applicable(&request.tenant_id, &request.resource, &request.action)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => return Ok(self.finish_unavailable(request, start, e)),
        };

        let eval_ctx = build_eval_context(request, &effective.roles);
        let mut applicable: Vec<&Policy> = Vec::new();
        for policy in &candidates {
            if Instant::now() >= deadline {
                return Ok(self.finish_timeout(request, start));
            }
            if !policy.binds(&effective.roles) {
                continue;
            }
            if let Some(condition) = &policy.condition {
                if !condition.evaluate(&eval_ctx) {
                    continue;
                }
            }
            applicable.push(policy);
        }

        // Conflict resolution; absence of any applicable policy is a deny
        let mut decision = match select_winner(&applicable) {
            Some(winner) => {
                debug!(
                    policy = %winner.id,
                    priority = winner.priority,
                    specificity = winner.resource.specificity(),
                    effect = ?winner.effect,
                    "winning policy selected"
                );
                match winner.effect {
                    PolicyEffect::Allow => Decision::allow(winner.id.clone()),
                    PolicyEffect::Deny => Decision::deny(winner.id.clone()),
                }
            }
            None => {
                debug!(tenant = %request.tenant_id, "no applicable policy, default deny");
                Decision::deny_with_reason(DecisionReason::DefaultDeny)
            }
        };

        // SoD validation runs before the decision is cached; caching a
        // decision that masks a violation would be a security bug.
        // Administrative roles in the effective set get flagged for audit.
        let mut flags = effective.flags.clone();
        match self.role_store.administrative_roles(&request.tenant_id).await {
            Ok(admin_roles) => {
                for role in effective.roles.intersection(&admin_roles) {
                    flags.push(format!("administrative_role:{}", role));
                }
            }
            Err(e) => return Ok(self.finish_unavailable(request, start, e)),
        }
        let conflicts = self.sod.check_conflicts(&request.tenant_id, &effective.roles);
        if !conflicts.is_empty() {
            for conflict in &conflicts {
                flags.push(conflict.flag());
            }
            match self.sod.mode(&request.tenant_id) {
                SodMode::PreventAndAlert if decision.allowed => {
                    warn!(
                        tenant = %request.tenant_id,
                        subject = %request.subject_id,
                        conflicts = conflicts.len(),
                        "segregation-of-duty conflict blocked request"
                    );
                    self.metrics.record_sod_block();
                    decision = Decision::deny_with_reason(DecisionReason::SodViolation);
                }
                _ => {
                    for conflict in &conflicts {
                        decision = decision.with_obligation(conflict.flag());
                    }
                }
            }
        }

        if self.config.enable_cache {
            self.cache.put(&request.tenant_id, key, decision.clone());
        }

        self.finish(request, start, decision, flags)
    }

    /// Diagnostic: a user's full effective role set
    pub async fn effective_roles(&self, tenant_id: &str, user_id: &str) -> Result<HashSet<RoleId>> {
        let now = Utc::now();
        let delegated = self.delegations.delegated_roles(tenant_id, user_id, now);
        let deadline = Instant::now() + self.config.request_timeout;
        let effective = self
            .resolver
            .resolve(tenant_id, user_id, now, &delegated, deadline)
            .await?;
        Ok(effective.roles)
    }

    // Write APIs. Each completed write bumps the tenant's cache generation
    // before returning, so every authorize call that starts afterwards sees
    // post-write state.

    pub async fn put_policy(&self, policy: Policy) -> Result<()> {
        let tenant_id = policy.tenant_id.clone();
        self.policy_store.put(policy).await?;
        self.cache.invalidate_tenant(&tenant_id);
        Ok(())
    }

    pub async fn delete_policy(&self, tenant_id: &str, policy_id: &str) -> Result<()> {
        self.policy_store.delete(tenant_id, policy_id).await?;
        self.cache.invalidate_tenant(tenant_id);
        Ok(())
    }

    pub async fn put_role(&self, role: Role) -> Result<()> {
        let tenant_id = role.tenant_id.clone();
        self.role_store.put_role(role).await?;
        self.cache.invalidate_tenant(&tenant_id);
        Ok(())
    }

    /// Delete a role; refused while referenced by an assignment or a policy
    /// role binding
    pub async fn delete_role(&self, tenant_id: &str, role_id: &str) -> Result<()> {
        if self.policy_store.role_is_bound(tenant_id, role_id).await? {
            return Err(AuthzError::InUse(format!(
                "role '{}' is bound by a policy",
                role_id
            )));
        }
        self.role_store.delete_role(tenant_id, role_id).await?;
        self.cache.invalidate_tenant(tenant_id);
        Ok(())
    }

    pub async fn put_implication(&self, tenant_id: &str, implication: RoleImplication) -> Result<()> {
        self.role_store.put_implication(tenant_id, implication).await?;
        self.cache.invalidate_tenant(tenant_id);
        Ok(())
    }

    pub async fn assign_role(&self, assignment: UserRoleAssignment) -> Result<()> {
        let tenant_id = assignment.tenant_id.clone();
        self.role_store.assign(assignment).await?;
        self.cache.invalidate_tenant(&tenant_id);
        Ok(())
    }

    pub async fn revoke_role(&self, tenant_id: &str, user_id: &str, role_id: &str) -> Result<()> {
        self.role_store.revoke(tenant_id, user_id, role_id).await?;
        self.cache.invalidate_tenant(tenant_id);
        Ok(())
    }

    pub fn put_sod_pair(&self, pair: SodPair) {
        let tenant_id = pair.tenant_id.clone();
        self.sod.put_pair(pair);
        self.cache.invalidate_tenant(&tenant_id);
    }

    pub fn set_sod_mode(&self, tenant_id: &str, mode: SodMode) {
        self.sod.set_mode(tenant_id, mode);
        self.cache.invalidate_tenant(tenant_id);
    }

    /// Create a delegation grant. A delegator holding the role directly or
    /// via hierarchy starts a fresh chain; one holding it only through a
    /// prior grant extends that chain, subject to its depth bound.
    pub async fn delegate(&self, request: DelegationRequest) -> Result<DelegationGrant> {
        let now = Utc::now();
        let deadline = Instant::now() + self.config.request_timeout;
        // Resolve without delegation grants so prior-grant holders go
        // through the chain-extension path in the store
        let holds_directly = self
            .resolver
            .resolve(&request.tenant_id, &request.delegator, now, &[], deadline)
            .await?
            .roles
            .contains(&request.role_id);

        let tenant_id = request.tenant_id.clone();
        let grant = self.delegations.grant(request, holds_directly, now)?;
        self.cache.invalidate_tenant(&tenant_id);
        Ok(grant)
    }

    pub fn revoke_delegation(&self, tenant_id: &str, grant_id: &str) -> Result<()> {
        self.delegations.revoke(tenant_id, grant_id)?;
        self.cache.invalidate_tenant(tenant_id);
        Ok(())
    }

    /// Current metrics snapshot
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.snapshot()
    }

    /// Cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Audit events dropped due to queue overflow
    pub fn audit_dropped(&self) -> usize {
        self.audit.dropped()
    }

    /// Drain the audit queue (test/diagnostic helper)
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    // Terminal helpers; every path records metrics and emits audit

    fn finish(
        &self,
        request: &AuthzRequest,
        start: Instant,
        decision: Decision,
        flags: Vec<String>,
    ) -> Result<Decision> {
        self.metrics.record_decision(decision.allowed);
        self.metrics.record_latency(start.elapsed());
        self.audit.emit(AuditEvent::from_decision(
            &request.tenant_id,
            &request.subject_id,
            &request.resource,
            &request.action,
            &decision,
            flags,
        ));
        info!(
            tenant = %request.tenant_id,
            subject = %request.subject_id,
            resource = %request.resource,
            action = %request.action,
            allowed = decision.allowed,
            reason = ?decision.reason,
            "decision"
        );
        Ok(decision)
    }

    fn finish_timeout(&self, request: &AuthzRequest, start: Instant) -> Decision {
        warn!(
            tenant = %request.tenant_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "request deadline exceeded, denying"
        );
        self.metrics.record_timeout();
        let decision = Decision::deny_with_reason(DecisionReason::Timeout);
        // Timeout decisions are never cached; they reflect load, not policy
        let _ = self.finish(request, start, decision.clone(), Vec::new());
        decision
    }

    fn finish_unavailable(
        &self,
        request: &AuthzRequest,
        start: Instant,
        error: AuthzError,
    ) -> Decision {
        warn!(tenant = %request.tenant_id, error = %error, "store failure, failing closed");
        let decision = Decision::deny_with_reason(DecisionReason::StoreUnavailable);
        let _ = self.finish(request, start, decision.clone(), Vec::new());
        decision
    }
}

fn build_eval_context(request: &AuthzRequest, effective_roles: &HashSet<RoleId>) -> EvalContext {
    let mut subject: HashMap<String, serde_json::Value> = request.subject_attrs.clone();
    subject.insert("id".to_string(), json!(request.subject_id));
    let mut roles: Vec<&String> = effective_roles.iter().collect();
    roles.sort();
    subject.insert("roles".to_string(), json!(roles));

    let mut resource: HashMap<String, serde_json::Value> = request.resource_attrs.clone();
    resource.insert("id".to_string(), json!(request.resource));

    EvalContext::new()
        .with_subject(subject)
        .with_resource(resource)
        .with_context(request.context.clone())
}
