//! End-to-end decision pipeline tests
//!
//! Covers the documented decision properties: determinism, deny-overrides,
//! default deny, SoD enforcement, delegation bounds, and cycle tolerance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tenant_authz::{
    AuthzEngine, AuthzRequest, CompareOp, ConditionExpr, DecisionReason, DelegationRequest,
    EngineConfig, InMemoryPolicyStore, InMemoryRoleStore, MemoryAuditSink, Policy, PolicyEffect,
    Role, SodMode, SodPair, UserRoleAssignment,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine_with_sink() -> (AuthzEngine, Arc<MemoryAuditSink>) {
    init_tracing();
    let sink = Arc::new(MemoryAuditSink::new());
    let engine = AuthzEngine::new(
        EngineConfig::default(),
        Arc::new(InMemoryRoleStore::new()),
        Arc::new(InMemoryPolicyStore::new()),
        sink.clone(),
    );
    (engine, sink)
}

fn allow(id: &str, tenant: &str, resource: &str, priority: i32) -> Policy {
    Policy::new(id, tenant, PolicyEffect::Allow, resource, "read")
        .unwrap()
        .with_priority(priority)
}

fn deny(id: &str, tenant: &str, resource: &str, priority: i32) -> Policy {
    Policy::new(id, tenant, PolicyEffect::Deny, resource, "read")
        .unwrap()
        .with_priority(priority)
}

// ============================================================================
// CONFLICT RESOLUTION
// ============================================================================

#[tokio::test]
async fn test_default_deny_when_nothing_matches() {
    let (engine, _) = engine_with_sink();
    let decision = engine
        .authorize(&AuthzRequest::new("t1", "user:alice", "doc:42", "read"))
        .await
        .unwrap();

    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::DefaultDeny);
    assert!(decision.matched_policy.is_none());
}

#[tokio::test]
async fn test_deny_beats_allow_at_equal_priority() {
    let (engine, _) = engine_with_sink();
    engine.put_policy(allow("allow-all-docs", "t1", "doc:*", 10)).await.unwrap();
    engine.put_policy(deny("deny-doc-42", "t1", "doc:42", 10)).await.unwrap();

    // Exact-resource deny at equal priority beats the wildcard allow
    let decision = engine
        .authorize(&AuthzRequest::new("t1", "user:alice", "doc:42", "read"))
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.matched_policy.as_deref(), Some("deny-doc-42"));

    // Other documents only match the allow
    let decision = engine
        .authorize(&AuthzRequest::new("t1", "user:alice", "doc:7", "read"))
        .await
        .unwrap();
    assert!(decision.allowed);
}

#[tokio::test]
async fn test_higher_priority_allow_beats_lower_priority_deny() {
    let (engine, _) = engine_with_sink();
    engine.put_policy(deny("deny-low", "t1", "doc:*", 5)).await.unwrap();
    engine.put_policy(allow("allow-high", "t1", "doc:42", 20)).await.unwrap();

    let decision = engine
        .authorize(&AuthzRequest::new("t1", "user:alice", "doc:42", "read"))
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.matched_policy.as_deref(), Some("allow-high"));
}

#[tokio::test]
async fn test_decisions_are_deterministic() {
    let (engine, _) = engine_with_sink();
    engine.put_policy(allow("a1", "t1", "doc:*", 10)).await.unwrap();
    engine.put_policy(deny("d1", "t1", "doc:42", 10)).await.unwrap();
    engine.put_policy(allow("a2", "t1", "doc:42", 10)).await.unwrap();

    let request = AuthzRequest::new("t1", "user:alice", "doc:42", "read");
    let first = engine.authorize(&request).await.unwrap();
    for _ in 0..50 {
        let next = engine.authorize(&request).await.unwrap();
        assert_eq!(next.allowed, first.allowed);
        assert_eq!(next.matched_policy, first.matched_policy);
    }
}

// ============================================================================
// ROLE BINDING AND CONDITIONS
// ============================================================================

#[tokio::test]
async fn test_role_bound_policy_requires_effective_role() {
    let (engine, _) = engine_with_sink();
    engine.put_role(Role::new("employee", "Employee", "t1")).await.unwrap();
    engine
        .put_role(Role::new("manager", "Manager", "t1").with_parent("employee"))
        .await
        .unwrap();
    engine
        .put_policy(
            allow("managers-read", "t1", "report:*", 10).with_roles(vec!["employee".to_string()]),
        )
        .await
        .unwrap();

    // No assignment: policy does not bind, default deny
    let request = AuthzRequest::new("t1", "user:bob", "report:q3", "read");
    assert!(!engine.authorize(&request).await.unwrap().allowed);

    // Manager inherits employee through the hierarchy
    engine
        .assign_role(UserRoleAssignment::new("user:bob", "manager", "t1", "user:root"))
        .await
        .unwrap();
    assert!(engine.authorize(&request).await.unwrap().allowed);
}

#[tokio::test]
async fn test_condition_gates_policy() {
    let (engine, _) = engine_with_sink();
    engine
        .put_policy(
            allow("office-hours", "t1", "doc:*", 10).with_condition(
                ConditionExpr::All {
                    exprs: vec![
                        ConditionExpr::compare(
                            "context.hour_of_day",
                            CompareOp::Ge,
                            serde_json::json!(9),
                        )
                        .unwrap(),
                        ConditionExpr::compare(
                            "context.hour_of_day",
                            CompareOp::Lt,
                            serde_json::json!(17),
                        )
                        .unwrap(),
                    ],
                },
            ),
        )
        .await
        .unwrap();

    let in_hours = AuthzRequest::new("t1", "user:alice", "doc:42", "read")
        .with_context("hour_of_day", serde_json::json!(14));
    assert!(engine.authorize(&in_hours).await.unwrap().allowed);

    let after_hours = AuthzRequest::new("t1", "user:alice", "doc:42", "read")
        .with_context("hour_of_day", serde_json::json!(23));
    assert!(!engine.authorize(&after_hours).await.unwrap().allowed);

    // Missing attribute fails the condition, not the request
    let no_context = AuthzRequest::new("t1", "user:alice", "doc:42", "read");
    let decision = engine.authorize(&no_context).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::DefaultDeny);
}

#[tokio::test]
async fn test_owner_condition_on_resource_attrs() {
    let (engine, _) = engine_with_sink();
    engine
        .put_policy(
            allow("owner-writes", "t1", "doc:*", 10).with_condition(
                ConditionExpr::compare("resource.owner", CompareOp::Eq, serde_json::json!("user:alice"))
                    .unwrap(),
            ),
        )
        .await
        .unwrap();

    let owned = AuthzRequest::new("t1", "user:alice", "doc:42", "read")
        .with_resource_attr("owner", serde_json::json!("user:alice"));
    assert!(engine.authorize(&owned).await.unwrap().allowed);

    let not_owned = AuthzRequest::new("t1", "user:alice", "doc:42", "read")
        .with_resource_attr("owner", serde_json::json!("user:bob"));
    assert!(!engine.authorize(&not_owned).await.unwrap().allowed);
}

// ============================================================================
// CACHE INVALIDATION (read-after-write)
// ============================================================================

#[tokio::test]
async fn test_policy_write_invalidates_cached_decision() {
    let (engine, _) = engine_with_sink();
    engine.put_policy(allow("allow-docs", "t1", "doc:*", 10)).await.unwrap();

    let request = AuthzRequest::new("t1", "user:alice", "doc:42", "read");

    // Prime the cache with an allow
    assert!(engine.authorize(&request).await.unwrap().allowed);
    assert!(engine.authorize(&request).await.unwrap().allowed);
    assert!(engine.cache_stats().hits >= 1);

    // The very next authorize after the deny write must see it
    engine.put_policy(deny("deny-42", "t1", "doc:42", 10)).await.unwrap();
    let decision = engine.authorize(&request).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.matched_policy.as_deref(), Some("deny-42"));
}

#[tokio::test]
async fn test_assignment_write_invalidates_cached_decision() {
    let (engine, _) = engine_with_sink();
    engine.put_role(Role::new("reader", "Reader", "t1")).await.unwrap();
    engine
        .put_policy(allow("readers", "t1", "doc:*", 10).with_roles(vec!["reader".to_string()]))
        .await
        .unwrap();

    let request = AuthzRequest::new("t1", "user:carol", "doc:1", "read");
    assert!(!engine.authorize(&request).await.unwrap().allowed);

    engine
        .assign_role(UserRoleAssignment::new("user:carol", "reader", "t1", "user:root"))
        .await
        .unwrap();
    assert!(engine.authorize(&request).await.unwrap().allowed);

    engine.revoke_role("t1", "user:carol", "reader").await.unwrap();
    assert!(!engine.authorize(&request).await.unwrap().allowed);
}

// ============================================================================
// SEGREGATION OF DUTY
// ============================================================================

async fn sod_engine(mode: SodMode) -> (AuthzEngine, Arc<MemoryAuditSink>) {
    let (engine, sink) = engine_with_sink();
    engine.put_role(Role::new("data_modifier", "Data Modifier", "t1")).await.unwrap();
    engine
        .put_role(Role::new("approval_officer", "Approval Officer", "t1"))
        .await
        .unwrap();
    engine.put_sod_pair(SodPair::new("t1", "data_modifier", "approval_officer"));
    engine.set_sod_mode("t1", mode);

    engine
        .assign_role(UserRoleAssignment::new("user:dan", "data_modifier", "t1", "user:root"))
        .await
        .unwrap();
    engine
        .assign_role(UserRoleAssignment::new("user:dan", "approval_officer", "t1", "user:root"))
        .await
        .unwrap();
    engine
        .put_policy(allow("approve", "t1", "payment:*", 10))
        .await
        .unwrap();

    (engine, sink)
}

#[tokio::test]
async fn test_sod_prevent_mode_blocks() {
    let (engine, sink) = sod_engine(SodMode::PreventAndAlert).await;

    let decision = engine
        .authorize(&AuthzRequest::new("t1", "user:dan", "payment:9", "read"))
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::SodViolation);
    assert_eq!(engine.metrics().sod_blocks, 1);

    engine.flush_audit().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(events[0]
        .flags
        .iter()
        .any(|f| f == "sod_conflict:data_modifier+approval_officer"));
}

#[tokio::test]
async fn test_sod_alert_mode_allows_with_flag() {
    let (engine, _) = sod_engine(SodMode::AlertOnly).await;

    let decision = engine
        .authorize(&AuthzRequest::new("t1", "user:dan", "payment:9", "read"))
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!(decision
        .obligations
        .iter()
        .any(|o| o == "sod_conflict:data_modifier+approval_officer"));
}

#[tokio::test]
async fn test_sod_does_not_fire_with_single_role() {
    let (engine, _) = sod_engine(SodMode::PreventAndAlert).await;
    engine.revoke_role("t1", "user:dan", "approval_officer").await.unwrap();

    let decision = engine
        .authorize(&AuthzRequest::new("t1", "user:dan", "payment:9", "read"))
        .await
        .unwrap();
    assert!(decision.allowed);
}

// ============================================================================
// DELEGATION
// ============================================================================

#[tokio::test]
async fn test_delegated_role_grants_access() {
    let (engine, _) = engine_with_sink();
    engine.put_role(Role::new("approver", "Approver", "t1")).await.unwrap();
    engine
        .assign_role(UserRoleAssignment::new("user:admin", "approver", "t1", "user:root"))
        .await
        .unwrap();
    engine
        .put_policy(allow("approvers", "t1", "invoice:*", 10).with_roles(vec!["approver".to_string()]))
        .await
        .unwrap();

    let request = AuthzRequest::new("t1", "user:bob", "invoice:7", "read");
    assert!(!engine.authorize(&request).await.unwrap().allowed);

    engine
        .delegate(DelegationRequest::new("t1", "user:admin", "user:bob", "approver"))
        .await
        .unwrap();
    assert!(engine.authorize(&request).await.unwrap().allowed);

    let roles = engine.effective_roles("t1", "user:bob").await.unwrap();
    assert!(roles.contains("approver"));
}

#[tokio::test]
async fn test_redelegation_past_depth_limit_rejected() {
    let (engine, _) = engine_with_sink();
    engine.put_role(Role::new("approver", "Approver", "t1")).await.unwrap();
    engine
        .assign_role(UserRoleAssignment::new("user:a", "approver", "t1", "user:root"))
        .await
        .unwrap();

    engine
        .delegate(
            DelegationRequest::new("t1", "user:a", "user:b", "approver").with_max_depth(1),
        )
        .await
        .unwrap();

    // B holds the role only via delegation; the chain limit of 1 blocks B -> C
    let result = engine
        .delegate(DelegationRequest::new("t1", "user:b", "user:c", "approver"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_revoked_delegation_stops_access() {
    let (engine, _) = engine_with_sink();
    engine.put_role(Role::new("approver", "Approver", "t1")).await.unwrap();
    engine
        .assign_role(UserRoleAssignment::new("user:a", "approver", "t1", "user:root"))
        .await
        .unwrap();
    engine
        .put_policy(allow("approvers", "t1", "invoice:*", 10).with_roles(vec!["approver".to_string()]))
        .await
        .unwrap();

    let grant = engine
        .delegate(DelegationRequest::new("t1", "user:a", "user:b", "approver"))
        .await
        .unwrap();

    let request = AuthzRequest::new("t1", "user:b", "invoice:7", "read");
    assert!(engine.authorize(&request).await.unwrap().allowed);

    engine.revoke_delegation("t1", &grant.id).unwrap();
    assert!(!engine.authorize(&request).await.unwrap().allowed);
}

// ============================================================================
// CYCLE TOLERANCE AND EXPIRY
// ============================================================================

#[tokio::test]
async fn test_role_cycle_rejected_at_write_but_resolution_never_hangs() {
    let (engine, _) = engine_with_sink();
    engine.put_role(Role::new("a", "A", "t1")).await.unwrap();
    engine.put_role(Role::new("b", "B", "t1").with_parent("a")).await.unwrap();

    // a -> b would close a cycle with b -> a
    let result = engine.put_role(Role::new("a", "A", "t1").with_parent("b")).await;
    assert!(result.is_err());

    // Resolution over the valid hierarchy terminates with each role once
    engine
        .assign_role(UserRoleAssignment::new("user:x", "b", "t1", "user:root"))
        .await
        .unwrap();
    let roles = engine.effective_roles("t1", "user:x").await.unwrap();
    assert_eq!(roles.len(), 2);
}

#[tokio::test]
async fn test_expired_assignment_loses_access() {
    let (engine, _) = engine_with_sink();
    engine.put_role(Role::new("reader", "Reader", "t1")).await.unwrap();
    engine
        .put_policy(allow("readers", "t1", "doc:*", 10).with_roles(vec!["reader".to_string()]))
        .await
        .unwrap();
    engine
        .assign_role(
            UserRoleAssignment::new("user:eve", "reader", "t1", "user:root")
                .expiring(Utc::now() - chrono::Duration::minutes(1)),
        )
        .await
        .unwrap();

    let decision = engine
        .authorize(&AuthzRequest::new("t1", "user:eve", "doc:1", "read"))
        .await
        .unwrap();
    assert!(!decision.allowed);
}

// ============================================================================
// AUDIT
// ============================================================================

#[tokio::test]
async fn test_every_decision_is_audited() {
    let (engine, sink) = engine_with_sink();
    engine.put_policy(allow("p1", "t1", "doc:*", 10)).await.unwrap();

    engine
        .authorize(&AuthzRequest::new("t1", "user:alice", "doc:1", "read"))
        .await
        .unwrap();
    engine
        .authorize(&AuthzRequest::new("t1", "user:alice", "file:1", "read"))
        .await
        .unwrap();

    engine.flush_audit().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert!(events[0].allowed);
    assert_eq!(events[0].matched_policy.as_deref(), Some("p1"));
    assert!(!events[1].allowed);
    assert_eq!(events[1].reason, DecisionReason::DefaultDeny);
}

#[tokio::test]
async fn test_administrative_role_is_flagged_in_audit() {
    let (engine, sink) = engine_with_sink();
    engine
        .put_role(Role::new("tenant_admin", "Tenant Admin", "t1").administrative())
        .await
        .unwrap();
    engine
        .assign_role(UserRoleAssignment::new("user:alice", "tenant_admin", "t1", "user:root"))
        .await
        .unwrap();
    engine.put_policy(allow("p1", "t1", "doc:*", 10)).await.unwrap();

    let decision = engine
        .authorize(&AuthzRequest::new("t1", "user:alice", "doc:1", "read"))
        .await
        .unwrap();
    assert!(decision.allowed);

    engine.flush_audit().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let events = sink.events();
    assert!(events[0]
        .flags
        .iter()
        .any(|f| f == "administrative_role:tenant_admin"));
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_authorize_across_tenants() {
    init_tracing();
    let sink = Arc::new(MemoryAuditSink::new());
    let engine = Arc::new(AuthzEngine::new(
        EngineConfig::default(),
        Arc::new(InMemoryRoleStore::new()),
        Arc::new(InMemoryPolicyStore::new()),
        sink,
    ));

    for tenant in 0..10 {
        engine
            .put_policy(allow("p1", &format!("t{}", tenant), "doc:*", 10))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..500 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let tenant = format!("t{}", i % 10);
            let request =
                AuthzRequest::new(tenant, format!("user:{}", i % 50), format!("doc:{}", i % 20), "read");
            engine.authorize(&request).await.unwrap()
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().allowed);
    }
    assert_eq!(engine.metrics().decisions + engine.metrics().cache_hits, 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_storm_on_one_tenant_does_not_corrupt_another() {
    init_tracing();
    let engine = Arc::new(AuthzEngine::in_memory(EngineConfig::default()));
    engine.put_policy(allow("stable", "t2", "doc:*", 10)).await.unwrap();

    // Tenant t1 takes a policy write storm while t2 reads concurrently
    let writer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for i in 0..200 {
                engine
                    .put_policy(allow(&format!("p{}", i), "t1", "doc:*", i))
                    .await
                    .unwrap();
            }
        })
    };

    let reader = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for i in 0..200 {
                let decision = engine
                    .authorize(&AuthzRequest::new("t2", "user:r", format!("doc:{}", i % 5), "read"))
                    .await
                    .unwrap();
                assert!(decision.allowed, "t2 reads must be unaffected by t1 writes");
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
}
