//! Role model, role store, and effective-role resolution
//!
//! Roles form a single-parent hierarchy per tenant, with separate implication
//! edges that grant another role's permissions without structural parenthood.
//! Writes reject cycles over the combined graph; resolution tolerates them
//! (visited-set BFS) and surfaces the offending edge as a data-quality flag.

use crate::error::{AuthzError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::types::{RoleId, TenantId, UserId};

/// Role definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Unique role identifier within the tenant
    pub id: RoleId,

    /// Human-readable name
    pub name: String,

    /// Parent role in the hierarchy (single-parent tree)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<RoleId>,

    /// Owning tenant
    pub tenant_id: TenantId,

    /// Administrative roles are resolved normally but double-checked by the
    /// SoD validator
    #[serde(default)]
    pub is_administrative: bool,
}

impl Role {
    pub fn new(id: impl Into<RoleId>, name: impl Into<String>, tenant_id: impl Into<TenantId>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent: None,
            tenant_id: tenant_id.into(),
            is_administrative: false,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<RoleId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn administrative(mut self) -> Self {
        self.is_administrative = true;
        self
    }
}

/// Implication edge: holding `role_id` also grants `implies`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleImplication {
    pub role_id: RoleId,
    pub implies: RoleId,
}

/// Assignment of a role to a user within a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRoleAssignment {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub tenant_id: TenantId,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,

    /// Expired assignments are excluded from resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Cross-tenant assignments are rejected unless this federation flag is set
    #[serde(default)]
    pub federated: bool,
}

impl UserRoleAssignment {
    pub fn new(
        user_id: impl Into<UserId>,
        role_id: impl Into<RoleId>,
        tenant_id: impl Into<TenantId>,
        granted_by: impl Into<UserId>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            role_id: role_id.into(),
            tenant_id: tenant_id.into(),
            granted_by: granted_by.into(),
            granted_at: Utc::now(),
            expires_at: None,
            federated: false,
        }
    }

    pub fn expiring(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn federated(mut self) -> Self {
        self.federated = true;
        self
    }

    fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Role store boundary
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn get_role(&self, tenant_id: &str, role_id: &str) -> Result<Option<Role>>;

    /// Insert or update a role; rejects a parent link that would close a
    /// cycle over the combined hierarchy + implication graph
    async fn put_role(&self, role: Role) -> Result<()>;

    /// Delete a role; refused while any assignment references it
    async fn delete_role(&self, tenant_id: &str, role_id: &str) -> Result<()>;

    /// Add an implication edge; rejects cycles over the combined graph
    async fn put_implication(&self, tenant_id: &str, implication: RoleImplication) -> Result<()>;

    /// Record an assignment; tenant-scoped unless federated
    async fn assign(&self, assignment: UserRoleAssignment) -> Result<()>;

    async fn revoke(&self, tenant_id: &str, user_id: &str, role_id: &str) -> Result<()>;

    /// Non-expired directly assigned roles for a user
    async fn direct_roles(&self, tenant_id: &str, user_id: &str, now: DateTime<Utc>)
        -> Result<Vec<RoleId>>;

    /// Snapshot of expansion edges (parent + implication) for a tenant
    async fn expansion_edges(&self, tenant_id: &str) -> Result<HashMap<RoleId, Vec<RoleId>>>;

    /// Whether any assignment references the role
    async fn role_is_assigned(&self, tenant_id: &str, role_id: &str) -> Result<bool>;

    /// Administrative role ids for a tenant
    async fn administrative_roles(&self, tenant_id: &str) -> Result<HashSet<RoleId>>;
}

#[derive(Default)]
struct TenantRoles {
    roles: HashMap<RoleId, Role>,
    implications: Vec<RoleImplication>,
    assignments: Vec<UserRoleAssignment>,
}

impl TenantRoles {
    fn edges(&self) -> HashMap<RoleId, Vec<RoleId>> {
        let mut edges: HashMap<RoleId, Vec<RoleId>> = HashMap::new();
        for role in self.roles.values() {
            let entry = edges.entry(role.id.clone()).or_default();
            if let Some(parent) = &role.parent {
                entry.push(parent.clone());
            }
        }
        for implication in &self.implications {
            edges
                .entry(implication.role_id.clone())
                .or_default()
                .push(implication.implies.clone());
        }
        edges
    }
}

/// In-memory role store, sharded by tenant so one tenant's writes never
/// contend with another tenant's reads
pub struct InMemoryRoleStore {
    tenants: DashMap<TenantId, TenantRoles>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }
}

impl Default for InMemoryRoleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn get_role(&self, tenant_id: &str, role_id: &str) -> Result<Option<Role>> {
        Ok(self
            .tenants
            .get(tenant_id)
            .and_then(|t| t.roles.get(role_id).cloned()))
    }

    async fn put_role(&self, role: Role) -> Result<()> {
        if role.id.is_empty() {
            return Err(AuthzError::InvalidInput("role id cannot be empty".to_string()));
        }
        if role.parent.as_deref() == Some(role.id.as_str()) {
            return Err(AuthzError::CycleDetected(format!(
                "role '{}' cannot be its own parent",
                role.id
            )));
        }

        let mut tenant = self.tenants.entry(role.tenant_id.clone()).or_default();

        // Reject a parent edge that would close a cycle
        let mut edges = tenant.edges();
        edges.remove(&role.id);
        let entry = edges.entry(role.id.clone()).or_default();
        if let Some(parent) = &role.parent {
            entry.push(parent.clone());
        }
        for implication in &tenant.implications {
            if implication.role_id == role.id {
                edges
                    .entry(role.id.clone())
                    .or_default()
                    .push(implication.implies.clone());
            }
        }
        if let Some(cycle) = detect_cycle(&edges) {
            return Err(AuthzError::CycleDetected(cycle.join(" -> ")));
        }

        tenant.roles.insert(role.id.clone(), role);
        Ok(())
    }

    async fn delete_role(&self, tenant_id: &str, role_id: &str) -> Result<()> {
        let mut tenant = self
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| AuthzError::RoleNotFound(role_id.to_string()))?;

        if !tenant.roles.contains_key(role_id) {
            return Err(AuthzError::RoleNotFound(role_id.to_string()));
        }
        if tenant.assignments.iter().any(|a| a.role_id == role_id) {
            return Err(AuthzError::InUse(format!(
                "role '{}' still has user assignments",
                role_id
            )));
        }
        if tenant
            .roles
            .values()
            .any(|r| r.parent.as_deref() == Some(role_id))
        {
            return Err(AuthzError::InUse(format!(
                "role '{}' is a parent of other roles",
                role_id
            )));
        }

        tenant.roles.remove(role_id);
        tenant
            .implications
            .retain(|i| i.role_id != role_id && i.implies != role_id);
        Ok(())
    }

    async fn put_implication(&self, tenant_id: &str, implication: RoleImplication) -> Result<()> {
        if implication.role_id == implication.implies {
            return Err(AuthzError::CycleDetected(format!(
                "role '{}' cannot imply itself",
                implication.role_id
            )));
        }

        let mut tenant = self.tenants.entry(tenant_id.to_string()).or_default();

        let mut edges = tenant.edges();
        edges
            .entry(implication.role_id.clone())
            .or_default()
            .push(implication.implies.clone());
        if let Some(cycle) = detect_cycle(&edges) {
            return Err(AuthzError::CycleDetected(cycle.join(" -> ")));
        }

        if !tenant.implications.contains(&implication) {
            tenant.implications.push(implication);
        }
        Ok(())
    }

    async fn assign(&self, assignment: UserRoleAssignment) -> Result<()> {
        let mut tenant = self.tenants.entry(assignment.tenant_id.clone()).or_default();

        // A role is tenant-scoped; assignment must target a role of this
        // tenant unless explicitly federated
        if !tenant.roles.contains_key(&assignment.role_id) && !assignment.federated {
            return Err(AuthzError::InvalidInput(format!(
                "role '{}' does not exist in tenant '{}' (cross-tenant assignment requires the federation flag)",
                assignment.role_id, assignment.tenant_id
            )));
        }

        tenant
            .assignments
            .retain(|a| !(a.user_id == assignment.user_id && a.role_id == assignment.role_id));
        tenant.assignments.push(assignment);
        Ok(())
    }

    async fn revoke(&self, tenant_id: &str, user_id: &str, role_id: &str) -> Result<()> {
        if let Some(mut tenant) = self.tenants.get_mut(tenant_id) {
            tenant
                .assignments
                .retain(|a| !(a.user_id == user_id && a.role_id == role_id));
        }
        Ok(())
    }

    async fn direct_roles(
        &self,
        tenant_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleId>> {
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|tenant| {
                tenant
                    .assignments
                    .iter()
                    .filter(|a| a.user_id == user_id && a.is_active(now))
                    .map(|a| a.role_id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn expansion_edges(&self, tenant_id: &str) -> Result<HashMap<RoleId, Vec<RoleId>>> {
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|tenant| tenant.edges())
            .unwrap_or_default())
    }

    async fn role_is_assigned(&self, tenant_id: &str, role_id: &str) -> Result<bool> {
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|tenant| tenant.assignments.iter().any(|a| a.role_id == role_id))
            .unwrap_or(false))
    }

    async fn administrative_roles(&self, tenant_id: &str) -> Result<HashSet<RoleId>> {
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|tenant| {
                tenant
                    .roles
                    .values()
                    .filter(|r| r.is_administrative)
                    .map(|r| r.id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Detect a cycle in an adjacency map; returns the cycle path if found.
/// Iterative three-color DFS, no recursion.
pub(crate) fn detect_cycle(edges: &HashMap<RoleId, Vec<RoleId>>) -> Option<Vec<RoleId>> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let mut state: HashMap<&str, u8> = HashMap::new();

    for start in edges.keys() {
        if *state.get(start.as_str()).unwrap_or(&WHITE) != WHITE {
            continue;
        }

        // Stack of (node, next-edge-index); path mirrors the gray chain
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        let mut path: Vec<&str> = vec![start.as_str()];
        state.insert(start.as_str(), GRAY);

        while let Some((node, edge_idx)) = stack.last_mut() {
            let next = edges
                .get(*node)
                .and_then(|targets| targets.get(*edge_idx))
                .map(|t| t.as_str());
            *edge_idx += 1;

            match next {
                Some(target) => match *state.get(target).unwrap_or(&WHITE) {
                    GRAY => {
                        let cycle_start = path.iter().position(|n| *n == target).unwrap_or(0);
                        let mut cycle: Vec<RoleId> =
                            path[cycle_start..].iter().map(|n| n.to_string()).collect();
                        cycle.push(target.to_string());
                        return Some(cycle);
                    }
                    WHITE => {
                        state.insert(target, GRAY);
                        stack.push((target, 0));
                        path.push(target);
                    }
                    _ => {}
                },
                None => {
                    state.insert(*node, BLACK);
                    stack.pop();
                    path.pop();
                }
            }
        }
    }

    None
}

/// Result of resolving a subject's effective roles
#[derive(Debug, Clone, Default)]
pub struct EffectiveRoles {
    /// Full effective role set after hierarchy + implication expansion
    pub roles: HashSet<RoleId>,

    /// Data-quality flags surfaced during resolution (e.g. cycle edges)
    pub flags: Vec<String>,
}

/// Expands direct assignments into the full effective role set
///
/// Breadth-first over parent and implication edges with a visited set, so a
/// cycle in stored data can never hang resolution: a revisited node is a
/// no-op for that edge, and an edge that genuinely closes a cycle is surfaced
/// as a flag for the audit trail.
pub struct RoleResolver {
    store: Arc<dyn RoleStore>,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self { store }
    }

    /// Resolve a user's effective roles at `now`
    ///
    /// `extra_direct` carries roles granted through delegation; `deadline`
    /// bounds the traversal so a caller cancellation stops work promptly.
    pub async fn resolve(
        &self,
        tenant_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
        extra_direct: &[RoleId],
        deadline: Instant,
    ) -> Result<EffectiveRoles> {
        let mut direct = self.store.direct_roles(tenant_id, user_id, now).await?;
        direct.extend(extra_direct.iter().cloned());

        if Instant::now() >= deadline {
            return Err(AuthzError::DeadlineExceeded);
        }

        let edges = self.store.expansion_edges(tenant_id).await?;

        let mut result = EffectiveRoles::default();
        let mut queue: VecDeque<RoleId> = VecDeque::new();

        for role in direct {
            if result.roles.insert(role.clone()) {
                queue.push_back(role);
            }
        }

        while let Some(current) = queue.pop_front() {
            if Instant::now() >= deadline {
                return Err(AuthzError::DeadlineExceeded);
            }

            let Some(targets) = edges.get(&current) else {
                continue;
            };

            for target in targets {
                if result.roles.insert(target.clone()) {
                    queue.push_back(target.clone());
                } else if closes_cycle(&edges, target, &current) {
                    warn!(
                        tenant = tenant_id,
                        from = %current,
                        to = %target,
                        "role graph cycle tolerated during resolution"
                    );
                    result.flags.push(format!("role_cycle:{}->{}", current, target));
                }
            }
        }

        debug!(
            tenant = tenant_id,
            user = user_id,
            count = result.roles.len(),
            "resolved effective roles"
        );
        Ok(result)
    }
}

/// An edge u->v closes a cycle iff u is reachable from v. Only called on
/// revisited nodes, with its own visited set so it always terminates.
fn closes_cycle(edges: &HashMap<RoleId, Vec<RoleId>>, from: &str, target: &str) -> bool {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(from);
    visited.insert(from);

    while let Some(node) = queue.pop_front() {
        if node == target {
            return true;
        }
        if let Some(targets) = edges.get(node) {
            for next in targets {
                if visited.insert(next.as_str()) {
                    queue.push_back(next.as_str());
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    async fn store_with_hierarchy() -> InMemoryRoleStore {
        let store = InMemoryRoleStore::new();
        store
            .put_role(Role::new("employee", "Employee", "t1"))
            .await
            .unwrap();
        store
            .put_role(Role::new("manager", "Manager", "t1").with_parent("employee"))
            .await
            .unwrap();
        store
            .put_role(Role::new("director", "Director", "t1").with_parent("manager"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_hierarchy_expansion() {
        let store = Arc::new(store_with_hierarchy().await);
        store
            .assign(UserRoleAssignment::new("user:alice", "director", "t1", "user:root"))
            .await
            .unwrap();

        let resolver = RoleResolver::new(store);
        let effective = resolver
            .resolve("t1", "user:alice", Utc::now(), &[], far_deadline())
            .await
            .unwrap();

        assert!(effective.roles.contains("director"));
        assert!(effective.roles.contains("manager"));
        assert!(effective.roles.contains("employee"));
        assert!(effective.flags.is_empty());
    }

    #[tokio::test]
    async fn test_implication_expansion() {
        let store = Arc::new(store_with_hierarchy().await);
        store
            .put_role(Role::new("auditor", "Auditor", "t1"))
            .await
            .unwrap();
        store
            .put_implication(
                "t1",
                RoleImplication {
                    role_id: "manager".to_string(),
                    implies: "auditor".to_string(),
                },
            )
            .await
            .unwrap();
        store
            .assign(UserRoleAssignment::new("user:bob", "manager", "t1", "user:root"))
            .await
            .unwrap();

        let resolver = RoleResolver::new(store);
        let effective = resolver
            .resolve("t1", "user:bob", Utc::now(), &[], far_deadline())
            .await
            .unwrap();

        assert!(effective.roles.contains("auditor"));
        assert!(effective.roles.contains("employee"));
    }

    #[tokio::test]
    async fn test_expired_assignment_excluded() {
        let store = Arc::new(store_with_hierarchy().await);
        store
            .assign(
                UserRoleAssignment::new("user:carol", "manager", "t1", "user:root")
                    .expiring(Utc::now() - chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        let resolver = RoleResolver::new(store);
        let effective = resolver
            .resolve("t1", "user:carol", Utc::now(), &[], far_deadline())
            .await
            .unwrap();

        assert!(effective.roles.is_empty());
    }

    #[tokio::test]
    async fn test_write_time_cycle_rejected() {
        let store = store_with_hierarchy().await;

        // employee -> director parent edge would close the chain
        let result = store
            .put_role(Role::new("employee", "Employee", "t1").with_parent("director"))
            .await;
        assert!(matches!(result, Err(AuthzError::CycleDetected(_))));

        // implication cycle combined with hierarchy
        let result = store
            .put_implication(
                "t1",
                RoleImplication {
                    role_id: "employee".to_string(),
                    implies: "director".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(AuthzError::CycleDetected(_))));
    }

    #[tokio::test]
    async fn test_injected_cycle_terminates_and_flags() {
        // Bypass write validation by seeding implications that only form a
        // cycle when combined, then force the bad edge directly
        let store = InMemoryRoleStore::new();
        store.put_role(Role::new("a", "A", "t1")).await.unwrap();
        store.put_role(Role::new("b", "B", "t1")).await.unwrap();
        store
            .put_implication(
                "t1",
                RoleImplication {
                    role_id: "a".to_string(),
                    implies: "b".to_string(),
                },
            )
            .await
            .unwrap();
        // Inject a->b->a by editing the tenant shard as corrupt data would
        store
            .tenants
            .get_mut("t1")
            .unwrap()
            .implications
            .push(RoleImplication {
                role_id: "b".to_string(),
                implies: "a".to_string(),
            });

        store
            .assign(UserRoleAssignment::new("user:dave", "a", "t1", "user:root"))
            .await
            .unwrap();

        let resolver = RoleResolver::new(Arc::new(store));
        let effective = resolver
            .resolve("t1", "user:dave", Utc::now(), &[], far_deadline())
            .await
            .unwrap();

        // Terminates, includes each role once, and surfaces the cycle
        assert_eq!(effective.roles.len(), 2);
        assert!(effective.flags.iter().any(|f| f.starts_with("role_cycle:")));
    }

    #[tokio::test]
    async fn test_diamond_is_not_flagged_as_cycle() {
        let store = InMemoryRoleStore::new();
        store.put_role(Role::new("base", "Base", "t1")).await.unwrap();
        store
            .put_role(Role::new("left", "Left", "t1").with_parent("base"))
            .await
            .unwrap();
        store
            .put_role(Role::new("right", "Right", "t1").with_parent("base"))
            .await
            .unwrap();
        store.put_role(Role::new("top", "Top", "t1").with_parent("left")).await.unwrap();
        store
            .put_implication(
                "t1",
                RoleImplication {
                    role_id: "top".to_string(),
                    implies: "right".to_string(),
                },
            )
            .await
            .unwrap();

        store
            .assign(UserRoleAssignment::new("user:erin", "top", "t1", "user:root"))
            .await
            .unwrap();

        let resolver = RoleResolver::new(Arc::new(store));
        let effective = resolver
            .resolve("t1", "user:erin", Utc::now(), &[], far_deadline())
            .await
            .unwrap();

        assert_eq!(effective.roles.len(), 4);
        assert!(effective.flags.is_empty(), "diamond reconvergence is not a cycle");
    }

    #[tokio::test]
    async fn test_cross_tenant_assignment_requires_federation() {
        let store = store_with_hierarchy().await;

        let result = store
            .assign(UserRoleAssignment::new("user:eve", "other-tenant-role", "t1", "user:root"))
            .await;
        assert!(result.is_err());

        store
            .assign(
                UserRoleAssignment::new("user:eve", "other-tenant-role", "t1", "user:root")
                    .federated(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_role_refused_while_assigned() {
        let store = store_with_hierarchy().await;
        store
            .assign(UserRoleAssignment::new("user:frank", "director", "t1", "user:root"))
            .await
            .unwrap();

        assert!(matches!(
            store.delete_role("t1", "director").await,
            Err(AuthzError::InUse(_))
        ));
        assert!(matches!(
            store.delete_role("t1", "employee").await,
            Err(AuthzError::InUse(_))
        ));

        store.revoke("t1", "user:frank", "director").await.unwrap();
        store.delete_role("t1", "director").await.unwrap();
    }

    #[test]
    fn test_detect_cycle_helper() {
        let mut edges: HashMap<RoleId, Vec<RoleId>> = HashMap::new();
        edges.insert("a".to_string(), vec!["b".to_string()]);
        edges.insert("b".to_string(), vec!["c".to_string()]);
        assert!(detect_cycle(&edges).is_none());

        edges.insert("c".to_string(), vec!["a".to_string()]);
        let cycle = detect_cycle(&edges).unwrap();
        assert!(cycle.len() >= 3);
    }
}
