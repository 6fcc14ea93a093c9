//! # tenant-authz
//!
//! Multi-tenant authorization decision engine combining RBAC role
//! resolution, ABAC policy evaluation, and segregation-of-duty validation
//! behind a single `authorize` entry point.
//!
//! ## Features
//!
//! - **Hierarchical role resolution** with implication edges, cycle-tolerant
//!   breadth-first expansion, and write-time cycle rejection
//! - **Policy evaluation** over canonical segment patterns with typed,
//!   side-effect-free attribute conditions
//! - **Deterministic conflict resolution**: priority first, deny over allow
//!   at equal priority, default-deny when nothing applies
//! - **O(1) tenant-wide cache invalidation** via per-tenant generation
//!   counters, with per-tenant LRU bounds for fairness
//! - **Bounded delegation chains** and SoD conflict checking
//! - **Fire-and-forget audit** through a bounded drop-oldest queue
//!
//! ## Example
//!
//! ```rust
//! use tenant_authz::{AuthzEngine, AuthzRequest, EngineConfig, Policy, PolicyEffect};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthzEngine::in_memory(EngineConfig::default());
//!
//!     engine
//!         .put_policy(Policy::new("p1", "tenant-1", PolicyEffect::Allow, "doc:*", "read")?)
//!         .await?;
//!
//!     let request = AuthzRequest::new("tenant-1", "user:alice", "doc:42", "read");
//!     let decision = engine.authorize(&request).await?;
//!
//!     assert!(decision.allowed);
//!     Ok(())
//! }
//! ```

pub mod condition;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod pattern;
pub mod policy;
pub mod role;
pub mod sod;
pub mod types;

// Re-export commonly used types
pub use condition::{AttrRef, CompareOp, ConditionExpr, EvalContext};
pub use delegation::{DelegationGrant, DelegationRequest, DelegationStore};
pub use engine::{
    AuditEvent, AuditSink, AuthzEngine, CacheConfig, EngineConfig, EngineMetrics, MemoryAuditSink,
};
pub use error::{AuthzError, Result};
pub use pattern::SegmentPattern;
pub use policy::{InMemoryPolicyStore, Policy, PolicyEffect, PolicyStore};
pub use role::{
    InMemoryRoleStore, Role, RoleImplication, RoleResolver, RoleStore, UserRoleAssignment,
};
pub use sod::{SodConflict, SodMode, SodPair, SodValidator};
pub use types::{AuthzRequest, Decision, DecisionReason, PolicyId, RoleId, TenantId, UserId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
