//! Error types for the authorization engine

use thiserror::Error;

/// Authorization engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Malformed policy, pattern, or condition rejected at write time
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Policy not found
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    /// Role not found
    #[error("Role not found: {0}")]
    RoleNotFound(String),

    /// A write would introduce a cycle in the role hierarchy or implication graph
    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    /// A write references an entity still in use (e.g. deleting a bound role)
    #[error("Entity in use: {0}")]
    InUse(String),

    /// Delegation rejected (depth exceeded, cycle, or delegator lacks the role)
    #[error("Invalid delegation: {0}")]
    InvalidDelegation(String),

    /// Request deadline exceeded during evaluation
    #[error("Evaluation deadline exceeded")]
    DeadlineExceeded,

    /// Underlying store unavailable
    #[error("Store error: {0}")]
    StoreError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
