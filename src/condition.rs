//! Typed condition expressions for ABAC policies
//!
//! Conditions are a small tagged expression tree over a fixed attribute
//! schema (`subject.*`, `resource.*`, `context.*`), validated at policy-write
//! time. Evaluation is total and side-effect-free: a missing attribute or a
//! type mismatch makes the predicate false, never an error.

use crate::error::{AuthzError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Maximum nesting depth for combinators; deeper trees are rejected at write
const MAX_DEPTH: usize = 32;

/// Reference to an attribute, rooted at one of the three schema namespaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrRef {
    /// Subject attribute (e.g. department, clearance)
    Subject(String),

    /// Resource attribute (e.g. owner, sensitivity)
    Resource(String),

    /// Request context attribute (e.g. hour_of_day, device_trust, risk_score)
    Context(String),
}

impl AttrRef {
    /// Parse a dotted path like "subject.department"
    pub fn parse(path: &str) -> Result<Self> {
        match path.split_once('.') {
            Some(("subject", key)) if !key.is_empty() => Ok(Self::Subject(key.to_string())),
            Some(("resource", key)) if !key.is_empty() => Ok(Self::Resource(key.to_string())),
            Some(("context", key)) if !key.is_empty() => Ok(Self::Context(key.to_string())),
            _ => Err(AuthzError::InvalidPolicy(format!(
                "attribute path '{}' must start with subject., resource., or context.",
                path
            ))),
        }
    }
}

/// Comparison operators over attribute values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Attribute value is a member of the literal array
    In,
    /// Attribute array or string contains the literal
    Contains,
}

/// Condition expression tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConditionExpr {
    /// Compare an attribute against a literal value
    Compare {
        attr: AttrRef,
        cmp: CompareOp,
        value: Value,
    },

    /// All sub-expressions must hold
    All { exprs: Vec<ConditionExpr> },

    /// At least one sub-expression must hold
    AnyOf { exprs: Vec<ConditionExpr> },

    /// Negation
    Not { expr: Box<ConditionExpr> },

    /// Attribute is present, whatever its value
    HasAttribute { attr: AttrRef },
}

impl ConditionExpr {
    /// Convenience constructor for a comparison leaf
    pub fn compare(path: &str, cmp: CompareOp, value: Value) -> Result<Self> {
        Ok(Self::Compare {
            attr: AttrRef::parse(path)?,
            cmp,
            value,
        })
    }

    /// Validate the expression at write time: combinators must be non-empty
    /// and nesting bounded, so evaluation is always cheap and terminates.
    pub fn validate(&self) -> Result<()> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(AuthzError::InvalidPolicy(format!(
                "condition nesting exceeds {} levels",
                MAX_DEPTH
            )));
        }

        match self {
            Self::Compare { cmp, value, .. } => match cmp {
                CompareOp::In => {
                    if !value.is_array() {
                        return Err(AuthzError::InvalidPolicy(
                            "'in' comparison requires an array literal".to_string(),
                        ));
                    }
                    Ok(())
                }
                CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                    if !value.is_number() && !value.is_string() {
                        return Err(AuthzError::InvalidPolicy(
                            "ordered comparison requires a number or string literal".to_string(),
                        ));
                    }
                    Ok(())
                }
                _ => Ok(()),
            },
            Self::All { exprs } | Self::AnyOf { exprs } => {
                if exprs.is_empty() {
                    return Err(AuthzError::InvalidPolicy(
                        "combinator requires at least one sub-expression".to_string(),
                    ));
                }
                for expr in exprs {
                    expr.validate_at(depth + 1)?;
                }
                Ok(())
            }
            Self::Not { expr } => expr.validate_at(depth + 1),
            Self::HasAttribute { .. } => Ok(()),
        }
    }

    /// Evaluate against a context. Total: unknown attributes and type
    /// mismatches yield false.
    pub fn evaluate(&self, ctx: &EvalContext) -> bool {
        match self {
            Self::Compare { attr, cmp, value } => match ctx.lookup(attr) {
                Some(actual) => compare(actual, *cmp, value),
                None => false,
            },
            Self::All { exprs } => exprs.iter().all(|e| e.evaluate(ctx)),
            Self::AnyOf { exprs } => exprs.iter().any(|e| e.evaluate(ctx)),
            Self::Not { expr } => !expr.evaluate(ctx),
            Self::HasAttribute { attr } => ctx.lookup(attr).is_some(),
        }
    }
}

fn compare(actual: &Value, cmp: CompareOp, literal: &Value) -> bool {
    match cmp {
        CompareOp::Eq => actual == literal,
        CompareOp::Ne => actual != literal,
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            ordered_compare(actual, literal).map_or(false, |ordering| match cmp {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
        CompareOp::In => literal
            .as_array()
            .map_or(false, |items| items.contains(actual)),
        CompareOp::Contains => match actual {
            Value::Array(items) => items.contains(literal),
            Value::String(s) => literal.as_str().map_or(false, |sub| s.contains(sub)),
            _ => false,
        },
    }
}

fn ordered_compare(actual: &Value, literal: &Value) -> Option<std::cmp::Ordering> {
    match (actual, literal) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Attribute lookup context assembled by the evaluator for one request
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    subject: HashMap<String, Value>,
    resource: HashMap<String, Value>,
    context: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subject(mut self, attrs: HashMap<String, Value>) -> Self {
        self.subject = attrs;
        self
    }

    pub fn with_resource(mut self, attrs: HashMap<String, Value>) -> Self {
        self.resource = attrs;
        self
    }

    pub fn with_context(mut self, attrs: HashMap<String, Value>) -> Self {
        self.context = attrs;
        self
    }

    fn lookup(&self, attr: &AttrRef) -> Option<&Value> {
        match attr {
            AttrRef::Subject(key) => self.subject.get(key),
            AttrRef::Resource(key) => self.resource.get(key),
            AttrRef::Context(key) => self.context.get(key),
        }
    }
}
