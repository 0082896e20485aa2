//! Custom per-profile risk rules.
//!
//! Rules are data: a condition tree over named numeric fields and a single
//! action. They are interpreted, never executed, so a profile can be loaded
//! from JSON without opening an injection surface.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => (lhs - rhs).abs() < 1e-9,
            CmpOp::Ne => (lhs - rhs).abs() >= 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Compare { field: String, op: CmpOp, value: f64 },
    /// Shorthand for `field > limit`
    Threshold { field: String, limit: f64 },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Warn { message: String },
    Recommend { message: String },
    /// Clamp the recommended stake to at most `amount`
    CapStake { amount: f64 },
    /// Force the recommended stake to zero and raise a violation
    Block { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: Condition,
    pub action: RuleAction,
}

fn default_enabled() -> bool {
    true
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("field '{0}' is not a finite number")]
    NotFinite(String),
    #[error("empty '{0}' group")]
    EmptyGroup(&'static str),
}

/// Named values a condition can refer to.
#[derive(Debug, Clone, Default)]
pub struct RuleScope {
    values: BTreeMap<&'static str, f64>,
}

impl RuleScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: &'static str, value: f64) -> &mut Self {
        self.values.insert(field, value);
        self
    }

    fn get(&self, field: &str) -> Result<f64, ConditionError> {
        let v = self
            .values
            .get(field)
            .copied()
            .ok_or_else(|| ConditionError::UnknownField(field.to_string()))?;
        if v.is_finite() {
            Ok(v)
        } else {
            Err(ConditionError::NotFinite(field.to_string()))
        }
    }
}

pub fn evaluate(condition: &Condition, scope: &RuleScope) -> Result<bool, ConditionError> {
    match condition {
        Condition::Compare { field, op, value } => Ok(op.apply(scope.get(field)?, *value)),
        Condition::Threshold { field, limit } => Ok(scope.get(field)? > *limit),
        Condition::All { conditions } => {
            if conditions.is_empty() {
                return Err(ConditionError::EmptyGroup("all"));
            }
            for c in conditions {
                if !evaluate(c, scope)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Any { conditions } => {
            if conditions.is_empty() {
                return Err(ConditionError::EmptyGroup("any"));
            }
            for c in conditions {
                if evaluate(c, scope)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Not { condition } => Ok(!evaluate(condition, scope)?),
    }
}
