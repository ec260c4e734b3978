//! Named operator registry.
//!
//! The high-level table API registers each exposed operator once at startup,
//! either programmatically or from a serialized config, and looks it up per
//! user operation.

use crate::align::JoinPolicy;
use crate::binary::{BinaryOperator, DtypePolicy, FragmentFn, FragmentOperand, LabelPolicy};
use gridframe_core::error::{FrameError, Result};
use gridframe_core::local::{self, ArithOp, CmpOp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Declarative description of one operator, deserializable from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorSpec {
    /// Kernel name: `add`, `sub`, `mul`, `div`, `rem`, `eq`, `ne`, `lt`,
    /// `le`, `gt`, `ge`.
    pub op: String,
    #[serde(default = "default_join")]
    pub join: JoinPolicy,
    #[serde(default = "default_labels")]
    pub labels: LabelPolicy,
    /// Defaults per kernel kind: `common_cast` for arithmetic, `float` for
    /// division, `bool` for comparisons.
    #[serde(default)]
    pub dtypes: Option<DtypePolicy>,
}

fn default_join() -> JoinPolicy {
    JoinPolicy::Outer
}

fn default_labels() -> LabelPolicy {
    LabelPolicy::Replace
}

/// Wire an arithmetic kernel into a fragment function handling all operand
/// kinds.
pub fn arith_fn(op: ArithOp) -> FragmentFn {
    Arc::new(move |left, operand| match operand {
        FragmentOperand::Fragment(right) => local::arith_batches(op, left, right),
        FragmentOperand::Values { values, axis } => {
            local::arith_with_values(op, left, values, *axis)
        }
        FragmentOperand::Scalar(value) => local::arith_with_scalar(op, left, value),
    })
}

/// Wire a comparison kernel into a fragment function handling all operand
/// kinds.
pub fn cmp_fn(op: CmpOp) -> FragmentFn {
    Arc::new(move |left, operand| match operand {
        FragmentOperand::Fragment(right) => local::cmp_batches(op, left, right),
        FragmentOperand::Values { values, axis } => local::cmp_with_values(op, left, values, *axis),
        FragmentOperand::Scalar(value) => local::cmp_with_scalar(op, left, value),
    })
}

fn parse_arith(name: &str) -> Option<ArithOp> {
    match name {
        "add" => Some(ArithOp::Add),
        "sub" => Some(ArithOp::Sub),
        "mul" => Some(ArithOp::Mul),
        "div" | "truediv" => Some(ArithOp::Div),
        "rem" | "mod" => Some(ArithOp::Rem),
        _ => None,
    }
}

fn parse_cmp(name: &str) -> Option<CmpOp> {
    match name {
        "eq" => Some(CmpOp::Eq),
        "ne" => Some(CmpOp::Ne),
        "lt" => Some(CmpOp::Lt),
        "le" => Some(CmpOp::Le),
        "gt" => Some(CmpOp::Gt),
        "ge" => Some(CmpOp::Ge),
        _ => None,
    }
}

/// Build a frame operator from its declarative spec.
pub fn build_operator(spec: &OperatorSpec) -> Result<BinaryOperator> {
    if let Some(op) = parse_arith(&spec.op) {
        let dtypes = spec.dtypes.unwrap_or(if op == ArithOp::Div {
            DtypePolicy::Float
        } else {
            DtypePolicy::CommonCast
        });
        return Ok(BinaryOperator::register(
            arith_fn(op),
            spec.join,
            spec.labels,
            dtypes,
        ));
    }
    if let Some(op) = parse_cmp(&spec.op) {
        return Ok(BinaryOperator::register(
            cmp_fn(op),
            spec.join,
            spec.labels,
            spec.dtypes.unwrap_or(DtypePolicy::Bool),
        ));
    }
    Err(FrameError::Configuration(format!(
        "unknown operator kernel: {}",
        spec.op
    )))
}

#[derive(Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<BinaryOperator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the standard arithmetic and comparison
    /// operators under outer-join/replace-labels policies.
    pub fn with_standard_operators() -> Result<Self> {
        let mut registry = Self::new();
        for name in [
            "add", "sub", "mul", "div", "rem", "eq", "ne", "lt", "le", "gt", "ge",
        ] {
            let spec = OperatorSpec {
                op: name.to_string(),
                join: default_join(),
                labels: default_labels(),
                dtypes: None,
            };
            registry.register(name, build_operator(&spec)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, operator: BinaryOperator) {
        debug!(name, "registering frame operator");
        self.operators.insert(name.to_string(), Arc::new(operator));
    }

    /// Build and register an operator from a config value, e.g. parsed YAML:
    /// `{ op: div, join: outer, labels: replace }`.
    pub fn register_from_config(&mut self, name: &str, config: &serde_yaml::Value) -> Result<()> {
        let spec: OperatorSpec = serde_yaml::from_value(config.clone())
            .map_err(|e| FrameError::Configuration(format!("bad operator config: {e}")))?;
        let operator = build_operator(&spec)?;
        self.register(name, operator);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<BinaryOperator>> {
        self.operators.get(name)
    }

    pub fn build(&self, name: &str) -> Result<Arc<BinaryOperator>> {
        self.operators
            .get(name)
            .cloned()
            .ok_or_else(|| FrameError::Configuration(format!("unknown operator: {name}")))
    }
}
