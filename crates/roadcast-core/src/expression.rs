//! Trigger condition expression AST
//!
//! Conditions arrive from the cloud as trees of `ExpressionNode`. Within a
//! collection scheme all nodes live in one arena (`Vec<ExpressionNode>`) and
//! child edges are arena indices; the matrix extractor later copies the
//! reachable nodes of every enabled scheme into a single flat storage and
//! rewrites the edges to point into that storage.

use crate::signal::SignalId;
use serde::{Deserialize, Serialize};

/// Index of a node within its owning arena (a scheme's node pool, or the
/// inspection matrix's flat storage after extraction).
pub type NodeIndex = u32;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExpressionNodeType {
    #[default]
    Float,
    Signal,
    Boolean,
    String,
    OperatorSmaller,
    OperatorBigger,
    OperatorSmallerEqual,
    OperatorBiggerEqual,
    OperatorEqual,
    OperatorNotEqual,
    OperatorLogicalAnd,
    OperatorLogicalOr,
    OperatorLogicalNot,
    OperatorArithmeticPlus,
    OperatorArithmeticMinus,
    OperatorArithmeticMultiply,
    OperatorArithmeticDivide,
    WindowFunction,
    CustomFunction,
    IsNullFunction,
    None,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum WindowFunction {
    LastFixedWindowAvg,
    PrevLastFixedWindowAvg,
    LastFixedWindowMin,
    PrevLastFixedWindowMin,
    LastFixedWindowMax,
    PrevLastFixedWindowMax,
    #[default]
    None,
}

pub type CustomFunctionInvocationId = u64;

/// Function payload of a node, populated for window and custom functions.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExpressionFunction {
    pub window_function: WindowFunction,
    pub custom_function_name: String,
    /// Arena indices of the parameters, in call order.
    pub custom_function_params: Vec<NodeIndex>,
    pub custom_function_invocation_id: CustomFunctionInvocationId,
}

/// One AST node. Leaf payloads are all present with defaults; `node_type`
/// selects which one is meaningful.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExpressionNode {
    pub node_type: ExpressionNodeType,
    pub left: Option<NodeIndex>,
    pub right: Option<NodeIndex>,
    pub floating_value: f64,
    pub boolean_value: bool,
    pub string_value: String,
    pub signal_id: SignalId,
    pub function: ExpressionFunction,
}

impl ExpressionNode {
    pub fn float(value: f64) -> Self {
        Self {
            node_type: ExpressionNodeType::Float,
            floating_value: value,
            ..Default::default()
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            node_type: ExpressionNodeType::Boolean,
            boolean_value: value,
            ..Default::default()
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self {
            node_type: ExpressionNodeType::String,
            string_value: value.into(),
            ..Default::default()
        }
    }

    pub fn signal(signal_id: SignalId) -> Self {
        Self {
            node_type: ExpressionNodeType::Signal,
            signal_id,
            ..Default::default()
        }
    }

    pub fn operator(
        node_type: ExpressionNodeType,
        left: Option<NodeIndex>,
        right: Option<NodeIndex>,
    ) -> Self {
        Self {
            node_type,
            left,
            right,
            ..Default::default()
        }
    }

    pub fn custom_function(
        name: impl Into<String>,
        params: Vec<NodeIndex>,
    ) -> Self {
        Self {
            node_type: ExpressionNodeType::CustomFunction,
            function: ExpressionFunction {
                custom_function_name: name.into(),
                custom_function_params: params,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_constructors() {
        let n = ExpressionNode::float(5.5);
        assert_eq!(n.node_type, ExpressionNodeType::Float);
        assert_eq!(n.floating_value, 5.5);
        assert!(n.left.is_none());

        let s = ExpressionNode::signal(99);
        assert_eq!(s.node_type, ExpressionNodeType::Signal);
        assert_eq!(s.signal_id, 99);

        let op = ExpressionNode::operator(ExpressionNodeType::OperatorBigger, Some(0), Some(1));
        assert_eq!(op.left, Some(0));
        assert_eq!(op.right, Some(1));
    }
}
