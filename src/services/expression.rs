//! Restricted arithmetic over symbolic query references.
//!
//! Expressions are parsed with `evalexpr` but never evaluated by it: the operator tree is
//! checked against a small whitelist (numeric literals, `+ - * /`, unary minus, parentheses
//! and bare reference identifiers) and then folded in `f64` by [`CompiledExpression::evaluate`].
//! Function calls, assignments, comparisons, strings and sequencing are rejected at compile
//! time, so caller-supplied text is never interpreted as a script.

use evalexpr::{build_operator_tree, Node, Operator, Value};

const MAX_EXPRESSION_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionError {
    Empty,
    TooLong { len: usize },
    Parse(String),
    Unsupported(String),
    NoReferences,
    Malformed(String),
    NonFinite,
}

impl std::fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Expression cannot be empty"),
            Self::TooLong { len } => write!(
                f,
                "Expression is too long ({len} bytes, max {MAX_EXPRESSION_LEN})"
            ),
            Self::Parse(msg) => write!(f, "Invalid expression: {msg}"),
            Self::Unsupported(msg) => write!(f, "Unsupported expression: {msg}"),
            Self::NoReferences => {
                write!(f, "No valid query references found in arithmetic expression")
            }
            Self::Malformed(msg) => write!(f, "Malformed expression tree: {msg}"),
            Self::NonFinite => write!(f, "Expression evaluates to a non-finite number"),
        }
    }
}

impl std::error::Error for ExpressionError {}

#[derive(Debug, Clone)]
pub struct CompiledExpression {
    expression: String,
    tree: Node,
    references: Vec<String>,
}

pub fn is_valid_reference(raw: &str) -> bool {
    let mut chars = raw.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn const_to_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Float(v) => Ok(*v),
        Value::Int(v) => Ok(*v as f64),
        other => Err(format!("only numeric literals are allowed, got {other}")),
    }
}

fn check_node(
    node: &Node,
    is_root: bool,
    references: &mut Vec<String>,
) -> Result<(), ExpressionError> {
    let arity = node.children().len();
    match node.operator() {
        Operator::RootNode => {
            if arity > 1 {
                return Err(ExpressionError::Unsupported(
                    "multiple expressions are not allowed".to_string(),
                ));
            }
            // Nested roots are parenthesised groups: `()` has no value.
            if !is_root && arity == 0 {
                return Err(ExpressionError::Malformed(
                    "empty parentheses".to_string(),
                ));
            }
        }
        Operator::Add | Operator::Sub | Operator::Mul | Operator::Div => {
            if arity != 2 {
                return Err(ExpressionError::Malformed(format!(
                    "binary operator {} has {arity} operands",
                    node.operator()
                )));
            }
        }
        Operator::Neg => {
            if arity != 1 {
                return Err(ExpressionError::Malformed(format!(
                    "negation has {arity} operands"
                )));
            }
        }
        Operator::Const { value } => {
            const_to_float(value).map_err(ExpressionError::Unsupported)?;
        }
        Operator::VariableIdentifierRead { identifier } => {
            if !is_valid_reference(identifier) {
                return Err(ExpressionError::Unsupported(format!(
                    "\"{identifier}\" is not a valid query reference"
                )));
            }
            if !references.iter().any(|existing| existing == identifier) {
                references.push(identifier.clone());
            }
        }
        Operator::FunctionIdentifier { identifier } => {
            return Err(ExpressionError::Unsupported(format!(
                "function calls are not allowed ({identifier})"
            )));
        }
        other => {
            return Err(ExpressionError::Unsupported(format!(
                "operator {other} is not allowed"
            )));
        }
    }

    for child in node.children() {
        check_node(child, false, references)?;
    }
    Ok(())
}

/// Parses and validates `raw`, collecting the referenced query ids in order of first
/// appearance. An expression with no references is rejected.
pub fn compile_expression(raw: &str) -> Result<CompiledExpression, ExpressionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ExpressionError::Empty);
    }
    if trimmed.len() > MAX_EXPRESSION_LEN {
        return Err(ExpressionError::TooLong { len: trimmed.len() });
    }

    let tree =
        build_operator_tree(trimmed).map_err(|err| ExpressionError::Parse(err.to_string()))?;
    let mut references = Vec::new();
    check_node(&tree, true, &mut references)?;
    if references.is_empty() {
        return Err(ExpressionError::NoReferences);
    }

    Ok(CompiledExpression {
        expression: trimmed.to_string(),
        tree,
        references,
    })
}

fn eval_node(node: &Node, lookup: &dyn Fn(&str) -> f64) -> Result<f64, ExpressionError> {
    let children = node.children();
    let operand = |idx: usize| -> Result<f64, ExpressionError> {
        let child = children.get(idx).ok_or_else(|| {
            ExpressionError::Malformed(format!("missing operand for {}", node.operator()))
        })?;
        eval_node(child, lookup)
    };

    match node.operator() {
        Operator::RootNode => operand(0),
        Operator::Add => Ok(operand(0)? + operand(1)?),
        Operator::Sub => Ok(operand(0)? - operand(1)?),
        Operator::Mul => Ok(operand(0)? * operand(1)?),
        Operator::Div => Ok(operand(0)? / operand(1)?),
        Operator::Neg => Ok(-operand(0)?),
        Operator::Const { value } => const_to_float(value).map_err(ExpressionError::Unsupported),
        Operator::VariableIdentifierRead { identifier } => Ok(lookup(identifier)),
        other => Err(ExpressionError::Unsupported(format!(
            "operator {other} is not allowed"
        ))),
    }
}

impl CompiledExpression {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn references(&self) -> &[String] {
        &self.references
    }

    /// Evaluates the expression with every reference bound through `lookup`.
    /// Division by zero and overflow surface as [`ExpressionError::NonFinite`].
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> f64) -> Result<f64, ExpressionError> {
        let value = eval_node(&self.tree, lookup)?;
        if !value.is_finite() {
            return Err(ExpressionError::NonFinite);
        }
        Ok(value)
    }
}
