// Expression Engine Evaluator
// Evaluates rule conditions against pipeline variables

use crate::expression::parser::{BinaryOp, Expr, ExprParser, ParseExprError};

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::fmt;

/// Evaluation error
#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Runtime value of a condition operand
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    String(String),
    Bool(bool),
    Regex(Regex),
}

impl Value {
    /// Null, `false` and the empty string are falsy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::Regex(_) => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Regex(a), Value::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// Compile a `/pattern/flags` literal (flags: i, m, s, x)
pub fn compile_regex(pattern: &str, flags: &str) -> Result<Regex, EvalError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => return Err(EvalError::new(format!("unsupported regex flag '{}'", other))),
        };
    }
    builder
        .build()
        .map_err(|e| EvalError::new(format!("invalid regex /{}/: {}", pattern, e)))
}

/// Split a `/pattern/flags` string held in a variable
fn regex_from_string(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let flags = &rest[end + 1..];
    if flags.chars().all(|c| c.is_ascii_alphabetic()) {
        Some((&rest[..end], flags))
    } else {
        None
    }
}

/// Evaluates parsed conditions; undefined variables are null
pub struct Evaluator<'a> {
    variables: &'a HashMap<String, String>,
}

impl<'a> Evaluator<'a> {
    pub fn new(variables: &'a HashMap<String, String>) -> Self {
        Self { variables }
    }

    /// Evaluate an expression tree
    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::String(s) => Ok(Value::String(s.clone())),
            Expr::Regex { pattern, flags } => compile_regex(pattern, flags).map(Value::Regex),
            Expr::Variable(name) => Ok(self
                .variables
                .get(name)
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null)),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
        }
    }

    /// Evaluate an expression tree to a boolean
    pub fn eval_bool(&self, expr: &Expr) -> Result<bool, EvalError> {
        Ok(self.eval(expr)?.is_truthy())
    }

    fn eval_binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, EvalError> {
        match op {
            BinaryOp::And => {
                let left = self.eval(left)?;
                if !left.is_truthy() {
                    return Ok(left);
                }
                self.eval(right)
            }
            BinaryOp::Or => {
                let left = self.eval(left)?;
                if left.is_truthy() {
                    return Ok(left);
                }
                self.eval(right)
            }
            BinaryOp::Eq => Ok(Value::Bool(self.eval(left)? == self.eval(right)?)),
            BinaryOp::Ne => Ok(Value::Bool(self.eval(left)? != self.eval(right)?)),
            BinaryOp::Match => self.eval_match(left, right).map(Value::Bool),
            BinaryOp::NotMatch => self.eval_match(left, right).map(|m| Value::Bool(!m)),
        }
    }

    fn eval_match(&self, left: &Expr, right: &Expr) -> Result<bool, EvalError> {
        let regex = match self.eval(right)? {
            Value::Regex(regex) => regex,
            Value::String(s) => {
                let (pattern, flags) = regex_from_string(&s).ok_or_else(|| {
                    EvalError::new(format!("right side of =~ is not a regex: '{}'", s))
                })?;
                compile_regex(pattern, flags)?
            }
            Value::Null => return Ok(false),
            Value::Bool(_) => return Err(EvalError::new("right side of =~ must be a regex")),
        };

        match self.eval(left)? {
            Value::String(s) => Ok(regex.is_match(&s)),
            Value::Null => Ok(false),
            _ => Err(EvalError::new("left side of =~ must be a string or variable")),
        }
    }
}

/// Failure to parse or evaluate a condition
#[derive(Debug, Clone)]
pub enum ConditionError {
    Parse(ParseExprError),
    Eval(EvalError),
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionError::Parse(e) => write!(f, "{}", e),
            ConditionError::Eval(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConditionError {}

/// Parse and evaluate a condition string in one step
pub fn evaluate_condition(
    input: &str,
    variables: &HashMap<String, String>,
) -> Result<bool, ConditionError> {
    let expr = ExprParser::parse_str(input).map_err(ConditionError::Parse)?;
    Evaluator::new(variables)
        .eval_bool(&expr)
        .map_err(ConditionError::Eval)
}
