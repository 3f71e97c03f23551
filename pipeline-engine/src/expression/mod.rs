// Expression Engine Module
// Rule conditions: $VAR comparisons, regex matching and boolean logic

pub mod evaluator;
pub mod lexer;
pub mod parser;

pub use evaluator::{
    compile_regex, evaluate_condition, ConditionError, EvalError, Evaluator, Value,
};
pub use lexer::{LexError, Lexer, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError};
