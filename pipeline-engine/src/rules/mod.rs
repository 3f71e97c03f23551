// Rules Module
// Trigger context and per-job inclusion decisions (rules, only/except)

pub mod context;
pub mod evaluator;

pub use context::{RuleContext, TriggerEvent};
pub use evaluator::{
    Rule, RuleDecision, RuleError, RuleEvaluation, RuleEvaluator, RulePredicate,
};
