use crate::types::WorkflowExecutionContext;
use cohort_core::{CohortError, CohortResult};
use std::fmt;
use std::str::FromStr;

/// A guard for `WAIT`, `LOOP` and `BRANCH` steps.
///
/// Written as `var:<name>` (variable is set), `step:<id>` (step produced a
/// result) or `iteration:<n>` (loop counter below `n`). Any other text is
/// always true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    VariableExists(String),
    StepCompleted(String),
    IterationBelow(u32),
}

impl Condition {
    /// Parse a condition string. Only a malformed `iteration:` bound fails.
    pub fn parse(text: &str) -> CohortResult<Self> {
        if let Some(name) = text.strip_prefix("var:") {
            return Ok(Condition::VariableExists(name.to_string()));
        }
        if let Some(step) = text.strip_prefix("step:") {
            return Ok(Condition::StepCompleted(step.to_string()));
        }
        if let Some(bound) = text.strip_prefix("iteration:") {
            return bound
                .trim()
                .parse()
                .map(Condition::IterationBelow)
                .map_err(|_| {
                    CohortError::InvalidInput(format!("Invalid iteration bound in '{text}'"))
                });
        }
        Ok(Condition::Always)
    }

    pub fn evaluate(&self, ctx: &WorkflowExecutionContext) -> bool {
        match self {
            Condition::Always => true,
            Condition::VariableExists(name) => ctx.variables.contains_key(name),
            Condition::StepCompleted(step) => ctx.step_results.contains_key(step),
            Condition::IterationBelow(bound) => ctx.iteration < *bound,
        }
    }
}

impl FromStr for Condition {
    type Err = CohortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => write!(f, "always"),
            Condition::VariableExists(name) => write!(f, "var:{name}"),
            Condition::StepCompleted(step) => write!(f, "step:{step}"),
            Condition::IterationBelow(bound) => write!(f, "iteration:{bound}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> WorkflowExecutionContext {
        WorkflowExecutionContext::new("wf", "run-1", Some("start".into()), Default::default())
    }

    #[test]
    fn test_parse_prefixes() {
        assert_eq!(
            Condition::parse("var:ready").unwrap(),
            Condition::VariableExists("ready".into())
        );
        assert_eq!(
            Condition::parse("step:fetch").unwrap(),
            Condition::StepCompleted("fetch".into())
        );
        assert_eq!(
            Condition::parse("iteration:3").unwrap(),
            Condition::IterationBelow(3)
        );
        assert_eq!(Condition::parse("anything else").unwrap(), Condition::Always);
        assert_eq!(Condition::parse("").unwrap(), Condition::Always);
    }

    #[test]
    fn test_bad_iteration_bound() {
        let err = "iteration:many".parse::<Condition>().unwrap_err();
        assert!(matches!(err, CohortError::InvalidInput(_)));
    }

    #[test]
    fn test_evaluate_against_context() {
        let mut ctx = ctx();
        let var = Condition::parse("var:ready").unwrap();
        let step = Condition::parse("step:fetch").unwrap();
        let iter = Condition::parse("iteration:2").unwrap();

        assert!(!var.evaluate(&ctx));
        assert!(!step.evaluate(&ctx));
        assert!(iter.evaluate(&ctx));

        ctx.variables.insert("ready".into(), json!(true));
        ctx.step_results.insert("fetch".into(), json!(null));
        ctx.iteration = 2;
        assert!(var.evaluate(&ctx));
        assert!(step.evaluate(&ctx));
        assert!(!iter.evaluate(&ctx));
        assert!(Condition::Always.evaluate(&ctx));
    }

    #[test]
    fn test_display_round_trips() {
        for text in ["var:x", "step:y", "iteration:4"] {
            assert_eq!(Condition::parse(text).unwrap().to_string(), text);
        }
    }
}
