use super::{Rule, RuleContext, RuleEffect, RuleError};
use crate::lognorm::FailureRecord;
use crate::model::{OptionValue, RuleState};

const PYTHON2_SIGNS: &[&str] = &[
    "Missing parentheses in call to 'print'",
    "Missing parentheses in call to 'exec'",
    "is Python 2 only",
];

/// Packages that only ever supported Python 2 cannot be fixed by overrides.
pub struct Python2Only;

impl Rule for Python2Only {
    fn name(&self) -> &'static str {
        "python2-only"
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        _previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        PYTHON2_SIGNS
            .iter()
            .find(|sign| failure.log.contains(*sign))
            .map(|sign| OptionValue::Str(format!("Python 2 only: {sign}")))
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        match value {
            OptionValue::Str(reason) => Ok(vec![RuleEffect::Exclude {
                reason: reason.clone(),
            }]),
            other => Err(RuleError::UnexpectedValue {
                rule: self.name(),
                value: other.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{FakeSources, failure};

    #[test]
    fn print_statement_excludes() {
        let sources = FakeSources::default();
        let ctx = RuleContext {
            manual_root: None,
            sources: &sources,
        };
        let log = "    print \"hello\"\nSyntaxError: Missing parentheses in call to 'print'. Did you mean print(...)?";
        let value = Python2Only
            .matches(&ctx, &failure(log), None, &RuleState::new())
            .unwrap();
        let effects = Python2Only.apply(&ctx, &value).unwrap();
        assert!(matches!(
            &effects[..],
            [RuleEffect::Exclude { reason }] if reason.contains("print")
        ));
    }

    #[test]
    fn python3_syntax_errors_are_not_exclusions() {
        let sources = FakeSources::default();
        let ctx = RuleContext {
            manual_root: None,
            sources: &sources,
        };
        assert_eq!(
            Python2Only.matches(
                &ctx,
                &failure("SyntaxError: invalid syntax"),
                None,
                &RuleState::new()
            ),
            None
        );
    }
}
