use std::collections::BTreeSet;

use hammer_nix::NixValue;

use super::{Rule, RuleContext, RuleEffect, RuleError, RuleOutput};
use crate::lognorm::FailureRecord;
use crate::merge::strategy::AttrKey;
use crate::model::{OptionValue, RuleState};

/// Drop named dependencies from a package's propagated inputs.
///
/// Never matches a log. Decisions are written by the cycle breaker when the
/// build tool reports infinite recursion; see
/// [`crate::orchestrator::cycle`].
pub struct RemovePropagatedBuildInputs;

impl RemovePropagatedBuildInputs {
    /// Persisted rule name.
    pub const NAME: &'static str = "remove-propagated-build-inputs";

    /// Extend an existing decision with one more dependency to drop.
    #[must_use]
    pub fn with_removed(previous: Option<&OptionValue>, dependency: &str) -> OptionValue {
        let mut names: BTreeSet<String> = previous
            .map(OptionValue::list_texts)
            .unwrap_or_default()
            .into_iter()
            .collect();
        names.insert(dependency.to_owned());
        OptionValue::strings(names)
    }
}

impl Rule for RemovePropagatedBuildInputs {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        _failure: &FailureRecord,
        _previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        None
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        if value.as_list().is_none() {
            return Err(RuleError::UnexpectedValue {
                rule: self.name(),
                value: value.clone(),
            });
        }
        let names = NixValue::List(value.list_texts().into_iter().map(NixValue::Str).collect());
        let mut output = RuleOutput::default().both(AttrKey::PropagatedBuildInputs, names);
        output.newer_nixpkgs = true;
        Ok(vec![RuleEffect::Output(output)])
    }
}
