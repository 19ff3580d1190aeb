//! Rules that change the build project instead of the package recipe.

use std::collections::BTreeMap;

use super::{Rule, RuleContext, RuleEffect, RuleError, RuleOutput, expect_constraints};
use crate::lognorm::FailureRecord;
use crate::model::{OptionValue, RuleState};

const NUMPY_ABI: &[&str] = &[
    "A module that was compiled using NumPy 1.x cannot be run in",
    "numpy.dtype size changed, may indicate binary incompatibility",
    "_ARRAY_API not found",
];

const NUMPY_DISTUTILS: &str = "No module named 'numpy.distutils'";

const DISTUTILS: &str = "No module named 'distutils'";

/// Last Python release that still ships `distutils`.
const DISTUTILS_PYTHON: &str = "3.11";

fn constraint(dependency: &str, specifier: &str) -> OptionValue {
    let mut map = BTreeMap::new();
    map.insert(dependency.to_owned(), OptionValue::Str(specifier.to_owned()));
    OptionValue::Map(map)
}

fn constraint_output(
    rule: &'static str,
    value: &OptionValue,
) -> Result<Vec<RuleEffect>, RuleError> {
    let output = expect_constraints(rule, value)?
        .iter()
        .fold(RuleOutput::default(), |out, (dep, spec)| out.constraint(dep, spec));
    Ok(vec![RuleEffect::Output(output)])
}

/// Extension compiled against NumPy 1.x, loaded with NumPy 2.
pub struct NumpyAbi;

impl Rule for NumpyAbi {
    fn name(&self) -> &'static str {
        "numpy-abi"
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        _previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        NUMPY_ABI
            .iter()
            .any(|needle| failure.log.contains(needle))
            .then(|| constraint("numpy", "<2"))
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        constraint_output(self.name(), value)
    }
}

/// `numpy.distutils` is gone from newer NumPy releases.
pub struct NumpyDistutils;

impl Rule for NumpyDistutils {
    fn name(&self) -> &'static str {
        "numpy-distutils"
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        _previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        failure
            .log
            .contains(NUMPY_DISTUTILS)
            .then(|| constraint("numpy", "<1.22"))
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        constraint_output(self.name(), value)
    }
}

/// `distutils` was removed in Python 3.12. Once setuptools is already a
/// build system and the import still fails, the package needs an older
/// interpreter.
pub struct DistutilsRemoved;

impl Rule for DistutilsRemoved {
    fn name(&self) -> &'static str {
        "distutils-removed"
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        _previous: Option<&OptionValue>,
        state: &RuleState,
    ) -> Option<OptionValue> {
        if !failure.log.contains(DISTUTILS) {
            return None;
        }
        let setuptools = OptionValue::Str("setuptools".to_owned());
        state
            .get("build-systems")
            .is_some_and(|systems| systems.list_contains(&setuptools))
            .then(|| OptionValue::Str(DISTUTILS_PYTHON.to_owned()))
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        let OptionValue::Str(version) = value else {
            return Err(RuleError::UnexpectedValue {
                rule: self.name(),
                value: value.clone(),
            });
        };
        Ok(vec![RuleEffect::Output(RuleOutput {
            python_downgrade: Some(version.clone()),
            ..RuleOutput::default()
        })])
    }
}
