use std::collections::BTreeSet;

use super::{Rule, RuleContext, RuleEffect, RuleError, RuleOutput};
use crate::lognorm::FailureRecord;
use crate::model::{OptionValue, RuleState};

/// Not packaged, and only used for metadata we do not need.
const IGNORED: &[&str] = &["hatch-docstring-description"];

const MISSING_BACKEND: &[(&str, &str)] = &[
    ("No module named 'setuptools'", "setuptools"),
    ("No module named 'setuptools_scm'", "setuptools-scm"),
    ("No module named 'wheel'", "wheel"),
    ("No module named 'hatchling'", "hatchling"),
    ("No module named 'flit_core'", "flit-core"),
    ("No module named 'poetry'", "poetry-core"),
    ("No module named 'pdm'", "pdm-backend"),
    ("No module named 'Cython'", "cython"),
];

const CYTHONIZE_FAILED: &str = "RuntimeError: Running cythonize failed!";

/// Build-system packages for source builds.
///
/// On first sight the list is seeded from the sdist's `pyproject.toml`;
/// afterwards it grows with each missing build backend reported in the log.
/// A failing `cythonize` with the current Cython swaps in `cython_0`.
pub struct BuildSystems;

impl BuildSystems {
    fn seed(ctx: &RuleContext<'_>, failure: &FailureRecord) -> BTreeSet<String> {
        match ctx.sources.build_requires(&failure.drv) {
            Ok(Some(requires)) => {
                tracing::debug!(unit = %failure.unit, ?requires, "seeded build systems from pyproject.toml");
                requires
                    .into_iter()
                    .filter(|name| !IGNORED.contains(&name.as_str()))
                    .collect()
            }
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                tracing::warn!(unit = %failure.unit, error = %e, "could not read build requirements");
                BTreeSet::new()
            }
        }
    }
}

impl Rule for BuildSystems {
    fn name(&self) -> &'static str {
        "build-systems"
    }

    fn matches(
        &self,
        ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        let mut systems: BTreeSet<String> = match previous {
            Some(prev) => prev.list_texts().into_iter().collect(),
            None => Self::seed(ctx, failure),
        };
        for (needle, system) in MISSING_BACKEND {
            if failure.log.contains(needle) {
                systems.insert((*system).to_owned());
            }
        }
        if failure.log.contains(CYTHONIZE_FAILED) && systems.remove("cython") {
            tracing::debug!(unit = %failure.unit, "cythonize failed, trying cython_0");
            systems.insert("cython_0".to_owned());
        }
        if previous.is_none() && systems.is_empty() {
            return None;
        }
        Some(OptionValue::strings(systems))
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
        let output = RuleOutput {
            build_systems: value.list_texts().into_iter().collect(),
            ..RuleOutput::default()
        };
        Ok(vec![RuleEffect::Output(output)])
    }
}
