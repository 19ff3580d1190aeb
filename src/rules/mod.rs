//! Diagnostic rules.
//!
//! A [`Rule`] looks at one failing unit's log (plus what every other rule
//! already decided for that unit) and either stays silent or produces an
//! [`OptionValue`]. Decisions are persisted; [`Rule::apply`] later renders a
//! decision into [`RuleEffect`]s for the merge engine without looking at the
//! log again.
//!
//! The set of rules is the static [`REGISTRY`]. It is evaluated in slice
//! order, and rules that read another rule's decision (`dont-use-cmake-configure`
//! reads `native-build-inputs`) are listed after the rule they read.

mod build_systems;
mod constraints;
mod cycle;
mod exclusion;
mod inputs;
mod manual;
mod patches;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use hammer_nix::NixValue;

use crate::backend::{BackendError, SourceInspector};
use crate::lognorm::FailureRecord;
use crate::merge::strategy::AttrKey;
use crate::model::{OptionValue, RuleState};

pub use build_systems::BuildSystems;
pub use constraints::{DistutilsRemoved, NumpyAbi, NumpyDistutils};
pub use cycle::RemovePropagatedBuildInputs;
pub use exclusion::Python2Only;
pub use inputs::{BuildInputs, Cuda, DontUseCmakeConfigure, NativeBuildInputs};
pub use manual::ManualOverrides;
pub use patches::{CargoLock, RemoveBuildSystemPins};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a rule may consult besides the failure itself.
///
/// Passed explicitly to every call; rules hold no global state.
#[derive(Clone, Copy)]
pub struct RuleContext<'a> {
    /// Root of hand-written overrides (`<root>/<pkg>/<version>/default.nix`).
    pub manual_root: Option<&'a Path>,
    /// Bounded, cached lookups into a unit's source archive.
    pub sources: &'a dyn SourceInspector,
}

impl fmt::Debug for RuleContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleContext")
            .field("manual_root", &self.manual_root)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Rule output
// ---------------------------------------------------------------------------

/// Structured contribution of one rule to a unit's override.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleOutput {
    /// Build-system packages (`final.<name>`) for source builds.
    pub build_systems: BTreeSet<String>,
    /// Function arguments the generated code needs (`pkgs`, `helpers`, ...).
    pub arguments: BTreeSet<String>,
    /// Attribute fragments for builds from source.
    pub src_attrs: Vec<(AttrKey, NixValue)>,
    /// Attribute fragments for prebuilt wheels.
    pub wheel_attrs: Vec<(AttrKey, NixValue)>,
    /// The next build must use the newer package snapshot.
    pub newer_nixpkgs: bool,
    /// Dependency constraints for the build project (`numpy` → `<2`).
    pub constraints: Vec<(String, String)>,
    /// Python version the build project must be downgraded to.
    pub python_downgrade: Option<String>,
}

impl RuleOutput {
    /// Require a function argument.
    #[must_use]
    pub fn argument(mut self, name: &str) -> Self {
        self.arguments.insert(name.to_owned());
        self
    }

    /// Add a source-build fragment.
    #[must_use]
    pub fn src(mut self, key: AttrKey, value: NixValue) -> Self {
        self.src_attrs.push((key, value));
        self
    }

    /// Add the same fragment to source and wheel builds.
    #[must_use]
    pub fn both(mut self, key: AttrKey, value: NixValue) -> Self {
        self.wheel_attrs.push((key, value.clone()));
        self.src_attrs.push((key, value));
        self
    }

    /// Add a dependency constraint.
    #[must_use]
    pub fn constraint(mut self, dependency: &str, specifier: &str) -> Self {
        self.constraints
            .push((dependency.to_owned(), specifier.to_owned()));
        self
    }
}

/// A layer composed over the structured override: `old: { ... }`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionFragment {
    /// Function arguments the fragment refers to.
    pub arguments: BTreeSet<String>,
    /// Nix expression evaluating to an `old: attrs` function.
    pub code: String,
}

/// Auxiliary files to copy next to the generated artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyRequest {
    /// Source directory.
    pub from: PathBuf,
    /// Destination, relative to the unit's override directory.
    pub into: String,
}

/// What [`Rule::apply`] turns a decision into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleEffect {
    /// Structured attribute fragments and project-level requests.
    Output(RuleOutput),
    /// A raw function layer.
    Function(FunctionFragment),
    /// Files to materialize alongside the artifact.
    CopyFiles(CopyRequest),
    /// The unit can never be built by this toolchain generation.
    Exclude {
        /// Human-readable reason.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error rendering or materializing a rule decision.
#[derive(Debug)]
pub enum RuleError {
    /// The persisted decision does not have the shape this rule writes.
    UnexpectedValue {
        /// Rule name.
        rule: &'static str,
        /// The offending value.
        value: OptionValue,
    },
    /// A file the decision depends on could not be extracted.
    Extract {
        /// Rule name.
        rule: &'static str,
        /// What was being extracted.
        file: String,
        /// Why it failed.
        detail: String,
    },
    /// Source inspection failed.
    Backend {
        /// Rule name.
        rule: &'static str,
        /// Underlying error.
        source: BackendError,
    },
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedValue { rule, value } => {
                write!(f, "rule '{rule}' cannot use the recorded decision {value}")
            }
            Self::Extract { rule, file, detail } => {
                write!(f, "rule '{rule}' could not extract {file}: {detail}")
            }
            Self::Backend { rule, source } => write!(f, "rule '{rule}': {source}"),
        }
    }
}

impl std::error::Error for RuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rule trait and registry
// ---------------------------------------------------------------------------

/// One diagnostic.
pub trait Rule: Sync {
    /// Stable name; the key in persisted rule state.
    fn name(&self) -> &'static str;

    /// Decide, from the failure and the unit's current state, what this rule
    /// wants. `None` means "no opinion"; the previous decision is kept.
    ///
    /// Given the same log and the same `previous`, the result equals
    /// `previous`.
    fn matches(
        &self,
        ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        previous: Option<&OptionValue>,
        state: &RuleState,
    ) -> Option<OptionValue>;

    /// Render a decision.
    ///
    /// # Errors
    /// [`RuleError::UnexpectedValue`] when `value` is not a decision this
    /// rule produces (a hand-edited or stale state file).
    fn apply(&self, ctx: &RuleContext<'_>, value: &OptionValue)
    -> Result<Vec<RuleEffect>, RuleError>;

    /// Materialize auxiliary files for a fresh decision into `target`.
    ///
    /// # Errors
    /// Returns [`RuleError`] when the files cannot be produced.
    fn extract(
        &self,
        _ctx: &RuleContext<'_>,
        _failure: &FailureRecord,
        _value: &OptionValue,
        _target: &Path,
    ) -> Result<(), RuleError> {
        Ok(())
    }

    /// Re-render even when the decision did not change, because the effect
    /// depends on other rules' decisions.
    fn always_reapply(&self) -> bool {
        false
    }
}

/// Every rule, in evaluation order.
pub static REGISTRY: &[&dyn Rule] = &[
    &BuildSystems,
    &NativeBuildInputs,
    &BuildInputs,
    &Cuda,
    &DontUseCmakeConfigure,
    &RemoveBuildSystemPins,
    &CargoLock,
    &ManualOverrides,
    &NumpyAbi,
    &NumpyDistutils,
    &DistutilsRemoved,
    &Python2Only,
    &RemovePropagatedBuildInputs,
];

/// Look a rule up by its persisted name.
#[must_use]
pub fn find(name: &str) -> Option<&'static dyn Rule> {
    REGISTRY.iter().copied().find(|rule| rule.name() == name)
}

// ---------------------------------------------------------------------------
// Rule pass
// ---------------------------------------------------------------------------

/// What one rule pass over one failing unit did to its state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Rules whose decision changed (including first decisions).
    pub changed: Vec<&'static str>,
    /// Rules that decided for the first time and may need to extract files.
    pub fresh: Vec<&'static str>,
    /// Always-re-apply rules that matched with an unchanged decision.
    pub reapplied: Vec<&'static str>,
}

impl PassOutcome {
    /// Whether this pass counts as progress.
    ///
    /// A changed decision always does, and resets the unit's re-apply
    /// credit. An always-re-apply rule with an unchanged decision counts
    /// once; `credited` remembers which ones already have.
    pub fn made_progress(&self, credited: &mut BTreeSet<&'static str>) -> bool {
        if !self.changed.is_empty() {
            credited.clear();
            credited.extend(self.reapplied.iter().copied());
            return true;
        }
        let mut progress = false;
        for rule in &self.reapplied {
            progress |= credited.insert(*rule);
        }
        progress
    }
}

/// Run `rules` against one failing unit, updating `state` in place.
///
/// Rules see the live state, so a rule later in `rules` observes decisions
/// made earlier in the same pass.
#[tracing::instrument(skip_all, fields(unit = %failure.unit))]
pub fn run_rules(
    ctx: &RuleContext<'_>,
    rules: &[&'static dyn Rule],
    failure: &FailureRecord,
    state: &mut RuleState,
) -> PassOutcome {
    let mut outcome = PassOutcome::default();
    for rule in rules {
        let name = rule.name();
        let previous = state.get(name).cloned();
        let Some(value) = rule.matches(ctx, failure, previous.as_ref(), state) else {
            continue;
        };
        if previous.as_ref() == Some(&value) {
            if rule.always_reapply() {
                outcome.reapplied.push(name);
            }
            tracing::debug!(rule = name, "unchanged decision");
            continue;
        }
        tracing::info!(rule = name, decision = %value, "rule hit");
        if previous.is_none() {
            outcome.fresh.push(name);
        }
        outcome.changed.push(name);
        state.insert(name, value);
    }
    outcome
}

// ---------------------------------------------------------------------------
// Helpers shared by the rule implementations
// ---------------------------------------------------------------------------

/// Substring → items table used by accumulating rules.
pub(crate) type Hints = &'static [(&'static str, &'static [&'static str])];

/// Union the items of every hint found in `log` into the previous list.
///
/// Returns `None` when no hint matches, so the previous decision stands.
pub(crate) fn accumulate(
    previous: Option<&OptionValue>,
    log: &str,
    hints: Hints,
    make: fn(String) -> OptionValue,
) -> Option<OptionValue> {
    let hits: Vec<&str> = hints
        .iter()
        .filter(|(needle, _)| log.contains(needle))
        .flat_map(|(_, items)| items.iter().copied())
        .collect();
    if hits.is_empty() {
        return None;
    }
    let mut items: BTreeSet<String> = previous
        .map(OptionValue::list_texts)
        .unwrap_or_default()
        .into_iter()
        .collect();
    items.extend(hits.into_iter().map(str::to_owned));
    Some(OptionValue::List(items.into_iter().map(make).collect()))
}

/// The decision as a list of Nix values, or an [`RuleError::UnexpectedValue`].
pub(crate) fn expect_list(rule: &'static str, value: &OptionValue) -> Result<NixValue, RuleError> {
    match value {
        OptionValue::List(_) => Ok(value.to_nix()),
        other => Err(RuleError::UnexpectedValue {
            rule,
            value: other.clone(),
        }),
    }
}

/// The decision as a `dependency → specifier` map of strings.
pub(crate) fn expect_constraints(
    rule: &'static str,
    value: &OptionValue,
) -> Result<BTreeMap<String, String>, RuleError> {
    let unexpected = || RuleError::UnexpectedValue {
        rule,
        value: value.clone(),
    };
    value
        .as_map()
        .ok_or_else(unexpected)?
        .iter()
        .map(|(dep, spec)| match spec {
            OptionValue::Str(s) => Ok((dep.clone(), s.clone())),
            _ => Err(unexpected()),
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the rule tests.

    use std::collections::HashMap;
    use std::path::Path;

    use crate::backend::{BackendError, SourceInspector};
    use crate::lognorm::FailureRecord;
    use crate::model::UnitId;

    /// In-memory source archives keyed by derivation.
    #[derive(Default)]
    pub struct FakeSources {
        pub requires: HashMap<String, Vec<String>>,
        pub files: HashMap<(String, String), Vec<u8>>,
    }

    impl SourceInspector for FakeSources {
        fn build_requires(&self, drv: &str) -> Result<Option<Vec<String>>, BackendError> {
            Ok(self.requires.get(drv).cloned())
        }

        fn read_file(&self, drv: &str, name: &str) -> Result<Option<Vec<u8>>, BackendError> {
            Ok(self.files.get(&(drv.to_owned(), name.to_owned())).cloned())
        }

        fn unpack(&self, _drv: &str, _dest: &Path) -> Result<bool, BackendError> {
            Ok(false)
        }
    }

    pub const DRV: &str = "/nix/store/aaa-python3.12-foo-1.0.drv";

    pub fn failure(log: &str) -> FailureRecord {
        FailureRecord {
            drv: DRV.to_owned(),
            unit: UnitId::new("foo", "1.0"),
            log: log.to_owned(),
        }
    }

    pub fn failure_for(pkg: &str, version: &str, log: &str) -> FailureRecord {
        FailureRecord {
            drv: format!("/nix/store/aaa-python3.12-{pkg}-{version}.drv"),
            unit: UnitId::new(pkg, version),
            log: log.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::testing::{FakeSources, failure};
    use super::*;

    fn ctx(sources: &FakeSources) -> RuleContext<'_> {
        RuleContext {
            manual_root: None,
            sources,
        }
    }

    #[test]
    fn registry_names_are_unique() {
        let names: HashSet<_> = REGISTRY.iter().map(|r| r.name()).collect();
        assert_eq!(names.len(), REGISTRY.len());
    }

    #[test]
    fn find_by_name() {
        assert_eq!(find("build-systems").map(|r| r.name()), Some("build-systems"));
        assert!(find("no-such-rule").is_none());
    }

    #[test]
    fn cross_rule_reader_runs_after_its_source() {
        let pos = |name| REGISTRY.iter().position(|r| r.name() == name).unwrap();
        assert!(pos("native-build-inputs") < pos("dont-use-cmake-configure"));
        assert!(pos("build-systems") < pos("distutils-removed"));
    }

    #[test]
    fn pass_records_changes_and_is_idempotent() {
        let sources = FakeSources::default();
        let ctx = ctx(&sources);
        let failure = failure("fatal error: zlib.h: No such file or directory");
        let mut state = RuleState::new();

        let first = run_rules(&ctx, REGISTRY, &failure, &mut state);
        assert_eq!(first.changed, vec!["native-build-inputs"]);
        assert_eq!(first.fresh, vec!["native-build-inputs"]);

        let second = run_rules(&ctx, REGISTRY, &failure, &mut state);
        assert!(second.changed.is_empty());
        assert!(!second.made_progress(&mut BTreeSet::new()));
    }

    #[test]
    fn reapply_counts_as_progress_once() {
        let sources = FakeSources::default();
        let ctx = ctx(&sources);
        let failure = failure("CMake must be installed to build from source");
        let mut state = RuleState::new();
        let mut credit = BTreeSet::new();

        let first = run_rules(&ctx, REGISTRY, &failure, &mut state);
        assert!(first.changed.contains(&"native-build-inputs"));
        assert!(first.changed.contains(&"dont-use-cmake-configure"));
        assert!(first.made_progress(&mut credit));

        let second = run_rules(&ctx, REGISTRY, &failure, &mut state);
        assert!(second.changed.is_empty());
        assert_eq!(second.reapplied, vec!["dont-use-cmake-configure"]);
        assert!(second.made_progress(&mut credit));

        let third = run_rules(&ctx, REGISTRY, &failure, &mut state);
        assert!(!third.made_progress(&mut credit));
    }

    #[test]
    fn unmatched_log_leaves_state_alone() {
        let sources = FakeSources::default();
        let ctx = ctx(&sources);
        let mut state = RuleState::new();
        state.insert("numpy-abi", OptionValue::Map(BTreeMap::new()));
        let before = state.clone();
        let outcome = run_rules(&ctx, REGISTRY, &failure("nothing useful"), &mut state);
        assert_eq!(outcome, PassOutcome::default());
        assert_eq!(state, before);
    }

    #[test]
    fn accumulate_unions_and_sorts() {
        const HINTS: Hints = &[("b!", &["pkgs.b"]), ("a!", &["pkgs.a", "pkgs.c"])];
        let prev = OptionValue::literals(["pkgs.z"]);
        let next = accumulate(Some(&prev), "a! b!", HINTS, OptionValue::Literal).unwrap();
        assert_eq!(
            next,
            OptionValue::literals(["pkgs.a", "pkgs.b", "pkgs.c", "pkgs.z"])
        );
        assert_eq!(accumulate(Some(&prev), "none", HINTS, OptionValue::Literal), None);
    }
}
