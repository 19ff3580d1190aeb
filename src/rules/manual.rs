use std::collections::{BTreeMap, BTreeSet};

use hammer_nix::NixValue;

use super::{CopyRequest, FunctionFragment, Rule, RuleContext, RuleEffect, RuleError, RuleOutput};
use crate::lognorm::FailureRecord;
use crate::merge::strategy::AttrKey;
use crate::model::{OptionValue, RuleState};

/// Directory next to the artifact that receives a copied manual override.
const MANUAL_DIR: &str = "manual";

/// Key of the map decision pointing into the manual-override root.
const DIR_KEY: &str = "dir";

/// Arguments handed to a manual override's `default.nix`.
const MANUAL_ARGS: &[&str] = &["final", "helpers", "pkgs"];

/// Hand-written fixes.
///
/// Known packages get a built-in fragment (decision: the package name). A
/// directory `<manual root>/<pkg>/<version>` holding a `default.nix` of the
/// form `{ final, helpers, pkgs, ... }: old: { ... }` is copied next to the
/// artifact and layered over it (decision: `{ dir = "<pkg>/<version>" }`).
pub struct ManualOverrides;

fn builtin(name: &str) -> Option<RuleOutput> {
    match name {
        "pillow" => Some(RuleOutput::default().argument("pkgs").src(
            AttrKey::PreConfigure,
            NixValue::literal("pkgs.python3Packages.pillow.preConfigure"),
        )),
        _ => None,
    }
}

impl Rule for ManualOverrides {
    fn name(&self) -> &'static str {
        "manual-overrides"
    }

    fn matches(
        &self,
        ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        _previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        let unit = &failure.unit;
        if let Some(root) = ctx.manual_root {
            let relative = format!("{}/{}", unit.name, unit.version);
            if root.join(&relative).join("default.nix").is_file() {
                let mut map = BTreeMap::new();
                map.insert(DIR_KEY.to_owned(), OptionValue::Str(relative));
                return Some(OptionValue::Map(map));
            }
        }
        builtin(unit.name.as_str()).map(|_| OptionValue::Str(unit.name.to_string()))
    }

    fn apply(
        &self,
        ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        let unexpected = || RuleError::UnexpectedValue {
            rule: self.name(),
            value: value.clone(),
        };
        match value {
            OptionValue::Str(name) => builtin(name)
                .map(|out| vec![RuleEffect::Output(out)])
                .ok_or_else(unexpected),
            OptionValue::Map(map) => {
                let Some(OptionValue::Str(relative)) = map.get(DIR_KEY) else {
                    return Err(unexpected());
                };
                let arguments: BTreeSet<String> =
                    MANUAL_ARGS.iter().map(|a| (*a).to_owned()).collect();
                let code = format!(
                    "import ./{MANUAL_DIR} {{ inherit {}; }}",
                    MANUAL_ARGS.join(" ")
                );
                let mut effects = Vec::with_capacity(2);
                // without a root the copy made by an earlier run stays in place
                if let Some(root) = ctx.manual_root {
                    effects.push(RuleEffect::CopyFiles(CopyRequest {
                        from: root.join(relative),
                        into: MANUAL_DIR.to_owned(),
                    }));
                }
                effects.push(RuleEffect::Function(FunctionFragment { arguments, code }));
                Ok(effects)
            }
            _ => Err(unexpected()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::{FakeSources, failure_for};

    #[test]
    fn pillow_has_a_builtin_override() {
        let sources = FakeSources::default();
        let ctx = RuleContext {
            manual_root: None,
            sources: &sources,
        };
        let value = ManualOverrides
            .matches(&ctx, &failure_for("Pillow", "10.0.0", ""), None, &RuleState::new())
            .unwrap();
        assert_eq!(value, OptionValue::Str("pillow".into()));
        let effects = ManualOverrides.apply(&ctx, &value).unwrap();
        let [RuleEffect::Output(out)] = &effects[..] else {
            panic!("expected one output");
        };
        assert_eq!(out.src_attrs[0].0, AttrKey::PreConfigure);
    }

    #[test]
    fn unknown_package_without_directory_is_no_match() {
        let sources = FakeSources::default();
        let ctx = RuleContext {
            manual_root: None,
            sources: &sources,
        };
        assert_eq!(
            ManualOverrides.matches(&ctx, &failure_for("foo", "1.0", ""), None, &RuleState::new()),
            None
        );
    }

    #[test]
    fn manual_directory_is_copied_and_layered() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("foo/1.0");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("default.nix"), "{ ... }: old: { }").unwrap();

        let sources = FakeSources::default();
        let ctx = RuleContext {
            manual_root: Some(root.path()),
            sources: &sources,
        };
        let value = ManualOverrides
            .matches(&ctx, &failure_for("foo", "1.0", ""), None, &RuleState::new())
            .unwrap();
        let effects = ManualOverrides.apply(&ctx, &value).unwrap();
        let [RuleEffect::CopyFiles(copy), RuleEffect::Function(fragment)] = &effects[..] else {
            panic!("expected copy + function, got {effects:?}");
        };
        assert_eq!(copy.from, dir);
        assert_eq!(copy.into, "manual");
        assert_eq!(
            fragment.code,
            "import ./manual { inherit final helpers pkgs; }"
        );
    }

    #[test]
    fn directory_decision_without_root_keeps_existing_copy() {
        let sources = FakeSources::default();
        let ctx = RuleContext {
            manual_root: None,
            sources: &sources,
        };
        let mut map = BTreeMap::new();
        map.insert(DIR_KEY.to_owned(), OptionValue::Str("foo/1.0".into()));
        let effects = ManualOverrides.apply(&ctx, &OptionValue::Map(map)).unwrap();
        let [RuleEffect::Function(fragment)] = &effects[..] else {
            panic!("expected only the function layer, got {effects:?}");
        };
        assert_eq!(
            fragment.code,
            "import ./manual { inherit final helpers pkgs; }"
        );
    }
}
