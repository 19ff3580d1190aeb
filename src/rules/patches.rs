//! Rules that patch the source tree.

use hammer_nix::NixValue;

use super::{Rule, RuleContext, RuleEffect, RuleError, RuleOutput};
use crate::lognorm::FailureRecord;
use crate::merge::strategy::AttrKey;
use crate::model::{OptionValue, RuleState};

const MISSING_DEPENDENCIES: &str = "Missing dependencies:";

const TOML_REPLACE: &str = "${helpers.tomlreplace} pyproject.toml build-system.requires \"[]\"";

const OFFLINE_CARGO: &[&str] = &[
    "you're using offline mode (--offline)",
    "Unable to update registry `crates-io`",
    "failed to get `",
];

const CARGO_LOCK: &str = "Cargo.lock";

// ---------------------------------------------------------------------------
// remove-build-system-pins
// ---------------------------------------------------------------------------

/// The build-system requirements pin versions that do not match the package
/// set. The requirements are dropped from `pyproject.toml`; the build systems
/// themselves come from the `build-systems` rule.
pub struct RemoveBuildSystemPins;

impl Rule for RemoveBuildSystemPins {
    fn name(&self) -> &'static str {
        "remove-build-system-pins"
    }

    fn matches(
        &self,
        _ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        _previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        let start = failure.log.find(MISSING_DEPENDENCIES)?;
        let rest = &failure.log[start..];
        let next_line = rest.lines().nth(1)?;
        (next_line.contains('<') || next_line.contains("==")).then_some(OptionValue::Bool(true))
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        match value {
            OptionValue::Bool(true) => Ok(vec![RuleEffect::Output(
                RuleOutput::default()
                    .argument("helpers")
                    .src(AttrKey::PostPatch, NixValue::string(TOML_REPLACE)),
            )]),
            OptionValue::Bool(false) => Ok(Vec::new()),
            other => Err(RuleError::UnexpectedValue {
                rule: self.name(),
                value: other.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// cargo-lock
// ---------------------------------------------------------------------------

/// Rust extensions try to reach crates.io from inside the sandbox. The
/// sdist's `Cargo.lock` is copied next to the override and used to vendor
/// the crates ahead of time.
pub struct CargoLock;

impl Rule for CargoLock {
    fn name(&self) -> &'static str {
        "cargo-lock"
    }

    fn matches(
        &self,
        ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        previous: Option<&OptionValue>,
        _state: &RuleState,
    ) -> Option<OptionValue> {
        if previous.is_some() {
            return previous.cloned();
        }
        if !OFFLINE_CARGO.iter().any(|needle| failure.log.contains(needle)) {
            return None;
        }
        match ctx.sources.read_file(&failure.drv, CARGO_LOCK) {
            Ok(Some(_)) => Some(OptionValue::Deferred(CARGO_LOCK.to_owned())),
            Ok(None) => {
                tracing::warn!(unit = %failure.unit, "cargo needs network, but the source ships no Cargo.lock");
                None
            }
            Err(e) => {
                tracing::warn!(unit = %failure.unit, error = %e, "could not look for Cargo.lock");
                None
            }
        }
    }

    fn apply(
        &self,
        _ctx: &RuleContext<'_>,
        value: &OptionValue,
    ) -> Result<Vec<RuleEffect>, RuleError> {
        let OptionValue::Deferred(file) = value else {
            return Err(RuleError::UnexpectedValue {
                rule: self.name(),
                value: value.clone(),
            });
        };
        let lock = NixValue::Path(file.clone());
        let cargo_deps = format!(
            "pkgs.rustPlatform.importCargoLock {{ lockFile = {}; }}",
            hammer_nix::render(&lock)
        );
        Ok(vec![RuleEffect::Output(
            RuleOutput::default()
                .argument("pkgs")
                .src(AttrKey::CargoDeps, NixValue::literal(cargo_deps))
                .src(
                    AttrKey::NativeBuildInputs,
                    NixValue::List(vec![
                        NixValue::literal("pkgs.cargo"),
                        NixValue::literal("pkgs.rustPlatform.cargoSetupHook"),
                        NixValue::literal("pkgs.rustc"),
                    ]),
                ),
        )])
    }

    fn extract(
        &self,
        ctx: &RuleContext<'_>,
        failure: &FailureRecord,
        value: &OptionValue,
        target: &std::path::Path,
    ) -> Result<(), RuleError> {
        let OptionValue::Deferred(file) = value else {
            return Ok(());
        };
        let bytes = ctx
            .sources
            .read_file(&failure.drv, file)
            .map_err(|source| RuleError::Backend {
                rule: self.name(),
                source,
            })?
            .ok_or_else(|| RuleError::Extract {
                rule: self.name(),
                file: file.clone(),
                detail: "not present in the source archive".to_owned(),
            })?;
        let dest = target.join(file);
        std::fs::create_dir_all(target)
            .and_then(|()| std::fs::write(&dest, bytes))
            .map_err(|e| RuleError::Extract {
                rule: self.name(),
                file: file.clone(),
                detail: format!("write {}: {e}", dest.display()),
            })?;
        tracing::info!(unit = %failure.unit, dest = %dest.display(), "extracted Cargo.lock");
        Ok(())
    }
}
