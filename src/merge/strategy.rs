//! Per-key merge strategy table.
//!
//! Every attribute a rule may write is an [`AttrKey`] variant, and
//! [`AttrKey::strategy`] is an exhaustive `match`, so adding a key without
//! deciding how it merges does not compile.

use std::fmt;

/// How contributions from several rules to one key are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Set union, sorted; rendered against the base value as described by
    /// the [`ListCompose`] mode.
    Union(ListCompose),
    /// Textual hooks appended in encounter order, each composed onto the
    /// base value (`(old.<key> or "") + ...`).
    Append,
    /// The first rule to write the key wins; a different second value is a
    /// hard merge error.
    FirstWriter,
}

/// How a unioned list combines with the base package's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListCompose {
    /// `(old.<key> or []) ++ [ ... ]`
    Extend,
    /// Drop base entries whose `pname` is in the list.
    Remove,
}

/// Attributes of the build recipe that rules can contribute to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttrKey {
    /// Tools needed at build time.
    NativeBuildInputs,
    /// Libraries linked into the package.
    BuildInputs,
    /// Runtime dependencies propagated to dependents (removal only).
    PropagatedBuildInputs,
    /// Shell run after unpacking and patching sources.
    PostPatch,
    /// Shell run before the configure phase.
    PreConfigure,
    /// Shell run before the build phase.
    PreBuild,
    /// Shell run after installation.
    PostInstall,
    /// Environment variables for the builder.
    Env,
    /// Suppress the cmake setup hook's configure step.
    DontUseCmakeConfigure,
    /// Vendored cargo dependencies for Rust extensions.
    CargoDeps,
}

impl AttrKey {
    /// Every key, in rendering order.
    pub const ALL: [Self; 10] = [
        Self::NativeBuildInputs,
        Self::BuildInputs,
        Self::PropagatedBuildInputs,
        Self::PostPatch,
        Self::PreConfigure,
        Self::PreBuild,
        Self::PostInstall,
        Self::Env,
        Self::DontUseCmakeConfigure,
        Self::CargoDeps,
    ];

    /// The merge strategy for this key.
    #[must_use]
    pub const fn strategy(self) -> MergeStrategy {
        match self {
            Self::NativeBuildInputs | Self::BuildInputs => MergeStrategy::Union(ListCompose::Extend),
            Self::PropagatedBuildInputs => MergeStrategy::Union(ListCompose::Remove),
            Self::PostPatch | Self::PreConfigure | Self::PreBuild | Self::PostInstall => {
                MergeStrategy::Append
            }
            Self::Env | Self::DontUseCmakeConfigure | Self::CargoDeps => MergeStrategy::FirstWriter,
        }
    }

    /// The attribute name in the generated Nix.
    #[must_use]
    pub const fn nix_name(self) -> &'static str {
        match self {
            Self::NativeBuildInputs => "nativeBuildInputs",
            Self::BuildInputs => "buildInputs",
            Self::PropagatedBuildInputs => "propagatedBuildInputs",
            Self::PostPatch => "postPatch",
            Self::PreConfigure => "preConfigure",
            Self::PreBuild => "preBuild",
            Self::PostInstall => "postInstall",
            Self::Env => "env",
            Self::DontUseCmakeConfigure => "dontUseCmakeConfigure",
            Self::CargoDeps => "cargoDeps",
        }
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nix_name())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn nix_names_are_unique() {
        let names: HashSet<_> = AttrKey::ALL.iter().map(|k| k.nix_name()).collect();
        assert_eq!(names.len(), AttrKey::ALL.len());
    }

    #[test]
    fn strategy_table() {
        assert_eq!(
            AttrKey::NativeBuildInputs.strategy(),
            MergeStrategy::Union(ListCompose::Extend)
        );
        assert_eq!(
            AttrKey::PropagatedBuildInputs.strategy(),
            MergeStrategy::Union(ListCompose::Remove)
        );
        assert_eq!(AttrKey::PostPatch.strategy(), MergeStrategy::Append);
        assert_eq!(AttrKey::Env.strategy(), MergeStrategy::FirstWriter);
    }
}
