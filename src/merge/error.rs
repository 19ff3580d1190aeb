//! Merge errors.
//!
//! Every conflict carries both values and the rules that produced them, so
//! the report is enough to write a merge strategy or fix a rule.

use std::fmt;

use hammer_nix::NixError;

use super::strategy::AttrKey;
use crate::rules::RuleError;

/// Which build of a package an attribute fragment targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Destination {
    /// Built from an sdist.
    Source,
    /// Installed from a prebuilt wheel.
    Wheel,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Wheel => f.write_str("wheel"),
        }
    }
}

/// Why a unit's rule state could not be merged into an artifact.
#[derive(Debug)]
pub enum MergeError {
    /// A rule declared the unit unbuildable. Terminal for the unit, not for
    /// the run.
    Excluded {
        /// Rule that excluded it.
        rule: &'static str,
        /// Its reason.
        reason: String,
    },
    /// Two rules wrote different values to a first-writer key.
    KeyConflict {
        /// Contested key.
        key: AttrKey,
        /// Source or wheel build.
        destination: Destination,
        /// Rule that wrote first.
        first_rule: &'static str,
        /// Its value, rendered.
        first: String,
        /// Rule that disagreed.
        second_rule: &'static str,
        /// Its value, rendered.
        second: String,
    },
    /// Two rules constrained one dependency differently.
    ConstraintConflict {
        /// Constrained dependency.
        dependency: String,
        /// Rule that constrained first.
        first_rule: &'static str,
        /// Its specifier.
        first: String,
        /// Rule that disagreed.
        second_rule: &'static str,
        /// Its specifier.
        second: String,
    },
    /// Two rules asked for different runtime downgrades.
    DowngradeConflict {
        /// Rule that asked first.
        first_rule: &'static str,
        /// Its version.
        first: String,
        /// Rule that disagreed.
        second_rule: &'static str,
        /// Its version.
        second: String,
    },
    /// The persisted state names a rule that does not exist.
    UnknownRule {
        /// The name found in the state file.
        name: String,
    },
    /// A rule could not render its decision.
    Rule(RuleError),
    /// The rendered artifact is not valid Nix.
    InvalidSyntax {
        /// Lexer error.
        source: NixError,
        /// The rejected text.
        text: String,
    },
}

impl MergeError {
    /// `true` for the terminal-for-unit exclusion; everything else aborts
    /// the run.
    #[must_use]
    pub const fn is_exclusion(&self) -> bool {
        matches!(self, Self::Excluded { .. })
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excluded { rule, reason } => {
                write!(f, "excluded by rule '{rule}': {reason}")
            }
            Self::KeyConflict {
                key,
                destination,
                first_rule,
                first,
                second_rule,
                second,
            } => write!(
                f,
                "conflicting values for '{key}' ({destination} build): \
                 rule '{first_rule}' wrote {first}, rule '{second_rule}' wrote {second}\n  \
                 To fix: give '{key}' a merge strategy, or make one of the rules stop writing it."
            ),
            Self::ConstraintConflict {
                dependency,
                first_rule,
                first,
                second_rule,
                second,
            } => write!(
                f,
                "conflicting constraints for dependency '{dependency}': \
                 rule '{first_rule}' wants {dependency}{first}, \
                 rule '{second_rule}' wants {dependency}{second}\n  \
                 To fix: remove one decision from the package's rules.toml and rerun with --rewrite-only."
            ),
            Self::DowngradeConflict {
                first_rule,
                first,
                second_rule,
                second,
            } => write!(
                f,
                "conflicting Python downgrades: rule '{first_rule}' wants {first}, \
                 rule '{second_rule}' wants {second}\n  \
                 To fix: remove one decision from the package's rules.toml and rerun with --rewrite-only."
            ),
            Self::UnknownRule { name } => write!(
                f,
                "rule state refers to unknown rule '{name}'\n  \
                 To fix: delete the '{name}' entry from rules.toml."
            ),
            Self::Rule(e) => write!(f, "{e}"),
            Self::InvalidSyntax { source, text } => write!(
                f,
                "generated override is not valid Nix: {source}\n--- generated ---\n{text}\n---"
            ),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rule(e) => Some(e),
            Self::InvalidSyntax { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<RuleError> for MergeError {
    fn from(e: RuleError) -> Self {
        Self::Rule(e)
    }
}
