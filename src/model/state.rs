//! Per-unit rule state: rule name → last decision.
//!
//! Persisted as `overrides/<pkg>/<version>/rules.toml`. The state file is the
//! durable record of what was learned about a package; the generated
//! `default.nix` is always re-derivable from it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::option::OptionValue;
use super::unit::UnitId;

/// Current on-disk schema version of `rules.toml`.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Decisions of every rule that has matched a unit so far.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleState {
    rules: BTreeMap<String, OptionValue>,
}

impl RuleState {
    /// An empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// This rule's current decision, if any.
    #[must_use]
    pub fn get(&self, rule: &str) -> Option<&OptionValue> {
        self.rules.get(rule)
    }

    /// Record a decision, returning the previous one.
    pub fn insert(&mut self, rule: impl Into<String>, value: OptionValue) -> Option<OptionValue> {
        self.rules.insert(rule.into(), value)
    }

    /// Forget a rule's decision.
    pub fn remove(&mut self, rule: &str) -> Option<OptionValue> {
        self.rules.remove(rule)
    }

    /// Iterate decisions in rule-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of recorded decisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// `true` if no rule has decided anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// SHA-256 over the canonical JSON form of the state.
    ///
    /// Keys are sorted (`BTreeMap`), so equal states always hash equally.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(&self.rules).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl FromIterator<(String, OptionValue)> for RuleState {
    fn from_iter<T: IntoIterator<Item = (String, OptionValue)>>(iter: T) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// RuleStateFile
// ---------------------------------------------------------------------------

/// The persisted `rules.toml` document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleStateFile {
    /// Schema version (currently [`STATE_SCHEMA_VERSION`]).
    pub schema_version: u32,
    /// Normalized package name.
    pub package: String,
    /// Package version.
    pub version: String,
    /// The decisions.
    #[serde(default)]
    pub rules: RuleState,
}

/// Error reading or decoding a persisted state file.
#[derive(Debug)]
pub enum StateError {
    /// The file could not be read.
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file exists but is not a valid state document.
    Malformed {
        /// File that was being parsed.
        path: PathBuf,
        /// Parser message.
        detail: String,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "read {}: {source}", path.display()),
            Self::Malformed { path, detail } => {
                write!(f, "malformed rule state {}: {detail}", path.display())
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Malformed { .. } => None,
        }
    }
}

impl RuleStateFile {
    /// Wrap a state for `unit`.
    #[must_use]
    pub fn new(unit: &UnitId, rules: RuleState) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            package: unit.name.to_string(),
            version: unit.version.clone(),
            rules,
        }
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    /// Returns the serializer message if the state cannot be expressed in
    /// TOML (which would indicate a bug in a rule's option shape).
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    /// Parse a state document.
    ///
    /// # Errors
    /// Returns [`StateError::Malformed`] on invalid TOML, unknown fields or
    /// an unsupported schema version.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, StateError> {
        let file: Self = toml::from_str(text).map_err(|e| StateError::Malformed {
            path: path.to_owned(),
            detail: e.message().to_owned(),
        })?;
        if file.schema_version != STATE_SCHEMA_VERSION {
            return Err(StateError::Malformed {
                path: path.to_owned(),
                detail: format!(
                    "unsupported schema_version {} (expected {STATE_SCHEMA_VERSION})",
                    file.schema_version
                ),
            });
        }
        Ok(file)
    }

    /// Load the state for `unit` from `path`. A missing file is an empty state.
    ///
    /// # Errors
    /// Returns [`StateError`] on read failures or malformed content.
    pub fn load(path: &Path, unit: &UnitId) -> Result<Self, StateError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::new(unit, RuleState::new()))
            }
            Err(source) => Err(StateError::Io {
                path: path.to_owned(),
                source,
            }),
        }
    }
}
