//! Hammer configuration (`hammer.toml`).
//!
//! Defines the typed configuration for a hammer run: build inputs (flake
//! URLs, Python version, attempt bound), the override repository, and the
//! package index. Every field has a default, so the file is optional.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level hammer configuration.
///
/// Missing fields use defaults. Missing file → all defaults (no error).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HammerConfig {
    /// Build project settings.
    #[serde(default)]
    pub build: BuildConfig,

    /// Override repository settings.
    #[serde(default)]
    pub overrides: OverridesConfig,

    /// Package index settings.
    #[serde(default)]
    pub index: IndexConfig,
}

// ---------------------------------------------------------------------------
// [build]
// ---------------------------------------------------------------------------

/// `[build]` section.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Maximum number of build attempts per run.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Python version of the build project (`major.minor`).
    #[serde(default = "default_python")]
    pub python: String,

    /// Package snapshot used by default.
    #[serde(default = "default_nixpkgs")]
    pub nixpkgs: String,

    /// Newer package snapshot, used once a rule asks for it.
    #[serde(default = "default_nixpkgs_newer")]
    pub nixpkgs_newer: String,

    /// uv2nix flake reference.
    #[serde(default = "default_uv2nix")]
    pub uv2nix: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            python: default_python(),
            nixpkgs: default_nixpkgs(),
            nixpkgs_newer: default_nixpkgs_newer(),
            uv2nix: default_uv2nix(),
        }
    }
}

const fn default_max_attempts() -> u32 {
    10
}

fn default_python() -> String {
    "3.12".to_owned()
}

fn default_nixpkgs() -> String {
    "github:nixos/nixpkgs/24.05".to_owned()
}

fn default_nixpkgs_newer() -> String {
    "github:nixos/nixpkgs/nixos-unstable".to_owned()
}

fn default_uv2nix() -> String {
    "github:adisbladis/uv2nix".to_owned()
}

// ---------------------------------------------------------------------------
// [overrides]
// ---------------------------------------------------------------------------

/// `[overrides]` section.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverridesConfig {
    /// Git URL (or local path) of the override repository to clone.
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Directory of hand-written overrides (`<pkg>/<version>/default.nix`).
    #[serde(default)]
    pub manual_root: Option<PathBuf>,
}

impl Default for OverridesConfig {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            manual_root: None,
        }
    }
}

fn default_repository() -> String {
    "https://github.com/TyberiusPrime/uv2nix_hammer_overrides".to_owned()
}

// ---------------------------------------------------------------------------
// [index]
// ---------------------------------------------------------------------------

/// `[index]` section.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Base URL of the JSON API (`<url>/<pkg>/json`).
    #[serde(default = "default_index_url")]
    pub url: String,

    /// How long a cached index response stays fresh.
    #[serde(default = "default_cache_hours")]
    pub cache_hours: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: default_index_url(),
            cache_hours: default_cache_hours(),
        }
    }
}

fn default_index_url() -> String {
    "https://pypi.org/pypi".to_owned()
}

const fn default_cache_hours() -> u32 {
    24
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a hammer configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl HammerConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields, or values that
    /// make no sense (zero attempts, malformed Python version).
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError {
            path: None,
            message,
        };
        if self.build.max_attempts == 0 {
            return Err(invalid("build.max_attempts must be at least 1".to_owned()));
        }
        if crate::project::PythonVersion::parse(&self.build.python).is_none() {
            return Err(invalid(format!(
                "build.python must look like \"3.12\", got {:?}",
                self.build.python
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
