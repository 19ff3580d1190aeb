//! Unit identity: one (package, version) build goal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A normalized package name.
///
/// Lowercase, with every run of `-`, `_` and `.` collapsed to a single `-`
/// (the PyPI normalization). `Zope.Interface` and `zope_interface` are the
/// same package.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    /// Normalize a raw package name.
    #[must_use]
    pub fn new(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len());
        let mut in_separator = false;
        for c in raw.trim().chars() {
            if matches!(c, '-' | '_' | '.') {
                in_separator = true;
                continue;
            }
            if in_separator && !out.is_empty() {
                out.push('-');
            }
            in_separator = false;
            out.extend(c.to_lowercase());
        }
        Self(out)
    }

    /// The normalized name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PackageName {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl From<&str> for PackageName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<PackageName> for String {
    fn from(name: PackageName) -> Self {
        name.0
    }
}

/// One build goal: a normalized package name plus its version.
///
/// Addresses exactly one override directory
/// (`overrides/<name>/<version>/`) and stays stable across runs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId {
    /// Normalized package name.
    pub name: PackageName,
    /// Version string, lowercased.
    pub version: String,
}

impl UnitId {
    /// Build a unit identity from raw parts.
    #[must_use]
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: PackageName::new(name),
            version: version.trim().to_lowercase(),
        }
    }

    /// Recover the unit from a derivation path.
    ///
    /// Store names look like `<hash>-python3.12-<pkg>-<version>.drv`; the
    /// interpreter prefix is optional. Returns `None` when the name has too
    /// few segments to contain both a package and a version.
    #[must_use]
    pub fn from_drv(drv: &str) -> Option<Self> {
        let file = drv.rsplit('/').next()?;
        let stem = file.strip_suffix(".drv").unwrap_or(file);
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() < 3 {
            return None;
        }
        let version = parts[parts.len() - 1];
        let skip = if is_interpreter_segment(parts[1]) { 2 } else { 1 };
        if parts.len() <= skip + 1 {
            return None;
        }
        let name = parts[skip..parts.len() - 1].join("-");
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(&name, version))
    }
}

fn is_interpreter_segment(segment: &str) -> bool {
    ["python", "pypy"].iter().any(|prefix| {
        segment
            .strip_prefix(prefix)
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_digit())
    })
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=={}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_names() {
        assert_eq!(PackageName::new("Zope.Interface").as_str(), "zope-interface");
        assert_eq!(PackageName::new("ruamel__yaml").as_str(), "ruamel-yaml");
        assert_eq!(PackageName::new("  NumPy ").as_str(), "numpy");
        assert_eq!(PackageName::new("_private").as_str(), "private");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = PackageName::new("Foo._-Bar");
        assert_eq!(PackageName::new(once.as_str()), once);
    }

    #[test]
    fn unit_from_drv_with_interpreter_prefix() {
        let unit =
            UnitId::from_drv("/nix/store/0abc123-python3.12-scikit-learn-1.5.0.drv").unwrap();
        assert_eq!(unit, UnitId::new("scikit-learn", "1.5.0"));
    }

    #[test]
    fn unit_from_drv_without_prefix() {
        let unit = UnitId::from_drv("/nix/store/0abc123-pillow-10.4.0.drv").unwrap();
        assert_eq!(unit, UnitId::new("pillow", "10.4.0"));
    }

    #[test]
    fn unit_from_drv_rejects_short_names() {
        assert_eq!(UnitId::from_drv("/nix/store/0abc-foo.drv"), None);
        assert_eq!(UnitId::from_drv("/nix/store/0abc-python3.12-1.0.drv"), None);
    }

    #[test]
    fn display() {
        assert_eq!(UnitId::new("NumPy", "2.0.1").to_string(), "numpy==2.0.1");
    }
}
