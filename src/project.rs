//! The scratch build project: `pyproject.toml` and `flake.nix`.
//!
//! The project depends on exactly one target release (plus any constraints
//! the rules asked for) and wires the override repository into uv2nix's
//! overlay, so `nix build` exercises the target and every dependency with
//! the overrides learned so far.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::backend::nix::OVERRIDES_INPUT;
use crate::version::{SpecifierSet, Version};

/// Files the build project consists of, as staged in git.
pub const PROJECT_FILES: &[&str] = &["flake.nix", "pyproject.toml", "uv.lock"];

/// Interpreters a downgrade may pick from, newest first.
const DOWNGRADE_CANDIDATES: &[PythonVersion] = &[
    PythonVersion::new(3, 13),
    PythonVersion::new(3, 12),
    PythonVersion::new(3, 11),
    PythonVersion::new(3, 10),
    PythonVersion::new(3, 9),
];

// ---------------------------------------------------------------------------
// PythonVersion
// ---------------------------------------------------------------------------

/// A CPython `major.minor` version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PythonVersion {
    major: u32,
    minor: u32,
}

impl PythonVersion {
    /// Construct from components.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse `"3.12"`. Anything else (including `"3.12.1"`) is `None`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let (major, minor) = text.trim().split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// nixpkgs attribute of the interpreter (`python312`).
    #[must_use]
    pub fn attr(self) -> String {
        format!("python{}{}", self.major, self.minor)
    }

    /// `requires-python` pinning the project to this minor release.
    #[must_use]
    pub fn requires_python(self) -> String {
        format!("=={}.{}.*", self.major, self.minor)
    }

    /// Newest interpreter older than `self` whose `.0` release satisfies
    /// `spec`, the `requires-python` of the package that refused `self`.
    #[must_use]
    pub fn downgrade_within(self, spec: &str) -> Option<Self> {
        let spec = SpecifierSet::parse(spec)?;
        DOWNGRADE_CANDIDATES
            .iter()
            .copied()
            .filter(|candidate| *candidate < self)
            .find(|candidate| {
                Version::parse(&format!("{candidate}.0")).is_some_and(|v| spec.contains(&v))
            })
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ---------------------------------------------------------------------------
// Source preference
// ---------------------------------------------------------------------------

/// Whether uv2nix should prefer prebuilt wheels or source distributions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourcePreference {
    /// Prefer wheels.
    #[default]
    Wheel,
    /// Prefer source distributions.
    Sdist,
}

impl SourcePreference {
    /// Value of uv2nix's `sourcePreference`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wheel => "wheel",
            Self::Sdist => "sdist",
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectSpec
// ---------------------------------------------------------------------------

/// Everything that goes into the generated project files.
#[derive(Clone, Debug)]
pub struct ProjectSpec {
    /// Target package, as the user spelled it.
    pub package: String,
    /// Target version.
    pub version: String,
    /// Interpreter version.
    pub python: PythonVersion,
    /// Wheel or sdist preference.
    pub preference: SourcePreference,
    /// nixpkgs flake reference in use.
    pub nixpkgs: String,
    /// uv2nix flake reference.
    pub uv2nix: String,
    /// Absolute path of the override repository checkout.
    pub overrides: PathBuf,
    /// Extra dependencies, name → specifier (empty specifier = unpinned).
    pub extra_dependencies: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct Pyproject<'a> {
    project: PyprojectProject<'a>,
}

#[derive(Serialize)]
struct PyprojectProject<'a> {
    name: &'a str,
    version: &'a str,
    description: String,
    #[serde(rename = "requires-python")]
    requires_python: String,
    dependencies: Vec<String>,
}

impl ProjectSpec {
    /// Render `pyproject.toml`.
    ///
    /// # Errors
    /// Serialization failure (not expected for these plain strings).
    pub fn pyproject_toml(&self) -> Result<String, toml::ser::Error> {
        let mut dependencies = vec![format!("{}=={}", self.package, self.version)];
        dependencies.extend(
            self.extra_dependencies
                .iter()
                .map(|(name, spec)| format!("{name}{spec}")),
        );
        toml::to_string(&Pyproject {
            project: PyprojectProject {
                name: "app",
                version: "0.1.0",
                description: format!("Learn to build {}", self.package),
                requires_python: self.python.requires_python(),
                dependencies,
            },
        })
    }

    /// Render `flake.nix`.
    #[must_use]
    pub fn flake_nix(&self) -> String {
        let q = |s: &str| hammer_nix::render_string(s, 0);
        let overrides = self.overrides.display().to_string();
        format!(
            r#"{{
  description = "uv2nix-hammer build project";
  inputs = {{
    nixpkgs.url = {nixpkgs};
    uv2nix.url = {uv2nix};
    uv2nix.inputs.nixpkgs.follows = "nixpkgs";
    {input}.url = {overrides};
    {input}.inputs.nixpkgs.follows = "nixpkgs";
  }};
  outputs = {{ nixpkgs, uv2nix, {input}, ... }}:
    let
      inherit (nixpkgs) lib;
      workspace = uv2nix.lib.workspace.loadWorkspace {{ workspaceRoot = ./.; }};
      overlay =
        let
          overlay' = workspace.mkOverlay {{ sourcePreference = {preference}; }};
          overrides = {input}.overrides;
        in
        lib.composeExtensions overlay' overrides;
      pkgs = import nixpkgs {{
        system = "x86_64-linux";
        config.allowUnfree = true;
      }};
      python = pkgs.{python}.override {{
        self = python;
        packageOverrides = overlay;
      }};
    in
    {{
      packages.x86_64-linux.default = python.pkgs.app;
    }};
}}
"#,
            nixpkgs = q(&self.nixpkgs),
            uv2nix = q(&self.uv2nix),
            input = OVERRIDES_INPUT,
            overrides = q(&overrides),
            preference = q(self.preference.as_str()),
            python = self.python.attr(),
        )
    }

    /// Write both files into `dir`.
    ///
    /// # Errors
    /// I/O failures writing the files.
    pub fn write(&self, dir: &Path) -> std::io::Result<()> {
        let pyproject = self
            .pyproject_toml()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        std::fs::write(dir.join("pyproject.toml"), pyproject)?;
        std::fs::write(dir.join("flake.nix"), self.flake_nix())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ProjectSpec {
        ProjectSpec {
            package: "Foo".into(),
            version: "1.2".into(),
            python: PythonVersion::new(3, 12),
            preference: SourcePreference::Sdist,
            nixpkgs: "github:nixos/nixpkgs/24.05".into(),
            uv2nix: "github:adisbladis/uv2nix".into(),
            overrides: PathBuf::from("/work/overrides"),
            extra_dependencies: BTreeMap::new(),
        }
    }

    #[test]
    fn python_version_parse_and_attr() {
        let py = PythonVersion::parse("3.12").unwrap();
        assert_eq!(py.attr(), "python312");
        assert_eq!(py.requires_python(), "==3.12.*");
        assert_eq!(py.to_string(), "3.12");
        assert!(PythonVersion::parse("3").is_none());
        assert!(PythonVersion::parse("3.12.1").is_none());
    }

    #[test]
    fn downgrade_picks_newest_allowed_older_python() {
        let py = PythonVersion::new(3, 12);
        assert_eq!(py.downgrade_within("<3.12,>=3.8"), Some(PythonVersion::new(3, 11)));
        assert_eq!(py.downgrade_within(">=3.9,<3.11"), Some(PythonVersion::new(3, 10)));
        assert_eq!(py.downgrade_within(">=3.12"), None);
        assert_eq!(py.downgrade_within("not a spec"), None);
    }

    #[test]
    fn pyproject_pins_target_and_extras() {
        let mut spec = spec();
        spec.extra_dependencies.insert("numpy".into(), "<2".into());
        spec.extra_dependencies.insert("tomli".into(), String::new());
        let text = spec.pyproject_toml().unwrap();
        let doc: toml::Value = toml::from_str(&text).unwrap();
        let project = &doc["project"];
        assert_eq!(project["name"].as_str(), Some("app"));
        assert_eq!(project["requires-python"].as_str(), Some("==3.12.*"));
        let deps: Vec<&str> = project["dependencies"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(toml::Value::as_str)
            .collect();
        assert_eq!(deps, ["Foo==1.2", "numpy<2", "tomli"]);
    }

    #[test]
    fn flake_wires_overrides_and_preference() {
        let text = spec().flake_nix();
        assert!(text.contains(r#"nixpkgs.url = "github:nixos/nixpkgs/24.05";"#));
        assert!(text.contains(r#"uv2nix_hammer_overrides.url = "/work/overrides";"#));
        assert!(text.contains(r#"sourcePreference = "sdist";"#));
        assert!(text.contains("python = pkgs.python312.override"));
        hammer_nix::check_syntax(&text).unwrap();
    }

    #[test]
    fn write_creates_both_files() {
        let dir = tempfile::tempdir().unwrap();
        spec().write(dir.path()).unwrap();
        assert!(dir.path().join("pyproject.toml").is_file());
        assert!(dir.path().join("flake.nix").is_file());
    }
}
