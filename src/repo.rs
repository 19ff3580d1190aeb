//! The override repository on disk.
//!
//! ```text
//! <root>/
//!   collected.nix                 # pkg -> version -> import ./overrides/pkg/version
//!   overrides/<pkg>/<version>/
//!     default.nix                 # generated artifact
//!     rules.toml                  # persisted rule state
//!     ...                         # extracted / copied auxiliary files
//! ```
//!
//! State and artifact are written through a temp file in the same directory
//! and renamed into place, so an interrupted run leaves either the old or the
//! new version of each file.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use hammer_nix::NixValue;

use crate::merge::artifact::CLEARED;
use crate::model::{RuleState, RuleStateFile, StateError, UnitId};
use crate::rules::CopyRequest;

const ARTIFACT: &str = "default.nix";
const STATE: &str = "rules.toml";
const COLLECTED: &str = "collected.nix";
const LOCK: &str = ".hammer.lock";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures touching the override repository.
#[derive(Debug)]
pub enum RepoError {
    /// A file operation failed.
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Another run holds the repository lock.
    Locked {
        /// The lock file.
        path: PathBuf,
    },
    /// A persisted rule state is unreadable.
    State(StateError),
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Locked { path } => write!(
                f,
                "override repository is locked by another run ({})",
                path.display()
            ),
            Self::State(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RepoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::State(e) => Some(e),
            Self::Locked { .. } => None,
        }
    }
}

impl From<StateError> for RepoError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RepoError + '_ {
    move |source| RepoError::Io {
        path: path.to_owned(),
        source,
    }
}

// ---------------------------------------------------------------------------
// OverrideRepo
// ---------------------------------------------------------------------------

/// Exclusive lock on the repository, released on drop.
#[derive(Debug)]
pub struct RepoLock {
    _file: File,
}

/// A checked-out override repository.
#[derive(Clone, Debug)]
pub struct OverrideRepo {
    root: PathBuf,
}

impl OverrideRepo {
    /// Wrap the checkout at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Repository root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one unit's files.
    #[must_use]
    pub fn unit_dir(&self, unit: &UnitId) -> PathBuf {
        self.root
            .join("overrides")
            .join(unit.name.as_str())
            .join(&unit.version)
    }

    /// Take the exclusive repository lock without blocking.
    ///
    /// # Errors
    /// [`RepoError::Locked`] when another process holds it.
    pub fn lock(&self) -> Result<RepoLock, RepoError> {
        let path = self.root.join(LOCK);
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err(&path))?;
        if FileExt::try_lock_exclusive(&file).is_err() {
            return Err(RepoError::Locked { path });
        }
        tracing::debug!(path = %path.display(), "override repository locked");
        Ok(RepoLock { _file: file })
    }

    /// Persisted rule state of `unit` (empty when never written).
    ///
    /// # Errors
    /// Unreadable or malformed state file.
    pub fn load_state(&self, unit: &UnitId) -> Result<RuleState, RepoError> {
        let path = self.unit_dir(unit).join(STATE);
        Ok(RuleStateFile::load(&path, unit)?.rules)
    }

    /// The artifact currently on disk, if any.
    #[must_use]
    pub fn read_artifact(&self, unit: &UnitId) -> Option<String> {
        std::fs::read_to_string(self.unit_dir(unit).join(ARTIFACT)).ok()
    }

    /// Units that have a persisted state file, sorted.
    ///
    /// # Errors
    /// Unreadable directory entries.
    pub fn units(&self) -> Result<Vec<UnitId>, RepoError> {
        let pattern = self.root.join("overrides").join("*").join("*").join(STATE);
        let mut units = Vec::new();
        for entry in glob::glob(&pattern.to_string_lossy()).into_iter().flatten() {
            let path = entry.map_err(|e| RepoError::Io {
                path: e.path().to_owned(),
                source: e.into_error(),
            })?;
            let Some(dir) = path.parent() else { continue };
            let (Some(version), Some(name)) = (
                dir.file_name().and_then(|n| n.to_str()),
                dir.parent()
                    .and_then(Path::file_name)
                    .and_then(|n| n.to_str()),
            ) else {
                continue;
            };
            units.push(UnitId::new(name, version));
        }
        units.sort();
        units.dedup();
        Ok(units)
    }

    /// Persist `state` and the matching artifact.
    ///
    /// `None` removes a stale artifact instead of writing an empty one.
    ///
    /// # Errors
    /// Any file-system failure.
    pub fn write_unit(
        &self,
        unit: &UnitId,
        state: &RuleState,
        artifact: Option<&str>,
    ) -> Result<(), RepoError> {
        let dir = self.unit_dir(unit);
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let file = RuleStateFile::new(unit, state.clone());
        let text = file.to_toml().map_err(|detail| RepoError::Io {
            path: dir.join(STATE),
            source: std::io::Error::other(detail),
        })?;
        write_atomic(&dir.join(STATE), &text)?;
        let artifact_path = dir.join(ARTIFACT);
        match artifact {
            Some(text) => write_atomic(&artifact_path, text)?,
            None if artifact_path.exists() => {
                std::fs::remove_file(&artifact_path).map_err(io_err(&artifact_path))?;
            }
            None => {}
        }
        Ok(())
    }

    /// Reset `unit` to "no overrides": a no-op artifact and an empty state.
    ///
    /// # Errors
    /// Any file-system failure.
    pub fn clear(&self, unit: &UnitId) -> Result<(), RepoError> {
        tracing::info!(%unit, "clearing previous overrides");
        self.write_unit(unit, &RuleState::new(), Some(CLEARED))
    }

    /// Copy a file or directory tree next to the unit's artifact.
    ///
    /// # Errors
    /// Any file-system failure.
    pub fn copy_into(&self, unit: &UnitId, request: &CopyRequest) -> Result<(), RepoError> {
        let dest = self.unit_dir(unit).join(&request.into);
        if dest.exists() {
            let remove = if dest.is_dir() {
                std::fs::remove_dir_all(&dest)
            } else {
                std::fs::remove_file(&dest)
            };
            remove.map_err(io_err(&dest))?;
        }
        copy_tree(&request.from, &dest)
    }

    /// Rewrite `collected.nix` from the artifacts on disk.
    ///
    /// # Errors
    /// Unreadable directories or a failed write.
    pub fn write_collected(&self) -> Result<(), RepoError> {
        let mut by_package: BTreeMap<String, NixValue> = BTreeMap::new();
        let pattern = self.root.join("overrides").join("*").join("*").join(ARTIFACT);
        for entry in glob::glob(&pattern.to_string_lossy()).into_iter().flatten() {
            let path = entry.map_err(|e| RepoError::Io {
                path: e.path().to_owned(),
                source: e.into_error(),
            })?;
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let parts: Vec<String> = relative
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            let [_, package, version, _] = parts.as_slice() else {
                continue;
            };
            let versions = by_package
                .entry(package.clone())
                .or_insert_with(|| NixValue::Attrs(BTreeMap::new()));
            if let NixValue::Attrs(map) = versions {
                map.insert(
                    version.clone(),
                    NixValue::literal(format!("import ./overrides/{package}/{version}")),
                );
            }
        }
        let text = format!(
            "# Generated by uv2nix-hammer. Edits are overwritten.\n{}\n",
            hammer_nix::render(&NixValue::Attrs(by_package))
        );
        write_atomic(&self.root.join(COLLECTED), &text)
    }
}

/// Write `text` to `path` via a sibling temp file and a rename.
fn write_atomic(path: &Path, text: &str) -> Result<(), RepoError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(path))?;
    tmp.write_all(text.as_bytes()).map_err(io_err(path))?;
    tmp.persist(path).map_err(|e| RepoError::Io {
        path: path.to_owned(),
        source: e.error,
    })?;
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), RepoError> {
    if from.is_dir() {
        std::fs::create_dir_all(to).map_err(io_err(to))?;
        let entries = std::fs::read_dir(from).map_err(io_err(from))?;
        for entry in entries {
            let entry = entry.map_err(io_err(from))?;
            copy_tree(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        std::fs::copy(from, to).map_err(io_err(from))?;
    }
    Ok(())
}
