//! Run-level error type.
//!
//! [`HammerError`] is what stops a hammer run. Each variant carries the
//! context needed to understand the failure without re-running, and its
//! message ends with actionable guidance.
//!
//! Ordinary "no rule matched" outcomes are never errors; the orchestrator
//! reports them as [`crate::orchestrator::RunOutcome`] values instead.

use std::fmt;
use std::path::PathBuf;

use crate::backend::BackendError;
use crate::index::IndexError;
use crate::merge::MergeError;
use crate::model::{StateError, UnitId};
use crate::orchestrator::cycle::LockGraphError;
use crate::repo::RepoError;

// ---------------------------------------------------------------------------
// HammerError
// ---------------------------------------------------------------------------

/// Fatal conditions for a hammer run.
#[derive(Debug)]
pub enum HammerError {
    /// `hammer.toml` could not be loaded.
    Config {
        /// Config file path.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// A unit's persisted rule state is unreadable.
    State(StateError),

    /// The override repository could not be read, written or locked.
    Repo(RepoError),

    /// A unit's decisions could not be merged into one artifact.
    Merge {
        /// The unit being merged.
        unit: UnitId,
        /// What went wrong.
        source: MergeError,
    },

    /// Two units asked for different constraints on one project dependency.
    ConstraintConflict {
        /// Constrained dependency.
        dependency: String,
        /// Unit whose constraint was applied first.
        first_unit: UnitId,
        /// Its specifier.
        first: String,
        /// Unit that disagreed.
        second_unit: UnitId,
        /// Its specifier.
        second: String,
    },

    /// The build tool rejected the generated overrides.
    InvalidOverrideSyntax {
        /// The offending line of build output.
        line: String,
        /// Log of the attempt.
        log: PathBuf,
    },

    /// The build tool reported infinite recursion, but the lock graph has
    /// no cycle.
    CycleNotFound {
        /// The lock file that was searched.
        lock: PathBuf,
    },

    /// Infinite recursion was reported after the first attempt.
    RecursionPersists {
        /// Attempt number.
        attempt: u32,
        /// Log of the attempt.
        log: PathBuf,
    },

    /// A package refused the project's Python and no older interpreter
    /// satisfies it.
    NoCompatiblePython {
        /// The interpreter in use.
        current: String,
        /// The package's `requires-python`.
        spec: String,
    },

    /// The lock graph could not be read.
    LockGraph(LockGraphError),

    /// An external tool failed.
    Tool(BackendError),

    /// The package index could not answer.
    Index(IndexError),

    /// The requested release does not exist on the index.
    UnknownRelease {
        /// Package name.
        package: String,
        /// Requested version.
        version: String,
    },

    /// An I/O error outside the override repository.
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for HammerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { path, detail } => write!(
                f,
                "configuration error in '{}': {detail}\n  To fix: edit the config file and correct the issue.",
                path.display()
            ),
            Self::State(err) => write!(
                f,
                "{err}\n  To fix: repair or delete the rules.toml file; deleting it forgets what was learned for that package."
            ),
            Self::Repo(err) => write!(
                f,
                "override repository: {err}\n  To fix: check the checkout, permissions and that no other hammer run uses it."
            ),
            Self::Merge { unit, source } => write!(f, "cannot merge overrides for {unit}: {source}"),
            Self::ConstraintConflict {
                dependency,
                first_unit,
                first,
                second_unit,
                second,
            } => write!(
                f,
                "conflicting project constraints for '{dependency}': \
                 {first_unit} wants {dependency}{first}, {second_unit} wants {dependency}{second}\n  \
                 To fix: remove one decision from the packages' rules.toml files and rerun."
            ),
            Self::InvalidOverrideSyntax { line, log } => write!(
                f,
                "the build tool could not evaluate the generated overrides: {line}\n  Full output: {}\n  To fix: inspect the default.nix named in the log; a rule rendered invalid code.",
                log.display()
            ),
            Self::CycleNotFound { lock } => write!(
                f,
                "infinite recursion was reported but {} contains no dependency cycle\n  To fix: inspect the build log; the recursion comes from the overrides, not the lock graph.",
                lock.display()
            ),
            Self::RecursionPersists { attempt, log } => write!(
                f,
                "infinite recursion persists on attempt {attempt}\n  Full output: {}\n  To fix: break the cycle by hand with a manual override.",
                log.display()
            ),
            Self::NoCompatiblePython { current, spec } => write!(
                f,
                "a dependency requires Python '{spec}', and no interpreter older than {current} satisfies it\n  To fix: rerun with --python set to a supported version."
            ),
            Self::LockGraph(err) => write!(
                f,
                "lock graph: {err}\n  To fix: regenerate the lock with `uv lock` in the build directory."
            ),
            Self::Tool(err) => write!(
                f,
                "{err}\n  To fix: make sure nix, uv, git, tar and unzip are on PATH and work outside the hammer."
            ),
            Self::Index(err) => write!(
                f,
                "{err}\n  To fix: check the package name and network access, or pass an explicit version."
            ),
            Self::UnknownRelease { package, version } => write!(
                f,
                "{package} has no release {version}\n  To fix: pick a version listed on the package index, or omit it to use the newest."
            ),
            Self::Io { context, source } => write!(
                f,
                "{context}: {source}\n  To fix: check file permissions and disk space."
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error
// ---------------------------------------------------------------------------

impl std::error::Error for HammerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::State(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Merge { source, .. } => Some(source),
            Self::LockGraph(err) => Some(err),
            Self::Tool(err) => Some(err),
            Self::Index(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<crate::config::ConfigError> for HammerError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config {
            path: err.path.unwrap_or_default(),
            detail: err.message,
        }
    }
}

impl From<StateError> for HammerError {
    fn from(err: StateError) -> Self {
        Self::State(err)
    }
}

impl From<RepoError> for HammerError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::State(state) => Self::State(state),
            other => Self::Repo(other),
        }
    }
}

impl From<LockGraphError> for HammerError {
    fn from(err: LockGraphError) -> Self {
        Self::LockGraph(err)
    }
}

impl From<BackendError> for HammerError {
    fn from(err: BackendError) -> Self {
        Self::Tool(err)
    }
}

impl From<IndexError> for HammerError {
    fn from(err: IndexError) -> Self {
        Self::Index(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
