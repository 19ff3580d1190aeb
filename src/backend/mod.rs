//! External collaborators, specified at their interface boundary.
//!
//! The orchestrator never shells out directly. It talks to:
//!
//! - a [`BuildTool`]: resolves the project lock, runs the sandboxed build
//!   and answers per-derivation lookups (log, source archive);
//! - a [`Vcs`]: stages and commits in the override repository and project;
//! - a [`SourceInspector`]: reads files out of a derivation's source
//!   archive (bounded, cached lookups used by rules).
//!
//! [`nix`], [`git`] and [`archive`] hold the command-line implementations.
//! Tests substitute scripted fakes.

pub mod archive;
pub mod git;
pub mod nix;

pub use archive::ArchiveInspector;
pub use git::GitCli;
pub use nix::{NixCli, OVERRIDES_INPUT};

use std::fmt;
use std::path::Path;
use std::process::Output;

/// Result of one build invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildRun {
    /// Captured stderr of the build tool.
    pub stderr: String,
    /// Whether the success marker (the `result` link) exists afterwards.
    pub succeeded: bool,
}

/// The declarative build tool, as a black box.
#[allow(clippy::missing_errors_doc)]
pub trait BuildTool {
    /// Resolve the project's dependency lock (e.g. `uv lock`).
    fn lock_project(&self, project: &Path) -> Result<(), BackendError>;

    /// Refresh the project's pinned copy of the override repository.
    fn refresh_overrides_input(&self, project: &Path) -> Result<(), BackendError>;

    /// Build the project, streaming stderr to `log_path`.
    ///
    /// A failing build is not an error: it is reported through
    /// [`BuildRun::succeeded`] and the captured stderr.
    fn build(&self, project: &Path, log_path: &Path) -> Result<BuildRun, BackendError>;

    /// Fetch the build log of one derivation.
    fn derivation_log(&self, drv: &str) -> Result<String, BackendError>;

    /// Store path of one derivation's source (`src` attribute).
    fn derivation_source(&self, drv: &str) -> Result<String, BackendError>;
}

/// Version control used for the override repository and the build project.
#[allow(clippy::missing_errors_doc)]
pub trait Vcs {
    /// Clone `url` into `dir` and switch to a fresh `branch`.
    fn clone_branch(&self, url: &str, dir: &Path, branch: &str) -> Result<(), BackendError>;

    /// Initialize a repository in `dir` if there is none.
    fn ensure_repo(&self, dir: &Path) -> Result<(), BackendError>;

    /// Stage paths (relative to `dir`). An empty slice stages everything.
    fn stage(&self, dir: &Path, paths: &[&str]) -> Result<(), BackendError>;

    /// Commit staged changes.
    fn commit(&self, dir: &Path, message: &str) -> Result<(), BackendError>;
}

/// Read-only access to the contents of a derivation's source archive.
#[allow(clippy::missing_errors_doc)]
pub trait SourceInspector {
    /// `build-system.requires` from the source's top-most `pyproject.toml`.
    ///
    /// `Ok(None)` when the source is a wheel or has no `pyproject.toml`.
    fn build_requires(&self, drv: &str) -> Result<Option<Vec<String>>, BackendError>;

    /// Raw bytes of the shallowest file called `name` in the archive.
    fn read_file(&self, drv: &str, name: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Unpack the whole archive into `dest` for post-mortem inspection.
    ///
    /// Returns `false` when the source is not an archive we know how to
    /// unpack.
    fn unpack(&self, drv: &str, dest: &Path) -> Result<bool, BackendError>;
}

// ---------------------------------------------------------------------------
// BackendError
// ---------------------------------------------------------------------------

/// Errors from external tools.
#[derive(Debug)]
pub enum BackendError {
    /// Spawning a process or touching the file system failed.
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A command exited unsuccessfully.
    Command {
        /// Command line summary.
        command: String,
        /// Exit code if available.
        exit_code: Option<i32>,
        /// Trimmed stderr.
        stderr: String,
    },
    /// A command succeeded but its output could not be understood.
    Parse {
        /// What was being parsed.
        context: String,
        /// Why it failed.
        detail: String,
    },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::Command {
                command,
                exit_code,
                stderr,
            } => {
                write!(f, "`{command}` failed")?;
                if let Some(code) = exit_code {
                    write!(f, " (exit {code})")?;
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            Self::Parse { context, detail } => write!(f, "could not parse {context}: {detail}"),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Run a prepared command and require success.
pub(crate) fn run_checked(
    mut cmd: std::process::Command,
    summary: &str,
) -> Result<Output, BackendError> {
    tracing::debug!(command = summary, "running");
    let output = cmd.output().map_err(|source| BackendError::Io {
        context: format!("spawn `{summary}`"),
        source,
    })?;
    if !output.status.success() {
        return Err(BackendError::Command {
            command: summary.to_owned(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(output)
}
