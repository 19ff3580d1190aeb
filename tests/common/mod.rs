//! Shared fixtures for uv2nix-hammer integration tests.
//!
//! Every test runs in its own temp directory. The build tool, git and the
//! source inspector are replaced by scripted fakes; nothing shells out.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use hammer::backend::{BackendError, BuildRun, BuildTool, SourceInspector, Vcs};
use hammer::model::UnitId;
use hammer::project::{ProjectSpec, PythonVersion, SourcePreference};
use hammer::repo::OverrideRepo;
use hammer::{Orchestrator, RunSettings, Tools, WorkDir};
use tempfile::TempDir;

/// Target package of every scripted run.
pub const TARGET: &str = "bar";
/// Target version of every scripted run.
pub const TARGET_VERSION: &str = "2.0";

/// Store path of a failing dependency derivation.
pub fn drv(pkg: &str, version: &str) -> String {
    format!("/nix/store/aaa-python3.12-{pkg}-{version}.drv")
}

// ---------------------------------------------------------------------------
// Scripted build tool
// ---------------------------------------------------------------------------

/// What one build attempt reports.
#[derive(Clone, Debug, Default)]
pub struct Attempt {
    /// Extra stderr text (terminal signals).
    pub stderr: String,
    /// Failing derivations and their own logs.
    pub failures: Vec<(String, String)>,
    /// Whether the build succeeds.
    pub succeeds: bool,
}

impl Attempt {
    /// A successful attempt.
    pub fn success() -> Self {
        Self {
            succeeds: true,
            ..Self::default()
        }
    }

    /// One failing unit with `log` as its build log.
    pub fn failing(pkg: &str, version: &str, log: &str) -> Self {
        Self {
            failures: vec![(drv(pkg, version), log.to_owned())],
            ..Self::default()
        }
    }

    /// A failure carrying only build-tool output.
    pub fn signal(stderr: &str) -> Self {
        Self {
            stderr: stderr.to_owned(),
            ..Self::default()
        }
    }

    fn render_stderr(&self) -> String {
        let mut text = String::from("building '/nix/store/zzz-bar-env.drv'...\n");
        for (drv, _) in &self.failures {
            text.push_str(&format!(
                "error: builder for '{drv}' failed with exit code 1;\n       last 10 log lines:\n"
            ));
        }
        text.push_str(&self.stderr);
        text
    }
}

/// Build tool that replays a fixed list of attempts.
///
/// Attempts past the end of the script repeat the last one.
pub struct ScriptedBuild {
    script: Vec<Attempt>,
    next: Cell<usize>,
    lock: String,
    pub locks: Cell<usize>,
}

impl ScriptedBuild {
    pub fn new(script: Vec<Attempt>) -> Self {
        Self {
            script,
            next: Cell::new(0),
            lock: String::new(),
            locks: Cell::new(0),
        }
    }

    /// Contents `lock_project` writes to `uv.lock`.
    pub fn with_lock(mut self, lock: &str) -> Self {
        self.lock = lock.to_owned();
        self
    }

    /// Number of build invocations so far.
    pub fn builds(&self) -> usize {
        self.next.get()
    }

    fn current(&self) -> &Attempt {
        let index = self.next.get().saturating_sub(1).min(self.script.len() - 1);
        &self.script[index]
    }
}

impl BuildTool for ScriptedBuild {
    fn lock_project(&self, project: &Path) -> Result<(), BackendError> {
        self.locks.set(self.locks.get() + 1);
        std::fs::write(project.join("uv.lock"), &self.lock).map_err(|source| BackendError::Io {
            context: "write uv.lock".to_owned(),
            source,
        })
    }

    fn refresh_overrides_input(&self, _project: &Path) -> Result<(), BackendError> {
        Ok(())
    }

    fn build(&self, _project: &Path, log_path: &Path) -> Result<BuildRun, BackendError> {
        self.next.set(self.next.get() + 1);
        let attempt = self.current();
        let stderr = attempt.render_stderr();
        std::fs::write(log_path, &stderr).map_err(|source| BackendError::Io {
            context: "write run log".to_owned(),
            source,
        })?;
        Ok(BuildRun {
            stderr,
            succeeded: attempt.succeeds,
        })
    }

    fn derivation_log(&self, drv: &str) -> Result<String, BackendError> {
        Ok(self
            .current()
            .failures
            .iter()
            .find(|(d, _)| d == drv)
            .map(|(_, log)| log.clone())
            .unwrap_or_default())
    }

    fn derivation_source(&self, drv: &str) -> Result<String, BackendError> {
        Ok(format!("{drv}.tar.gz"))
    }
}

// ---------------------------------------------------------------------------
// Recording collaborators
// ---------------------------------------------------------------------------

/// Vcs that records what it was asked to do.
#[derive(Default)]
pub struct RecordingVcs {
    pub calls: RefCell<Vec<String>>,
}

impl RecordingVcs {
    /// Commit messages, in order.
    pub fn commits(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| c.strip_prefix("commit ").map(str::to_owned))
            .collect()
    }
}

impl Vcs for RecordingVcs {
    fn clone_branch(&self, url: &str, dir: &Path, branch: &str) -> Result<(), BackendError> {
        self.calls
            .borrow_mut()
            .push(format!("clone {url} {} {branch}", dir.display()));
        Ok(())
    }

    fn ensure_repo(&self, dir: &Path) -> Result<(), BackendError> {
        self.calls
            .borrow_mut()
            .push(format!("init {}", dir.display()));
        Ok(())
    }

    fn stage(&self, dir: &Path, paths: &[&str]) -> Result<(), BackendError> {
        self.calls
            .borrow_mut()
            .push(format!("stage {} {}", dir.display(), paths.join(" ")));
        Ok(())
    }

    fn commit(&self, _dir: &Path, message: &str) -> Result<(), BackendError> {
        self.calls.borrow_mut().push(format!("commit {message}"));
        Ok(())
    }
}

/// Source inspector with no archives; records unpack requests.
#[derive(Default)]
pub struct NoSources {
    pub requires: HashMap<String, Vec<String>>,
    pub unpacked: RefCell<Vec<String>>,
}

impl SourceInspector for NoSources {
    fn build_requires(&self, drv: &str) -> Result<Option<Vec<String>>, BackendError> {
        Ok(self.requires.get(drv).cloned())
    }

    fn read_file(&self, _drv: &str, _name: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(None)
    }

    fn unpack(&self, drv: &str, _dest: &Path) -> Result<bool, BackendError> {
        self.unpacked.borrow_mut().push(drv.to_owned());
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Temp directory with a work dir and an override repository.
pub struct Fixture {
    pub dir: TempDir,
    pub work: WorkDir,
    pub repo: OverrideRepo,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let work = WorkDir::for_unit(dir.path(), &target());
        std::fs::create_dir_all(work.overrides()).unwrap();
        let repo = OverrideRepo::new(work.overrides());
        Self { dir, work, repo }
    }

    pub fn project(&self) -> ProjectSpec {
        ProjectSpec {
            package: TARGET.to_owned(),
            version: TARGET_VERSION.to_owned(),
            python: PythonVersion::new(3, 12),
            preference: SourcePreference::Wheel,
            nixpkgs: "github:nixos/nixpkgs/24.05".to_owned(),
            uv2nix: "github:adisbladis/uv2nix".to_owned(),
            overrides: self.work.overrides(),
            extra_dependencies: BTreeMap::new(),
        }
    }

    pub fn settings(max_attempts: u32) -> RunSettings {
        RunSettings {
            max_attempts,
            nixpkgs_newer: "github:nixos/nixpkgs/nixos-unstable".to_owned(),
            manual_root: None,
        }
    }

    pub fn orchestrator<'a>(
        &'a self,
        build: &'a ScriptedBuild,
        vcs: &'a RecordingVcs,
        sources: &'a NoSources,
        max_attempts: u32,
    ) -> Orchestrator<'a> {
        let tools = Tools {
            build,
            vcs,
            sources,
        };
        Orchestrator::new(
            tools,
            &self.repo,
            &self.work,
            self.project(),
            Self::settings(max_attempts),
        )
    }

    pub fn artifact(&self, pkg: &str, version: &str) -> String {
        self.repo
            .read_artifact(&UnitId::new(pkg, version))
            .unwrap_or_else(|| panic!("no default.nix for {pkg}=={version}"))
    }

    pub fn log(&self, attempt: u32) -> PathBuf {
        self.work.build().join(format!("run_{attempt}.log"))
    }
}

pub fn target() -> UnitId {
    UnitId::new(TARGET, TARGET_VERSION)
}
