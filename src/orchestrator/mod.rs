//! Build retry orchestrator.
//!
//! Drives one package-build goal through the loop
//!
//! ```text
//! Attempting ─┬─ result exists ───────────────────────────▶ Succeeded
//!             ├─ terminal signal ─▶ RecoveringCycle / AddingDependency /
//!             │                     Downgrading ─▶ Attempting
//!             └─ Diagnosing ─┬─ no rule progress ─────────▶ Stuck
//!                            └─ Regenerating ─┬─ exclusion ▶ Excluded
//!                                             └──────────▶ Attempting
//! ```
//!
//! bounded by the attempt limit (`Failed` once it is reached). Fatal
//! conditions (invalid generated syntax, merge conflicts, a recursion with no
//! cycle in the lock graph) are returned as [`HammerError`]s.
//!
//! Nothing is written to the override repository until every changed unit
//! has merged and rendered cleanly, so an interrupted or failed pass leaves
//! the repository as it was.
//!
//! Project-level requests (dependency constraints, the Python downgrade, the
//! newer package snapshot) are rebuilt from every persisted unit state when a
//! run starts, so resuming a goal picks up where the last run stopped.

pub mod cycle;
pub mod signals;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::backend::{BuildTool, SourceInspector, Vcs};
use crate::error::HammerError;
use crate::lognorm::{FailureRecord, collect_failures};
use crate::merge::{MergeError, MergeOutcome, fingerprint_of, merge_state, render_artifact};
use crate::model::{OptionValue, PackageName, RuleState, UnitId};
use crate::project::{PROJECT_FILES, ProjectSpec, PythonVersion};
use crate::repo::OverrideRepo;
use crate::rules::{self, REGISTRY, RemovePropagatedBuildInputs, RuleContext, run_rules};

pub use cycle::{CycleBreak, LockGraph, LockGraphError};
pub use signals::{Signal, classify};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The external collaborators of a run.
#[derive(Clone, Copy)]
pub struct Tools<'a> {
    /// Build tool (nix + uv).
    pub build: &'a dyn BuildTool,
    /// Version control for the project and the override repository.
    pub vcs: &'a dyn Vcs,
    /// Source archive access for rules and post-mortem extraction.
    pub sources: &'a dyn SourceInspector,
}

/// Fixed settings of one run.
#[derive(Clone, Debug)]
pub struct RunSettings {
    /// Upper bound on build attempts.
    pub max_attempts: u32,
    /// nixpkgs reference switched to when a rule asks for a newer snapshot.
    pub nixpkgs_newer: String,
    /// Root of hand-written overrides.
    pub manual_root: Option<PathBuf>,
}

/// Directory layout of one goal: `hammer_build_<pkg>_<version>/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkDir {
    /// Goal directory.
    pub root: PathBuf,
}

impl WorkDir {
    /// Work directory for `unit` under `base`.
    #[must_use]
    pub fn for_unit(base: &Path, unit: &UnitId) -> Self {
        Self {
            root: base.join(format!("hammer_build_{}_{}", unit.name, unit.version)),
        }
    }

    /// Scratch build project.
    #[must_use]
    pub fn build(&self) -> PathBuf {
        self.root.join("build")
    }

    /// Post-mortem source extraction root.
    #[must_use]
    pub fn sources(&self) -> PathBuf {
        self.root.join("src")
    }

    /// Override repository checkout.
    #[must_use]
    pub fn overrides(&self) -> PathBuf {
        self.root.join("overrides")
    }
}

// ---------------------------------------------------------------------------
// Phases and outcomes
// ---------------------------------------------------------------------------

/// Orchestrator state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Running the build tool.
    Attempting,
    /// Reading failing units and running rules.
    Diagnosing,
    /// Merging changed units and writing artifacts.
    Regenerating,
    /// No rule made progress.
    Stuck,
    /// Cutting a dependency cycle after infinite recursion.
    RecoveringCycle,
    /// Declaring a missing optional dependency in the project.
    AddingDependency,
    /// Switching the project to an older Python.
    Downgrading,
    /// A unit can never be built.
    Excluded,
    /// The build succeeded.
    Succeeded,
    /// The attempt limit was reached.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Attempting => "attempting",
            Self::Diagnosing => "diagnosing",
            Self::Regenerating => "regenerating",
            Self::Stuck => "stuck",
            Self::RecoveringCycle => "recovering-cycle",
            Self::AddingDependency => "adding-dependency",
            Self::Downgrading => "downgrading",
            Self::Excluded => "excluded",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a run ended, short of a fatal error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The build succeeded; overrides are committed.
    Succeeded {
        /// Attempts used.
        attempts: u32,
    },
    /// A full pass changed no decision.
    Stuck {
        /// Attempts used.
        attempts: u32,
        /// Preserved attempt logs.
        logs: Vec<PathBuf>,
    },
    /// A unit was declared unbuildable.
    Excluded {
        /// The unit.
        unit: UnitId,
        /// Rule that excluded it.
        rule: &'static str,
        /// Why.
        reason: String,
    },
    /// The attempt limit was reached.
    Exhausted {
        /// Attempts used.
        attempts: u32,
        /// Preserved attempt logs.
        logs: Vec<PathBuf>,
    },
}

impl RunOutcome {
    /// Whether the goal was met.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// One-line reason for stopping.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Succeeded { attempts } => format!("build succeeded after {attempts} attempt(s)"),
            Self::Stuck { attempts, .. } => {
                format!("stuck after {attempts} attempt(s): no rule matched the remaining failures")
            }
            Self::Excluded { unit, rule, reason } => {
                format!("{unit} excluded by rule '{rule}': {reason}")
            }
            Self::Exhausted { attempts, .. } => {
                format!("gave up after {attempts} attempt(s) without a successful build")
            }
        }
    }
}

/// What to do after a terminal signal or a rule pass.
enum Step {
    Retry,
    Stop(RunOutcome),
}

/// A unit whose rule state changed during a pass.
struct Pending<'f> {
    unit: UnitId,
    state: RuleState,
    fresh: Vec<&'static str>,
    failure: Option<&'f FailureRecord>,
}

/// Project-level requests collected from merged units.
#[derive(Default)]
struct ProjectChanges {
    constraints: Vec<(UnitId, String, String)>,
    downgrade: Option<String>,
    newer_nixpkgs: bool,
}

impl ProjectChanges {
    fn absorb(&mut self, unit: &UnitId, outcome: &MergeOutcome) {
        self.constraints.extend(
            outcome
                .constraints
                .iter()
                .map(|(dep, spec)| (unit.clone(), dep.clone(), spec.clone())),
        );
        if let Some(version) = &outcome.python_downgrade {
            self.downgrade = Some(version.clone());
        }
        self.newer_nixpkgs |= outcome.newer_nixpkgs;
    }

    fn is_empty(&self) -> bool {
        self.constraints.is_empty() && self.downgrade.is_none() && !self.newer_nixpkgs
    }
}

/// What a regeneration pass did.
enum Regenerated {
    /// An artifact, a unit state or the project changed.
    Changed,
    /// Everything on disk already matched.
    Unchanged,
    /// A unit was excluded.
    Excluded(RunOutcome),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// One package-build goal.
pub struct Orchestrator<'a> {
    tools: Tools<'a>,
    repo: &'a OverrideRepo,
    build_dir: PathBuf,
    sources_dir: PathBuf,
    project: ProjectSpec,
    settings: RunSettings,
    credited: BTreeMap<UnitId, BTreeSet<&'static str>>,
    constraint_owner: BTreeMap<String, UnitId>,
    phases: Vec<Phase>,
}

impl<'a> Orchestrator<'a> {
    /// Set up a run. Nothing is touched until [`Orchestrator::run`].
    #[must_use]
    pub fn new(
        tools: Tools<'a>,
        repo: &'a OverrideRepo,
        work: &WorkDir,
        project: ProjectSpec,
        settings: RunSettings,
    ) -> Self {
        Self {
            tools,
            repo,
            build_dir: work.build(),
            sources_dir: work.sources(),
            project,
            settings,
            credited: BTreeMap::new(),
            constraint_owner: BTreeMap::new(),
            phases: Vec::new(),
        }
    }

    /// Every phase entered so far, in order.
    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// The project as currently configured (after any mutations).
    #[must_use]
    pub const fn project(&self) -> &ProjectSpec {
        &self.project
    }

    fn target(&self) -> UnitId {
        UnitId::new(&self.project.package, &self.project.version)
    }

    fn enter(&mut self, phase: Phase, attempt: u32) {
        info!(%phase, attempt, "orchestrator state");
        self.phases.push(phase);
    }

    fn log_path(&self, attempt: u32) -> PathBuf {
        self.build_dir.join(format!("run_{attempt}.log"))
    }

    /// Run the loop to completion.
    ///
    /// # Errors
    /// Fatal conditions; see the module documentation.
    #[instrument(skip(self), fields(target = %self.target()))]
    pub fn run(&mut self) -> Result<RunOutcome, HammerError> {
        self.prepare()?;
        let mut logs = Vec::new();
        let mut last_failures: Vec<FailureRecord> = Vec::new();

        for attempt in 0..self.settings.max_attempts {
            self.enter(Phase::Attempting, attempt);
            let log = self.log_path(attempt);
            self.tools.build.refresh_overrides_input(&self.build_dir)?;
            let run = self.tools.build.build(&self.build_dir, &log)?;
            logs.push(log.clone());

            if run.succeeded {
                self.enter(Phase::Succeeded, attempt);
                self.commit_success()?;
                return Ok(RunOutcome::Succeeded {
                    attempts: attempt + 1,
                });
            }

            if let Some(signal) = classify(&run.stderr) {
                match self.handle_signal(signal, attempt, &log)? {
                    Step::Retry => continue,
                    Step::Stop(outcome) => {
                        self.post_mortem(&last_failures);
                        return Ok(outcome);
                    }
                }
            }

            self.enter(Phase::Diagnosing, attempt);
            let build = self.tools.build;
            let failures = collect_failures(&run.stderr, |drv| build.derivation_log(drv))?;
            if failures.is_empty() {
                warn!(log = %log.display(), "build failed without any failing derivation");
            }
            match self.diagnose(&failures, attempt)? {
                Step::Retry => last_failures = failures,
                Step::Stop(outcome) => {
                    let outcome = match outcome {
                        RunOutcome::Stuck { .. } => RunOutcome::Stuck {
                            attempts: attempt + 1,
                            logs,
                        },
                        other => other,
                    };
                    self.post_mortem(&failures);
                    return Ok(outcome);
                }
            }
        }

        self.enter(Phase::Failed, self.settings.max_attempts);
        self.post_mortem(&last_failures);
        Ok(RunOutcome::Exhausted {
            attempts: self.settings.max_attempts,
            logs,
        })
    }

    /// Clear the target's overrides, drop stale logs and the old result,
    /// and write the project.
    fn prepare(&mut self) -> Result<(), HammerError> {
        std::fs::create_dir_all(&self.build_dir).map_err(|source| HammerError::Io {
            context: format!("create {}", self.build_dir.display()),
            source,
        })?;
        self.repo.clear(&self.target())?;
        self.repo.write_collected()?;
        self.tools.vcs.stage(self.repo.root(), &[])?;

        let pattern = self.build_dir.join("run_*.log");
        for path in glob::glob(&pattern.to_string_lossy()).into_iter().flatten().flatten() {
            std::fs::remove_file(&path).map_err(|source| HammerError::Io {
                context: format!("remove {}", path.display()),
                source,
            })?;
        }
        let result = self.build_dir.join("result");
        if result.symlink_metadata().is_ok() {
            std::fs::remove_file(&result).map_err(|source| HammerError::Io {
                context: format!("remove {}", result.display()),
                source,
            })?;
        }
        let saved = self.saved_project_changes()?;
        self.apply_project_changes(saved)?;
        self.refresh_project()
    }

    /// Project requests implied by every unit state already in the repository.
    fn saved_project_changes(&self) -> Result<ProjectChanges, HammerError> {
        let manual_root = self.settings.manual_root.clone();
        let ctx = RuleContext {
            manual_root: manual_root.as_deref(),
            sources: self.tools.sources,
        };
        let mut changes = ProjectChanges::default();
        for unit in self.repo.units()? {
            let state = self.repo.load_state(&unit)?;
            if state.is_empty() {
                continue;
            }
            match merge_state(&ctx, &state) {
                Ok(outcome) => changes.absorb(&unit, &outcome),
                Err(MergeError::Excluded { rule, .. }) => {
                    debug!(%unit, rule, "saved state excludes unit");
                }
                Err(source) => return Err(HammerError::Merge { unit, source }),
            }
        }
        if !changes.is_empty() {
            info!(
                constraints = changes.constraints.len(),
                downgrade = ?changes.downgrade,
                newer_nixpkgs = changes.newer_nixpkgs,
                "restoring project requests from saved state"
            );
        }
        Ok(changes)
    }

    /// Write the project files, relock, and stage them.
    fn refresh_project(&self) -> Result<(), HammerError> {
        self.project
            .write(&self.build_dir)
            .map_err(|source| HammerError::Io {
                context: format!("write project files in {}", self.build_dir.display()),
                source,
            })?;
        self.tools.build.lock_project(&self.build_dir)?;
        self.tools.vcs.ensure_repo(&self.build_dir)?;
        self.tools.vcs.stage(&self.build_dir, PROJECT_FILES)?;
        debug!(python = %self.project.python, nixpkgs = %self.project.nixpkgs, "project refreshed");
        Ok(())
    }

    fn commit_success(&self) -> Result<(), HammerError> {
        self.repo.write_collected()?;
        self.tools.vcs.stage(self.repo.root(), &[])?;
        let message = format!(
            "autogenerated overrides for {}=={}",
            self.project.package, self.project.version
        );
        self.tools.vcs.commit(self.repo.root(), &message)?;
        info!(%message, "committed overrides");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Terminal signals
    // -----------------------------------------------------------------------

    fn handle_signal(
        &mut self,
        signal: Signal,
        attempt: u32,
        log: &Path,
    ) -> Result<Step, HammerError> {
        info!(?signal, attempt, "terminal signal");
        match signal {
            Signal::InvalidSyntax { line } => Err(HammerError::InvalidOverrideSyntax {
                line,
                log: log.to_owned(),
            }),
            Signal::InfiniteRecursion if attempt == 0 => {
                self.enter(Phase::RecoveringCycle, attempt);
                self.recover_cycle()
            }
            Signal::InfiniteRecursion => Err(HammerError::RecursionPersists {
                attempt,
                log: log.to_owned(),
            }),
            Signal::MissingOptionalDependency { name } => {
                let name = PackageName::new(&name).to_string();
                if self.project.extra_dependencies.contains_key(&name) {
                    warn!(dependency = %name, "optional dependency already declared");
                    self.enter(Phase::Stuck, attempt);
                    return Ok(Step::Stop(RunOutcome::Stuck {
                        attempts: attempt + 1,
                        logs: self.logs_until(attempt),
                    }));
                }
                self.enter(Phase::AddingDependency, attempt);
                info!(dependency = %name, "declaring missing optional dependency");
                self.project.extra_dependencies.insert(name, String::new());
                self.refresh_project()?;
                Ok(Step::Retry)
            }
            Signal::IncompatiblePython { version, spec } => {
                let Some(python) = self.project.python.downgrade_within(&spec) else {
                    return Err(HammerError::NoCompatiblePython {
                        current: version,
                        spec,
                    });
                };
                self.enter(Phase::Downgrading, attempt);
                self.downgrade(python);
                self.refresh_project()?;
                Ok(Step::Retry)
            }
        }
    }

    fn logs_until(&self, attempt: u32) -> Vec<PathBuf> {
        (0..=attempt).map(|a| self.log_path(a)).collect()
    }

    fn downgrade(&mut self, python: PythonVersion) {
        info!(from = %self.project.python, to = %python, "downgrading python");
        self.project.python = python;
        self.project.nixpkgs.clone_from(&self.settings.nixpkgs_newer);
    }

    /// Cut one edge of a cycle in the lock graph.
    fn recover_cycle(&mut self) -> Result<Step, HammerError> {
        let lock = self.build_dir.join("uv.lock");
        let mut graph = LockGraph::load(&lock)?;
        for unit in self.repo.units()? {
            let state = self.repo.load_state(&unit)?;
            let dropped = state
                .get(RemovePropagatedBuildInputs::NAME)
                .map(OptionValue::list_texts)
                .unwrap_or_default();
            for dependency in dropped {
                debug!(%unit, %dependency, "edge already cut");
                graph.cut(&unit.name, &PackageName::new(&dependency));
            }
        }
        let cut = graph
            .break_cycle()
            .ok_or_else(|| HammerError::CycleNotFound { lock: lock.clone() })?;
        info!(
            unit = %cut.unit,
            dependency = %cut.dependency,
            cycle = ?cut.cycle,
            "breaking dependency cycle"
        );
        let mut state = self.repo.load_state(&cut.unit)?;
        let name = RemovePropagatedBuildInputs::NAME;
        let value = RemovePropagatedBuildInputs::with_removed(state.get(name), &cut.dependency);
        state.insert(name, value);
        let pending = vec![Pending {
            unit: cut.unit,
            state,
            fresh: Vec::new(),
            failure: None,
        }];
        match self.regenerate(pending)? {
            Regenerated::Excluded(outcome) => Ok(Step::Stop(outcome)),
            Regenerated::Changed | Regenerated::Unchanged => Ok(Step::Retry),
        }
    }

    // -----------------------------------------------------------------------
    // Rule pass
    // -----------------------------------------------------------------------

    fn diagnose(&mut self, failures: &[FailureRecord], attempt: u32) -> Result<Step, HammerError> {
        let manual_root = self.settings.manual_root.clone();
        let ctx = RuleContext {
            manual_root: manual_root.as_deref(),
            sources: self.tools.sources,
        };

        let mut pending: BTreeMap<UnitId, Pending<'_>> = BTreeMap::new();
        let mut progressed: BTreeSet<UnitId> = BTreeSet::new();
        for failure in failures {
            if !pending.contains_key(&failure.unit) {
                let state = self.repo.load_state(&failure.unit)?;
                pending.insert(
                    failure.unit.clone(),
                    Pending {
                        unit: failure.unit.clone(),
                        state,
                        fresh: Vec::new(),
                        failure: Some(failure),
                    },
                );
            }
            let Some(entry) = pending.get_mut(&failure.unit) else {
                continue;
            };
            let outcome = run_rules(&ctx, REGISTRY, failure, &mut entry.state);
            entry.fresh.extend(outcome.fresh.iter().copied());
            let credited = self.credited.entry(failure.unit.clone()).or_default();
            if outcome.made_progress(credited) {
                progressed.insert(failure.unit.clone());
            } else {
                debug!(unit = %failure.unit, "no rule progress");
            }
        }

        if progressed.is_empty() {
            self.enter(Phase::Stuck, attempt);
            return Ok(Step::Stop(RunOutcome::Stuck {
                attempts: attempt + 1,
                logs: Vec::new(),
            }));
        }

        self.enter(Phase::Regenerating, attempt);
        let changed: Vec<Pending<'_>> = pending
            .into_values()
            .filter(|p| progressed.contains(&p.unit))
            .collect();
        match self.regenerate(changed)? {
            Regenerated::Changed => Ok(Step::Retry),
            Regenerated::Unchanged => {
                info!("re-applied decisions changed nothing on disk");
                self.enter(Phase::Stuck, attempt);
                Ok(Step::Stop(RunOutcome::Stuck {
                    attempts: attempt + 1,
                    logs: Vec::new(),
                }))
            }
            Regenerated::Excluded(outcome) => Ok(Step::Stop(outcome)),
        }
    }

    /// Merge every pending unit, then write all of them.
    ///
    /// An excluded unit does not stop the others from merging: their
    /// decisions are written too, and the exclusion is reported afterwards.
    fn regenerate(&mut self, pending: Vec<Pending<'_>>) -> Result<Regenerated, HammerError> {
        let manual_root = self.settings.manual_root.clone();
        let ctx = RuleContext {
            manual_root: manual_root.as_deref(),
            sources: self.tools.sources,
        };

        let mut rendered = Vec::with_capacity(pending.len());
        let mut excluded = Vec::new();
        let mut changes = ProjectChanges::default();
        for p in pending {
            let fingerprint = p.state.fingerprint();
            let outcome = match merge_state(&ctx, &p.state) {
                Ok(outcome) => outcome,
                Err(MergeError::Excluded { rule, reason }) => {
                    warn!(unit = %p.unit, rule, %reason, "unit excluded");
                    excluded.push((p, rule, reason));
                    continue;
                }
                Err(source) => {
                    return Err(HammerError::Merge {
                        unit: p.unit,
                        source,
                    });
                }
            };
            let text = render_artifact(&p.unit, &fingerprint, &outcome.merged).map_err(|source| {
                HammerError::Merge {
                    unit: p.unit.clone(),
                    source,
                }
            })?;
            changes.absorb(&p.unit, &outcome);
            rendered.push((p, fingerprint, outcome.copies, text));
        }

        let mut written = false;
        for (p, fingerprint, copies, text) in rendered {
            let unchanged = match self.repo.read_artifact(&p.unit) {
                Some(existing) => fingerprint_of(&existing) == Some(fingerprint.as_str()),
                None => text.is_none() && self.repo.load_state(&p.unit)? == p.state,
            };
            if unchanged && p.fresh.is_empty() {
                debug!(unit = %p.unit, "rule state unchanged, artifact kept");
                continue;
            }
            let dir = self.repo.unit_dir(&p.unit);
            std::fs::create_dir_all(&dir).map_err(|source| HammerError::Io {
                context: format!("create {}", dir.display()),
                source,
            })?;
            if let Some(failure) = p.failure {
                for name in &p.fresh {
                    let (Some(rule), Some(value)) = (rules::find(name), p.state.get(name)) else {
                        continue;
                    };
                    rule.extract(&ctx, failure, value, &dir)
                        .map_err(|e| HammerError::Merge {
                            unit: p.unit.clone(),
                            source: e.into(),
                        })?;
                }
            }
            for copy in &copies {
                self.repo.copy_into(&p.unit, copy)?;
            }
            self.repo.write_unit(&p.unit, &p.state, text.as_deref())?;
            info!(unit = %p.unit, rules = p.state.len(), "overrides written");
            written = true;
        }

        for (p, ..) in &excluded {
            let existing = self.repo.read_artifact(&p.unit);
            self.repo.write_unit(&p.unit, &p.state, existing.as_deref())?;
        }
        if let Some((first, rule, reason)) = excluded.into_iter().next() {
            if !changes.is_empty() {
                info!(
                    constraints = changes.constraints.len(),
                    downgrade = ?changes.downgrade,
                    "project requests not applied; the unit states that carry them are saved"
                );
            }
            self.repo.write_collected()?;
            self.tools.vcs.stage(self.repo.root(), &[])?;
            self.phases.push(Phase::Excluded);
            return Ok(Regenerated::Excluded(RunOutcome::Excluded {
                unit: first.unit,
                rule,
                reason,
            }));
        }

        let dirty = self.apply_project_changes(changes)?;
        if dirty {
            self.refresh_project()?;
        }
        self.repo.write_collected()?;
        self.tools.vcs.stage(self.repo.root(), &[])?;
        Ok(if written || dirty {
            Regenerated::Changed
        } else {
            Regenerated::Unchanged
        })
    }

    /// Fold project requests into the project. Returns whether it changed;
    /// the caller refreshes the project files.
    fn apply_project_changes(&mut self, changes: ProjectChanges) -> Result<bool, HammerError> {
        let mut dirty = false;
        for (unit, dependency, spec) in changes.constraints {
            match self.project.extra_dependencies.get(&dependency) {
                Some(existing) if *existing == spec => {}
                Some(existing) if !existing.is_empty() => {
                    let first_unit = self
                        .constraint_owner
                        .get(&dependency)
                        .cloned()
                        .unwrap_or_else(|| unit.clone());
                    return Err(HammerError::ConstraintConflict {
                        first: existing.clone(),
                        first_unit,
                        second_unit: unit,
                        second: spec,
                        dependency,
                    });
                }
                _ => {
                    info!(%unit, dependency = %dependency, %spec, "adding project constraint");
                    self.constraint_owner.insert(dependency.clone(), unit);
                    self.project.extra_dependencies.insert(dependency, spec);
                    dirty = true;
                }
            }
        }

        if let Some(requested) = changes.downgrade {
            match PythonVersion::parse(&requested) {
                Some(python) if python < self.project.python => {
                    self.phases.push(Phase::Downgrading);
                    self.downgrade(python);
                    dirty = true;
                }
                Some(_) => debug!(%requested, "python already at or below requested version"),
                None => warn!(%requested, "ignoring unparseable python downgrade"),
            }
        }

        if changes.newer_nixpkgs && self.project.nixpkgs != self.settings.nixpkgs_newer {
            info!(nixpkgs = %self.settings.nixpkgs_newer, "switching to newer nixpkgs");
            self.project.nixpkgs.clone_from(&self.settings.nixpkgs_newer);
            dirty = true;
        }

        Ok(dirty)
    }

    /// Unpack each failing unit's source for inspection. Best effort.
    fn post_mortem(&self, failures: &[FailureRecord]) {
        for failure in failures {
            let dest = self
                .sources_dir
                .join(failure.unit.name.as_str())
                .join(&failure.unit.version);
            if dest.exists() {
                continue;
            }
            if let Err(e) = std::fs::create_dir_all(&dest) {
                warn!(dest = %dest.display(), error = %e, "cannot create source directory");
                continue;
            }
            match self.tools.sources.unpack(&failure.drv, &dest) {
                Ok(true) => info!(unit = %failure.unit, dest = %dest.display(), "source unpacked"),
                Ok(false) => debug!(unit = %failure.unit, "source is not an archive"),
                Err(e) => warn!(unit = %failure.unit, error = %e, "could not unpack source"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rewrite-only mode
// ---------------------------------------------------------------------------

/// Regenerate every artifact from persisted rule state without building.
///
/// Excluded units are skipped with a warning. Returns the number of units
/// whose artifact was written or removed.
///
/// # Errors
/// Unreadable state, merge conflicts, or write failures.
#[instrument(skip_all, fields(repo = %repo.root().display()))]
pub fn rewrite_overrides(
    repo: &OverrideRepo,
    ctx: &RuleContext<'_>,
    vcs: &dyn Vcs,
) -> Result<usize, HammerError> {
    let mut written = 0;
    for unit in repo.units()? {
        let state = repo.load_state(&unit)?;
        let outcome = match merge_state(ctx, &state) {
            Ok(outcome) => outcome,
            Err(MergeError::Excluded { rule, reason }) => {
                warn!(%unit, rule, %reason, "skipping excluded unit");
                continue;
            }
            Err(source) => return Err(HammerError::Merge { unit, source }),
        };
        let text = render_artifact(&unit, &state.fingerprint(), &outcome.merged).map_err(
            |source| HammerError::Merge {
                unit: unit.clone(),
                source,
            },
        )?;
        if repo.read_artifact(&unit) == text {
            continue;
        }
        for copy in &outcome.copies {
            repo.copy_into(&unit, copy)?;
        }
        repo.write_unit(&unit, &state, text.as_deref())?;
        debug!(%unit, "artifact rewritten");
        written += 1;
    }
    repo.write_collected()?;
    vcs.stage(repo.root(), &[])?;
    info!(written, "rewrite complete");
    Ok(written)
}
