use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use hammer::backend::{ArchiveInspector, GitCli, NixCli, Vcs};
use hammer::config::HammerConfig;
use hammer::index::{PackageIndex, ResolvedRelease};
use hammer::model::UnitId;
use hammer::orchestrator::rewrite_overrides;
use hammer::project::{ProjectSpec, PythonVersion, SourcePreference};
use hammer::repo::OverrideRepo;
use hammer::rules::RuleContext;
use hammer::{HammerError, Orchestrator, RunSettings, Tools, WorkDir};

/// Derive uv2nix build overrides for a PyPI package
///
/// Builds the package with uv2nix, reads the failing derivations' logs,
/// and lets a set of rules decide which overrides to add. Repeats until the
/// build succeeds, no rule makes progress, or the attempt limit is hit.
///
/// The overrides live in a clone of the override repository under
/// hammer_build_<pkg>_<version>/overrides, on the branch <pkg>-<version>.
/// A successful build commits them there.
///
/// EXAMPLES:
///
///   uv2nix-hammer requests
///   uv2nix-hammer numpy 1.26.4 --sdist
///   uv2nix-hammer pandas 2.2.2 --python 3.11 --max-attempts 20
///   uv2nix-hammer pandas 2.2.2 --rewrite-only
#[derive(Parser, Debug)]
#[command(name = "uv2nix-hammer")]
#[command(version, about)]
struct Cli {
    /// Package to build
    pkg: String,

    /// Version to build (default: newest stable release)
    #[arg(id = "pkg_version", value_name = "VERSION")]
    version: Option<String>,

    /// Prefer the source distribution over wheels
    #[arg(short, long)]
    sdist: bool,

    /// Python version to build for, e.g. 3.11
    #[arg(long)]
    python: Option<String>,

    /// Override repository to clone (URL or local path)
    #[arg(long)]
    overrides: Option<String>,

    /// Regenerate every default.nix from its rules.toml without building
    #[arg(long)]
    rewrite_only: bool,

    /// Maximum number of build attempts
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Configuration file
    #[arg(long, default_value = "hammer.toml", env = "HAMMER_CONFIG")]
    config: PathBuf,

    /// Directory with hand-written overrides (<root>/<pkg>/<version>/default.nix)
    #[arg(long)]
    manual_root: Option<PathBuf>,

    /// Where to create hammer_build_<pkg>_<version> (default: current directory)
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let _telemetry = hammer::telemetry::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

/// Apply command-line flags on top of the config file.
fn load_config(cli: &Cli) -> Result<HammerConfig> {
    let mut config = HammerConfig::load(&cli.config).map_err(HammerError::from)?;
    if let Some(python) = &cli.python {
        config.build.python.clone_from(python);
    }
    if let Some(repository) = &cli.overrides {
        config.overrides.repository.clone_from(repository);
    }
    if let Some(max_attempts) = cli.max_attempts {
        anyhow::ensure!(max_attempts > 0, "--max-attempts must be at least 1");
        config.build.max_attempts = max_attempts;
    }
    if let Some(root) = &cli.manual_root {
        config.overrides.manual_root = Some(root.clone());
    }
    Ok(config)
}

fn run(cli: &Cli) -> Result<bool> {
    let config = load_config(cli)?;
    let python = PythonVersion::parse(&config.build.python)
        .with_context(|| format!("invalid python version '{}'", config.build.python))?;

    let release = match pinned_release(cli) {
        Some(release) => release,
        None => resolve_release(cli, &config)?,
    };

    let unit = UnitId::new(&cli.pkg, &release.version);
    let base = match &cli.work_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("reading the current directory")?,
    };
    let work = WorkDir::for_unit(&base, &unit);
    std::fs::create_dir_all(&work.root)
        .with_context(|| format!("creating {}", work.root.display()))?;

    let vcs = GitCli;
    let overrides_dir = work.overrides();
    if !overrides_dir.exists() {
        let branch = format!("{}-{}", unit.name, unit.version);
        vcs.clone_branch(&config.overrides.repository, &overrides_dir, &branch)
            .map_err(HammerError::from)
            .with_context(|| format!("cloning {}", config.overrides.repository))?;
    }
    let overrides_dir = overrides_dir
        .canonicalize()
        .with_context(|| format!("resolving {}", overrides_dir.display()))?;
    let repo = OverrideRepo::new(&overrides_dir);
    let _lock = repo.lock().map_err(HammerError::from)?;

    let nix = NixCli;
    let sources = ArchiveInspector::new(&nix);
    let manual_root = config.overrides.manual_root.as_deref().map(absolute).transpose()?;

    if cli.rewrite_only {
        let ctx = RuleContext {
            manual_root: manual_root.as_deref(),
            sources: &sources,
        };
        let written = rewrite_overrides(&repo, &ctx, &vcs)?;
        println!("rewrote {written} override file(s) in {}", repo.root().display());
        return Ok(true);
    }

    let preference = if cli.sdist && release.has_sdist {
        SourcePreference::Sdist
    } else {
        if cli.sdist {
            warn!(package = %cli.pkg, version = %release.version, "no sdist available, using wheels");
        }
        SourcePreference::Wheel
    };

    let project = ProjectSpec {
        package: cli.pkg.clone(),
        version: release.version.clone(),
        python,
        preference,
        nixpkgs: config.build.nixpkgs.clone(),
        uv2nix: config.build.uv2nix.clone(),
        overrides: overrides_dir.clone(),
        extra_dependencies: BTreeMap::new(),
    };
    let settings = RunSettings {
        max_attempts: config.build.max_attempts,
        nixpkgs_newer: config.build.nixpkgs_newer.clone(),
        manual_root,
    };
    let tools = Tools {
        build: &nix,
        vcs: &vcs,
        sources: &sources,
    };

    let mut orchestrator = Orchestrator::new(tools, &repo, &work, project, settings);
    let outcome = orchestrator.run()?;
    println!("{}", outcome.summary());
    match &outcome {
        hammer::RunOutcome::Stuck { logs, .. } | hammer::RunOutcome::Exhausted { logs, .. } => {
            if let Some(last) = logs.last() {
                println!("  last log: {}", last.display());
            }
            println!("  sources:  {}", work.sources().display());
        }
        _ => {}
    }
    Ok(outcome.is_success())
}

/// Release known without asking the index: rewriting an explicit version
/// works from the checkout alone.
fn pinned_release(cli: &Cli) -> Option<ResolvedRelease> {
    let version = cli.version.as_ref().filter(|_| cli.rewrite_only)?;
    Some(ResolvedRelease {
        version: version.clone(),
        has_sdist: false,
    })
}

/// Look the package up on the index and pick the release to build.
fn resolve_release(cli: &Cli, config: &HammerConfig) -> Result<ResolvedRelease> {
    let index = PackageIndex::new(
        &config.index.url,
        PackageIndex::default_cache_dir(),
        config.index.cache_hours,
    );
    let document = index
        .project(&cli.pkg)
        .map_err(HammerError::from)
        .with_context(|| format!("looking up {} on the package index", cli.pkg))?;
    let release = document
        .resolve(cli.version.as_deref())
        .ok_or_else(|| HammerError::UnknownRelease {
            package: cli.pkg.clone(),
            version: cli.version.clone().unwrap_or_else(|| "(newest stable)".to_owned()),
        })?;
    info!(package = %cli.pkg, version = %release.version, sdist = release.has_sdist, "resolved release");
    Ok(release)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolving {}", path.display()))
}
