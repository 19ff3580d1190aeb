//! Integration tests for the build retry loop.
//!
//! Each test scripts the build tool's output attempt by attempt and checks
//! the decisions persisted in the override repository.

mod common;

use common::{Attempt, Fixture, NoSources, RecordingVcs, ScriptedBuild, drv, target};
use hammer::merge::MergeError;
use hammer::model::{OptionValue, UnitId};
use hammer::orchestrator::rewrite_overrides;
use hammer::project::PythonVersion;
use hammer::rules::RuleContext;
use hammer::{HammerError, Phase, RunOutcome};

const CYCLE_LOCK: &str = r#"
version = 1
requires-python = "==3.12.*"

[[package]]
name = "bar"
version = "2.0"
dependencies = [{ name = "p" }]

[[package]]
name = "p"
version = "1.0"
dependencies = [{ name = "q" }]

[[package]]
name = "q"
version = "3.1"
dependencies = [{ name = "p" }]
"#;

#[test]
fn missing_setuptools_becomes_a_build_system() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![
        Attempt::failing(
            "foo",
            "1.0",
            "ModuleNotFoundError: No module named 'setuptools'",
        ),
        Attempt::success(),
    ]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let outcome = fx.orchestrator(&build, &vcs, &sources, 10).run().unwrap();

    assert_eq!(outcome, RunOutcome::Succeeded { attempts: 2 });
    let state = fx.repo.load_state(&UnitId::new("foo", "1.0")).unwrap();
    assert_eq!(
        state.get("build-systems"),
        Some(&OptionValue::strings(["setuptools"]))
    );
    assert!(fx.artifact("foo", "1.0").contains("final.setuptools"));
}

#[test]
fn missing_zlib_adds_sorted_native_inputs() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![
        Attempt::failing(
            "foo",
            "1.0",
            "src/compress.c:3:10: fatal error: zlib.h: No such file or directory",
        ),
        Attempt::success(),
    ]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    fx.orchestrator(&build, &vcs, &sources, 10).run().unwrap();

    let state = fx.repo.load_state(&UnitId::new("foo", "1.0")).unwrap();
    let inputs = state.get("native-build-inputs").unwrap().list_texts();
    assert_eq!(inputs, vec!["pkgs.pkg-config", "pkgs.zlib.dev"]);

    let artifact = fx.artifact("foo", "1.0");
    let pkg_config = artifact.find("pkgs.pkg-config").unwrap();
    let zlib = artifact.find("pkgs.zlib.dev").unwrap();
    assert!(pkg_config < zlib, "native inputs not sorted:\n{artifact}");
}

#[test]
fn conflicting_numpy_constraints_are_fatal() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![
        Attempt::failing(
            "foo",
            "1.0",
            "A module that was compiled using NumPy 1.x cannot be run in\nNumPy 2.0.0",
        ),
        Attempt::failing("foo", "1.0", "ModuleNotFoundError: No module named 'numpy.distutils'"),
    ]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let err = fx
        .orchestrator(&build, &vcs, &sources, 10)
        .run()
        .unwrap_err();

    let HammerError::Merge { unit, source } = &err else {
        panic!("expected a merge error, got {err}");
    };
    assert_eq!(unit, &UnitId::new("foo", "1.0"));
    assert!(
        matches!(source, MergeError::ConstraintConflict { dependency, .. } if dependency == "numpy"),
        "{source}"
    );
    // the failed pass wrote nothing
    let state = fx.repo.load_state(&UnitId::new("foo", "1.0")).unwrap();
    assert!(state.get("numpy-abi").is_some());
    assert!(state.get("numpy-distutils").is_none());
}

#[test]
fn recursion_on_first_attempt_breaks_the_cycle() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![
        Attempt::signal("error: infinite recursion encountered\n       at /nix/store/xyz/lib.nix:1:1"),
        Attempt::success(),
    ])
    .with_lock(CYCLE_LOCK);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();
    let mut orchestrator = fx.orchestrator(&build, &vcs, &sources, 10);

    let outcome = orchestrator.run().unwrap();

    assert_eq!(outcome, RunOutcome::Succeeded { attempts: 2 });
    assert_eq!(
        orchestrator.phases(),
        &[
            Phase::Attempting,
            Phase::RecoveringCycle,
            Phase::Attempting,
            Phase::Succeeded
        ]
    );
    let state = fx.repo.load_state(&UnitId::new("p", "1.0")).unwrap();
    assert_eq!(
        state.get("remove-propagated-build-inputs"),
        Some(&OptionValue::strings(["q"]))
    );
    assert!(
        fx.repo
            .load_state(&UnitId::new("q", "3.1"))
            .unwrap()
            .is_empty()
    );
}

#[test]
fn recursion_without_a_cycle_is_fatal() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![Attempt::signal(
        "error: infinite recursion encountered",
    )])
    .with_lock("[[package]]\nname = \"bar\"\nversion = \"2.0\"\n");
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let err = fx
        .orchestrator(&build, &vcs, &sources, 10)
        .run()
        .unwrap_err();
    assert!(matches!(err, HammerError::CycleNotFound { .. }), "{err}");
}

#[test]
fn recursion_after_first_attempt_is_fatal() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![
        Attempt::failing("foo", "1.0", "No module named 'setuptools'"),
        Attempt::signal("error: infinite recursion encountered"),
    ])
    .with_lock(CYCLE_LOCK);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let err = fx
        .orchestrator(&build, &vcs, &sources, 10)
        .run()
        .unwrap_err();
    assert!(
        matches!(err, HammerError::RecursionPersists { attempt: 1, .. }),
        "{err}"
    );
}

#[test]
fn python2_only_unit_is_excluded_without_retry() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![Attempt::failing(
        "oldpkg",
        "0.3",
        "  File \"setup.py\", line 4\n    print \"hi\"\nSyntaxError: Missing parentheses in call to 'print'",
    )]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let outcome = fx.orchestrator(&build, &vcs, &sources, 10).run().unwrap();

    let RunOutcome::Excluded { unit, rule, .. } = &outcome else {
        panic!("expected exclusion, got {outcome:?}");
    };
    assert_eq!(unit, &UnitId::new("oldpkg", "0.3"));
    assert_eq!(*rule, "python2-only");
    assert_eq!(build.builds(), 1);
    assert!(vcs.commits().is_empty());
    // the decision is remembered for the next run
    let state = fx.repo.load_state(&UnitId::new("oldpkg", "0.3")).unwrap();
    assert!(state.get("python2-only").is_some());
}

#[test]
fn repeated_failure_without_new_decision_is_stuck() {
    let fx = Fixture::new();
    let log = "No module named 'setuptools'";
    let build = ScriptedBuild::new(vec![
        Attempt::failing("foo", "1.0", log),
        Attempt::failing("foo", "1.0", log),
    ]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();
    let mut orchestrator = fx.orchestrator(&build, &vcs, &sources, 10);

    let outcome = orchestrator.run().unwrap();

    let RunOutcome::Stuck { attempts, logs } = &outcome else {
        panic!("expected stuck, got {outcome:?}");
    };
    assert_eq!(*attempts, 2);
    assert_eq!(logs, &vec![fx.log(0), fx.log(1)]);
    assert!(fx.log(1).is_file());
    assert_eq!(build.builds(), 2);
    assert_eq!(orchestrator.phases().last(), Some(&Phase::Stuck));
    assert_eq!(sources.unpacked.borrow().as_slice(), &[drv("foo", "1.0")]);
}

#[test]
fn unknown_failure_is_stuck_immediately() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![Attempt::failing(
        "mystery",
        "1.0",
        "gcc: internal compiler error: Segmentation fault",
    )]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let outcome = fx.orchestrator(&build, &vcs, &sources, 10).run().unwrap();

    assert!(matches!(outcome, RunOutcome::Stuck { attempts: 1, .. }));
    assert!(fx.repo.read_artifact(&UnitId::new("mystery", "1.0")).is_none());
}

#[test]
fn attempt_limit_ends_in_failure() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![
        Attempt::failing("foo", "1.0", "No module named 'setuptools'"),
        Attempt::failing("foo", "1.0", "zlib.h: No such file or directory"),
    ]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();
    let mut orchestrator = fx.orchestrator(&build, &vcs, &sources, 2);

    let outcome = orchestrator.run().unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Exhausted {
            attempts: 2,
            logs: vec![fx.log(0), fx.log(1)],
        }
    );
    assert_eq!(orchestrator.phases().last(), Some(&Phase::Failed));
    assert!(vcs.commits().is_empty());
    // both passes were kept
    let state = fx.repo.load_state(&UnitId::new("foo", "1.0")).unwrap();
    assert!(state.get("build-systems").is_some());
    assert!(state.get("native-build-inputs").is_some());
}

#[test]
fn success_commits_and_collects_overrides() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![
        Attempt::failing("foo", "1.0", "No module named 'setuptools'"),
        Attempt::success(),
    ]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    fx.orchestrator(&build, &vcs, &sources, 10).run().unwrap();

    assert_eq!(vcs.commits(), vec!["autogenerated overrides for bar==2.0"]);
    let collected = std::fs::read_to_string(fx.repo.root().join("collected.nix")).unwrap();
    assert!(collected.contains("import ./overrides/foo/1.0"), "{collected}");
    assert!(collected.contains("import ./overrides/bar/2.0"), "{collected}");
}

#[test]
fn run_starts_from_a_clean_target() {
    let fx = Fixture::new();
    let mut stale = hammer::model::RuleState::new();
    stale.insert("build-systems", OptionValue::strings(["hatchling"]));
    fx.repo.write_unit(&target(), &stale, Some("# old\n")).unwrap();
    std::fs::create_dir_all(fx.work.build()).unwrap();
    std::fs::write(fx.log(7), "old log").unwrap();

    let build = ScriptedBuild::new(vec![Attempt::success()]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();
    fx.orchestrator(&build, &vcs, &sources, 10).run().unwrap();

    assert!(fx.repo.load_state(&target()).unwrap().is_empty());
    assert_eq!(fx.artifact("bar", "2.0"), "{ ... }: old: { }\n");
    assert!(!fx.log(7).exists());
    assert!(fx.work.build().join("pyproject.toml").is_file());
    assert!(fx.work.build().join("flake.nix").is_file());
}

#[test]
fn missing_optional_dependency_is_declared() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![
        Attempt::signal("ImportError: Missing optional dependency 'Foo_Bar'. Use pip or conda to install it."),
        Attempt::success(),
    ]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();
    let mut orchestrator = fx.orchestrator(&build, &vcs, &sources, 10);

    let outcome = orchestrator.run().unwrap();

    assert!(outcome.is_success());
    assert!(orchestrator.phases().contains(&Phase::AddingDependency));
    assert!(orchestrator.project().extra_dependencies.contains_key("foo-bar"));
    let pyproject = std::fs::read_to_string(fx.work.build().join("pyproject.toml")).unwrap();
    assert!(pyproject.contains("foo-bar"), "{pyproject}");
    assert_eq!(build.locks.get(), 2);
}

#[test]
fn incompatible_python_downgrades_the_project() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![
        Attempt::signal("error: Package 'bar' requires a different Python: 3.12.4 not in '<3.12,>=3.8'"),
        Attempt::success(),
    ]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();
    let mut orchestrator = fx.orchestrator(&build, &vcs, &sources, 10);

    orchestrator.run().unwrap();

    assert!(orchestrator.phases().contains(&Phase::Downgrading));
    assert_eq!(orchestrator.project().python, PythonVersion::new(3, 11));
    assert_eq!(
        orchestrator.project().nixpkgs,
        "github:nixos/nixpkgs/nixos-unstable"
    );
}

#[test]
fn invalid_generated_syntax_is_fatal() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![Attempt::signal(
        "error: syntax error, unexpected '}', expecting ';'\n       at overrides/foo/1.0/default.nix:7:1",
    )]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let err = fx
        .orchestrator(&build, &vcs, &sources, 10)
        .run()
        .unwrap_err();
    let HammerError::InvalidOverrideSyntax { line, log } = &err else {
        panic!("expected invalid syntax, got {err}");
    };
    assert!(line.contains("syntax error, unexpected"));
    assert_eq!(log, &fx.log(0));
}

#[test]
fn rewrite_only_regenerates_from_state() {
    let fx = Fixture::new();
    let unit = UnitId::new("foo", "1.0");
    let mut state = hammer::model::RuleState::new();
    state.insert("build-systems", OptionValue::strings(["flit-core"]));
    fx.repo.write_unit(&unit, &state, None).unwrap();
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();
    let ctx = RuleContext {
        manual_root: None,
        sources: &sources,
    };

    assert_eq!(rewrite_overrides(&fx.repo, &ctx, &vcs).unwrap(), 1);
    assert!(fx.artifact("foo", "1.0").contains("final.flit-core"));
    // second pass finds nothing to do
    assert_eq!(rewrite_overrides(&fx.repo, &ctx, &vcs).unwrap(), 0);
    assert!(vcs.commits().is_empty());
}

#[test]
fn resumed_run_restores_saved_constraints() {
    let fx = Fixture::new();
    let log = "A module that was compiled using NumPy 1.x cannot be run in\nNumPy 2.0.0";
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let first = ScriptedBuild::new(vec![Attempt::failing("foo", "1.0", log)]);
    let mut orchestrator = fx.orchestrator(&first, &vcs, &sources, 10);
    let outcome = orchestrator.run().unwrap();
    assert!(matches!(outcome, RunOutcome::Stuck { attempts: 2, .. }), "{outcome:?}");
    assert_eq!(
        orchestrator.project().extra_dependencies.get("numpy").map(String::as_str),
        Some("<2")
    );

    // same repository, fresh project
    let second = ScriptedBuild::new(vec![Attempt::failing("foo", "1.0", log)]);
    let mut orchestrator = fx.orchestrator(&second, &vcs, &sources, 10);
    let outcome = orchestrator.run().unwrap();
    assert!(matches!(outcome, RunOutcome::Stuck { attempts: 1, .. }), "{outcome:?}");
    assert_eq!(
        orchestrator.project().extra_dependencies.get("numpy").map(String::as_str),
        Some("<2")
    );
    let pyproject = std::fs::read_to_string(fx.work.build().join("pyproject.toml")).unwrap();
    assert!(pyproject.contains("numpy"), "{pyproject}");
}

const OVERLAPPING_LOCK: &str = r#"
[[package]]
name = "bar"
version = "2.0"
dependencies = [{ name = "p" }]

[[package]]
name = "p"
version = "1.0"
dependencies = [{ name = "q" }, { name = "r" }]

[[package]]
name = "q"
version = "3.1"
dependencies = [{ name = "p" }]

[[package]]
name = "r"
version = "0.9"
dependencies = [{ name = "p" }]
"#;

#[test]
fn resumed_recursion_cuts_the_next_edge() {
    let fx = Fixture::new();
    let p = UnitId::new("p", "1.0");
    let mut earlier = hammer::model::RuleState::new();
    earlier.insert("remove-propagated-build-inputs", OptionValue::strings(["q"]));
    fx.repo.write_unit(&p, &earlier, None).unwrap();

    let build = ScriptedBuild::new(vec![
        Attempt::signal("error: infinite recursion encountered"),
        Attempt::success(),
    ])
    .with_lock(OVERLAPPING_LOCK);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let outcome = fx.orchestrator(&build, &vcs, &sources, 10).run().unwrap();

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(
        fx.repo
            .load_state(&p)
            .unwrap()
            .get("remove-propagated-build-inputs"),
        Some(&OptionValue::strings(["q", "r"]))
    );
}

#[test]
fn reapplied_decision_that_changes_nothing_is_stuck() {
    let fx = Fixture::new();
    let log = "FileNotFoundError: [Errno 2] No such file or directory: 'cmake'";
    let build = ScriptedBuild::new(vec![Attempt::failing("foo", "1.0", log)]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();
    let mut orchestrator = fx.orchestrator(&build, &vcs, &sources, 10);

    let outcome = orchestrator.run().unwrap();

    assert!(matches!(outcome, RunOutcome::Stuck { attempts: 2, .. }), "{outcome:?}");
    assert_eq!(build.builds(), 2);
    let state = fx.repo.load_state(&UnitId::new("foo", "1.0")).unwrap();
    assert_eq!(
        state.get("dont-use-cmake-configure"),
        Some(&OptionValue::Bool(true))
    );
}

#[test]
fn exclusion_still_saves_other_units() {
    let fx = Fixture::new();
    let build = ScriptedBuild::new(vec![Attempt {
        failures: vec![
            (drv("aaa", "1.0"), "No module named 'setuptools'".to_owned()),
            (
                drv("oldpkg", "0.3"),
                "SyntaxError: Missing parentheses in call to 'print'".to_owned(),
            ),
        ],
        ..Attempt::default()
    }]);
    let vcs = RecordingVcs::default();
    let sources = NoSources::default();

    let outcome = fx.orchestrator(&build, &vcs, &sources, 10).run().unwrap();

    assert!(
        matches!(&outcome, RunOutcome::Excluded { unit, .. } if unit == &UnitId::new("oldpkg", "0.3")),
        "{outcome:?}"
    );
    let other = fx.repo.load_state(&UnitId::new("aaa", "1.0")).unwrap();
    assert_eq!(
        other.get("build-systems"),
        Some(&OptionValue::strings(["setuptools"]))
    );
    assert!(fx.artifact("aaa", "1.0").contains("final.setuptools"));
}

#[test]
fn rewrite_without_manual_root_keeps_existing_copy() {
    let fx = Fixture::new();
    let unit = UnitId::new("foo", "1.0");
    let mut dir = std::collections::BTreeMap::new();
    dir.insert("dir".to_owned(), OptionValue::Str("foo/1.0".into()));
    let mut state = hammer::model::RuleState::new();
    state.insert("manual-overrides", OptionValue::Map(dir));
    fx.repo.write_unit(&unit, &state, None).unwrap();
    let manual = fx.repo.unit_dir(&unit).join("manual");
    std::fs::create_dir_all(&manual).unwrap();
    std::fs::write(manual.join("default.nix"), "{ ... }: old: { }\n").unwrap();

    let vcs = RecordingVcs::default();
    let sources = NoSources::default();
    let ctx = RuleContext {
        manual_root: None,
        sources: &sources,
    };

    assert_eq!(rewrite_overrides(&fx.repo, &ctx, &vcs).unwrap(), 1);
    assert!(fx.artifact("foo", "1.0").contains("import ./manual"));
    assert!(manual.join("default.nix").is_file());
}
