//! Log normalizer: turn a raw build-tool run log into per-unit failures.
//!
//! The build tool reports each failing derivation with a fixed line
//! (`error: builder for '/nix/store/…drv' failed …`, or the newer
//! `error: Cannot build '/nix/store/…drv'.`). The unit's own log is then
//! fetched separately, keyed on the same store path. Terminal control
//! sequences are stripped from both before any rule sees them.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::UnitId;

static ANSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:\[[0-9;?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])")
        .expect("static regex")
});

static FAILED_BUILDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"error: (?:builder for|Cannot build) '(/nix/store/[^']+\.drv)'")
        .expect("static regex")
});

/// One failing build unit from one attempt. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    /// Store path of the failing derivation.
    pub drv: String,
    /// The unit it builds.
    pub unit: UnitId,
    /// The unit's own build log, control sequences removed.
    pub log: String,
}

/// Remove ANSI/OSC escape sequences and carriage-return overwrites.
#[must_use]
pub fn strip_control(text: &str) -> String {
    let stripped = ANSI.replace_all(text, "");
    stripped
        .lines()
        .map(|line| line.rsplit('\r').next().unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Store paths of every failing derivation, in first-seen order, deduplicated.
#[must_use]
pub fn failed_derivations(run_log: &str) -> Vec<String> {
    let clean = strip_control(run_log);
    let mut seen = Vec::new();
    for cap in FAILED_BUILDER.captures_iter(&clean) {
        let drv = cap[1].to_owned();
        if !seen.contains(&drv) {
            seen.push(drv);
        }
    }
    seen
}

/// Build failure records for every failing derivation in `run_log`.
///
/// `fetch_log` retrieves a derivation's own log (the second lookup of the
/// build-log contract). Derivations whose store name cannot be mapped to a
/// unit are skipped with a warning; they are usually wrappers such as the
/// project environment itself, which fail only because a dependency did.
///
/// # Errors
/// Propagates the first error returned by `fetch_log`.
pub fn collect_failures<E>(
    run_log: &str,
    mut fetch_log: impl FnMut(&str) -> Result<String, E>,
) -> Result<Vec<FailureRecord>, E> {
    let mut records = Vec::new();
    for drv in failed_derivations(run_log) {
        let Some(unit) = UnitId::from_drv(&drv) else {
            tracing::warn!(%drv, "could not derive package and version from derivation");
            continue;
        };
        let log = strip_control(&fetch_log(&drv)?);
        tracing::debug!(%unit, %drv, bytes = log.len(), "collected failure log");
        records.push(FailureRecord { drv, unit, log });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(
            strip_control("\x1b[31;1merror:\x1b[0m builder failed"),
            "error: builder failed"
        );
    }

    #[test]
    fn strips_osc_and_carriage_returns() {
        assert_eq!(
            strip_control("\x1b]0;title\x07progress 10%\rprogress 100%\nnext"),
            "progress 100%\nnext"
        );
    }

    #[test]
    fn finds_both_failure_formats() {
        let log = "\
error: builder for '/nix/store/aaa-python3.12-foo-1.0.drv' failed with exit code 1;
       last 10 log lines:
error: Cannot build '/nix/store/bbb-python3.12-bar-2.0.drv'.
error: builder for '/nix/store/aaa-python3.12-foo-1.0.drv' failed with exit code 1;
";
        assert_eq!(
            failed_derivations(log),
            vec![
                "/nix/store/aaa-python3.12-foo-1.0.drv".to_owned(),
                "/nix/store/bbb-python3.12-bar-2.0.drv".to_owned(),
            ]
        );
    }

    #[test]
    fn finds_failures_through_color_codes() {
        let log = "\x1b[31;1merror:\x1b[0m builder for '\x1b[35;1m/nix/store/aaa-python3.12-foo-1.0.drv\x1b[0m' failed";
        assert_eq!(failed_derivations(log).len(), 1);
    }

    #[test]
    fn no_failures_in_clean_log() {
        assert!(failed_derivations("building '/nix/store/x.drv'...\n").is_empty());
    }

    #[test]
    fn collects_records_and_skips_unmappable() {
        let log = "\
error: builder for '/nix/store/aaa-python3.12-foo-1.0.drv' failed
error: builder for '/nix/store/ccc-env.drv' failed
";
        let records = collect_failures(log, |drv| {
            Ok::<_, std::convert::Infallible>(format!("\x1b[1mlog of {drv}\x1b[0m"))
        })
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].unit, UnitId::new("foo", "1.0"));
        assert_eq!(
            records[0].log,
            "log of /nix/store/aaa-python3.12-foo-1.0.drv"
        );
    }

    #[test]
    fn fetch_errors_propagate() {
        let log = "error: builder for '/nix/store/aaa-python3.12-foo-1.0.drv' failed";
        let result = collect_failures(log, |_| Err::<String, _>("boom"));
        assert_eq!(result, Err("boom"));
    }
}
