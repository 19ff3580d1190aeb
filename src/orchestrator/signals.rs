//! Terminal signals: build output that maps straight to a control outcome
//! instead of a rule pass.

use std::sync::LazyLock;

use regex::Regex;

use crate::lognorm::strip_control;

static MISSING_OPTIONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Missing optional dependency '([A-Za-z0-9_.\-]+)'").expect("static regex")
});

static DIFFERENT_PYTHON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"requires a different Python: ([0-9][0-9.]*) not in '([^']*)'")
        .expect("static regex")
});

const INFINITE_RECURSION: &str = "infinite recursion encountered";

const INVALID_SYNTAX: &[&str] = &["syntax error, unexpected", "while evaluating the attribute"];

/// A recognised terminal signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// The build tool could not evaluate the generated overrides.
    InvalidSyntax {
        /// The line that matched.
        line: String,
    },
    /// Evaluation recursed without bound (usually a dependency cycle).
    InfiniteRecursion,
    /// A package needs an optional dependency declared explicitly.
    MissingOptionalDependency {
        /// Dependency name as printed.
        name: String,
    },
    /// A package refuses the project's Python version.
    IncompatiblePython {
        /// The interpreter version that was rejected.
        version: String,
        /// The package's `requires-python`.
        spec: String,
    },
}

/// Classify one attempt's stderr.
///
/// Infinite recursion is checked first: its evaluation trace also contains
/// the generic "while evaluating" lines.
#[must_use]
pub fn classify(stderr: &str) -> Option<Signal> {
    let text = strip_control(stderr);
    if text.contains(INFINITE_RECURSION) {
        return Some(Signal::InfiniteRecursion);
    }
    if let Some(cap) = MISSING_OPTIONAL.captures(&text) {
        return Some(Signal::MissingOptionalDependency {
            name: cap[1].to_owned(),
        });
    }
    if let Some(cap) = DIFFERENT_PYTHON.captures(&text) {
        return Some(Signal::IncompatiblePython {
            version: cap[1].trim_end_matches('.').to_owned(),
            spec: cap[2].to_owned(),
        });
    }
    text.lines()
        .find(|line| INVALID_SYNTAX.iter().any(|needle| line.contains(needle)))
        .map(|line| Signal::InvalidSyntax {
            line: line.trim().to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_build_failure_is_not_a_signal() {
        assert_eq!(
            classify("error: builder for '/nix/store/x-foo-1.0.drv' failed with exit code 1"),
            None
        );
    }

    #[test]
    fn recursion_wins_over_evaluation_trace() {
        let log = "\
       … while evaluating the attribute 'propagatedBuildInputs'
       error: infinite recursion encountered
";
        assert_eq!(classify(log), Some(Signal::InfiniteRecursion));
    }

    #[test]
    fn missing_optional_dependency() {
        assert_eq!(
            classify("ImportError: Missing optional dependency 'tabulate'.  Use pip or conda"),
            Some(Signal::MissingOptionalDependency {
                name: "tabulate".into()
            })
        );
    }

    #[test]
    fn incompatible_python() {
        let log = "ERROR: Package 'foo' requires a different Python: 3.12.3 not in '<3.12,>=3.8'";
        assert_eq!(
            classify(log),
            Some(Signal::IncompatiblePython {
                version: "3.12.3".into(),
                spec: "<3.12,>=3.8".into()
            })
        );
    }

    #[test]
    fn invalid_syntax() {
        let log = "error: syntax error, unexpected '}', expecting ';'\n       at /nix/store/x/default.nix:3:1";
        assert!(matches!(
            classify(log),
            Some(Signal::InvalidSyntax { line }) if line.starts_with("error: syntax error")
        ));
    }

    #[test]
    fn colored_output_is_classified() {
        assert_eq!(
            classify("\x1b[31;1merror:\x1b[0m infinite recursion encountered"),
            Some(Signal::InfiniteRecursion)
        );
    }
}
