//! Package versions and version specifiers.
//!
//! A deliberately small subset of PEP 440: enough to order release numbers,
//! recognise pre-releases, and evaluate specifier sets such as
//! `>=3.8,<3.12` or `==3.11.*`.

use std::cmp::Ordering;
use std::fmt;

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Dev,
    Alpha,
    Beta,
    Candidate,
    Final,
    Post,
}

/// A parsed version number.
#[derive(Clone, Debug)]
pub struct Version {
    release: Vec<u64>,
    phase: Phase,
    phase_number: u64,
    raw: String,
}

impl Version {
    /// Parse a version string. Returns `None` when there is no leading
    /// release number.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        let mut rest = lower.strip_prefix('v').unwrap_or(&lower);
        if let Some((epoch, tail)) = rest.split_once('!') {
            if epoch.chars().all(|c| c.is_ascii_digit()) {
                rest = tail;
            }
        }
        // local version labels never affect ordering here
        let rest = rest.split('+').next().unwrap_or(rest);

        let split = rest
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map_or(rest.len(), |(i, _)| i);
        let (numbers, suffix) = rest.split_at(split);
        let release: Vec<u64> = numbers
            .trim_end_matches('.')
            .split('.')
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if release.is_empty() {
            return None;
        }

        let suffix = suffix.trim_start_matches(['.', '-', '_']);
        let (phase, phase_number) = parse_suffix(suffix);
        Some(Self {
            release,
            phase,
            phase_number,
            raw: trimmed.to_owned(),
        })
    }

    /// Whether this is an alpha, beta, candidate or development release.
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        self.phase < Phase::Final
    }

    /// Release components (`3.12.1` → `[3, 12, 1]`).
    #[must_use]
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    /// The text this version was parsed from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn component(&self, i: usize) -> u64 {
        self.release.get(i).copied().unwrap_or(0)
    }

    fn cmp_release(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Whether the release starts with `prefix` (for `==X.Y.*`).
    fn has_prefix(&self, prefix: &Self) -> bool {
        (0..prefix.release.len()).all(|i| self.component(i) == prefix.component(i))
    }
}

fn parse_suffix(suffix: &str) -> (Phase, u64) {
    const PHASES: &[(&str, Phase)] = &[
        ("alpha", Phase::Alpha),
        ("beta", Phase::Beta),
        ("preview", Phase::Candidate),
        ("pre", Phase::Candidate),
        ("post", Phase::Post),
        ("rev", Phase::Post),
        ("dev", Phase::Dev),
        ("rc", Phase::Candidate),
        ("a", Phase::Alpha),
        ("b", Phase::Beta),
        ("c", Phase::Candidate),
        ("r", Phase::Post),
    ];
    if suffix.is_empty() {
        return (Phase::Final, 0);
    }
    for (tag, phase) in PHASES {
        if let Some(tail) = suffix.strip_prefix(tag) {
            let digits: String = tail
                .trim_start_matches(['.', '-', '_'])
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            return (*phase, digits.parse().unwrap_or(0));
        }
    }
    // unknown trailing text: treat as a development build
    (Phase::Dev, 0)
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_release(other)
            .then(self.phase.cmp(&other.phase))
            .then(self.phase_number.cmp(&other.phase_number))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// Specifiers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Eq,
    NotEq,
    Ge,
    Le,
    Gt,
    Lt,
    Compatible,
    Identical,
}

#[derive(Clone, Debug)]
struct Clause {
    op: Op,
    version: Version,
    wildcard: bool,
}

impl Clause {
    fn parse(text: &str) -> Option<Self> {
        const OPS: &[(&str, Op)] = &[
            ("===", Op::Identical),
            ("==", Op::Eq),
            ("!=", Op::NotEq),
            (">=", Op::Ge),
            ("<=", Op::Le),
            ("~=", Op::Compatible),
            (">", Op::Gt),
            ("<", Op::Lt),
        ];
        let text = text.trim();
        let (op, rest) = OPS
            .iter()
            .find_map(|(sym, op)| text.strip_prefix(sym).map(|rest| (*op, rest.trim())))?;
        let (body, wildcard) = rest
            .strip_suffix(".*")
            .map_or((rest, false), |body| (body, true));
        Some(Self {
            op,
            version: Version::parse(body)?,
            wildcard,
        })
    }

    fn contains(&self, v: &Version) -> bool {
        match self.op {
            Op::Eq if self.wildcard => v.has_prefix(&self.version),
            Op::NotEq if self.wildcard => !v.has_prefix(&self.version),
            Op::Eq => v == &self.version,
            Op::NotEq => v != &self.version,
            Op::Ge => v >= &self.version,
            Op::Le => v <= &self.version,
            Op::Gt => v > &self.version,
            Op::Lt => v < &self.version,
            Op::Identical => v.as_str() == self.version.as_str(),
            Op::Compatible => {
                let n = self.version.release.len().saturating_sub(1).max(1);
                let prefix = Version {
                    release: self.version.release[..n.min(self.version.release.len())].to_vec(),
                    phase: Phase::Final,
                    phase_number: 0,
                    raw: String::new(),
                };
                v >= &self.version && v.has_prefix(&prefix)
            }
        }
    }
}

/// A comma-separated set of version clauses, all of which must hold.
#[derive(Clone, Debug)]
pub struct SpecifierSet {
    clauses: Vec<Clause>,
}

impl SpecifierSet {
    /// Parse `>=3.8,<3.12`. An empty string is the unconstrained set.
    /// Returns `None` when any clause is malformed.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let clauses = text
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(Clause::parse)
            .collect::<Option<Vec<_>>>()?;
        Some(Self { clauses })
    }

    /// Whether `version` satisfies every clause.
    #[must_use]
    pub fn contains(&self, version: &Version) -> bool {
        self.clauses.iter().all(|c| c.contains(version))
    }
}
