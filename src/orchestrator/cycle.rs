//! Cycle breaking over the project's lock graph.
//!
//! When evaluation recurses without bound, the usual cause is a pair of
//! packages that propagate each other. The lock file (`uv.lock`) records the
//! resolved dependency graph; we find one cycle in it and cut its first edge
//! by dropping the dependency from the source package's propagated inputs.
//! Edges cut earlier are removed from the graph first, so a cycle that
//! survives one cut yields the next edge.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::model::{PackageName, UnitId};

// ---------------------------------------------------------------------------
// Lock file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LockFile {
    #[serde(default)]
    package: Vec<LockPackage>,
}

#[derive(Debug, Deserialize)]
struct LockPackage {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    dependencies: Vec<LockDependency>,
}

#[derive(Debug, Deserialize)]
struct LockDependency {
    name: String,
}

/// Errors reading the lock graph.
#[derive(Debug)]
pub enum LockGraphError {
    /// The lock file could not be read.
    Read {
        /// Lock file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The lock file is not valid TOML of the expected shape.
    Parse {
        /// Lock file path.
        path: PathBuf,
        /// Parser message.
        detail: String,
    },
}

impl fmt::Display for LockGraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "read {}: {source}", path.display()),
            Self::Parse { path, detail } => write!(f, "parse {}: {detail}", path.display()),
        }
    }
}

impl std::error::Error for LockGraphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Resolved dependency graph: package → (version, dependencies).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockGraph {
    versions: BTreeMap<PackageName, String>,
    edges: BTreeMap<PackageName, BTreeSet<PackageName>>,
}

/// One severed edge: `unit` stops propagating `dependency`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleBreak {
    /// The package whose propagated inputs lose an entry.
    pub unit: UnitId,
    /// Normalized name of the dropped dependency.
    pub dependency: String,
    /// The whole cycle, starting at `unit`.
    pub cycle: Vec<PackageName>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Active,
    Done,
}

impl LockGraph {
    /// Parse `uv.lock` text.
    ///
    /// # Errors
    /// [`LockGraphError::Parse`] on malformed input.
    pub fn parse(text: &str, path: &Path) -> Result<Self, LockGraphError> {
        let lock: LockFile = toml::from_str(text).map_err(|e| LockGraphError::Parse {
            path: path.to_owned(),
            detail: e.message().to_owned(),
        })?;
        let mut graph = Self::default();
        for package in lock.package {
            let name = PackageName::new(&package.name);
            graph
                .versions
                .entry(name.clone())
                .or_insert(package.version);
            graph
                .edges
                .entry(name)
                .or_default()
                .extend(package.dependencies.iter().map(|d| PackageName::new(&d.name)));
        }
        Ok(graph)
    }

    /// Read and parse the lock file at `path`.
    ///
    /// # Errors
    /// [`LockGraphError`] when the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self, LockGraphError> {
        let text = std::fs::read_to_string(path).map_err(|source| LockGraphError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Remove the edge `from -> to`, if present.
    pub fn cut(&mut self, from: &PackageName, to: &PackageName) {
        if let Some(deps) = self.edges.get_mut(from) {
            deps.remove(to);
        }
    }

    /// Number of packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no packages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// First cycle found by a depth-first search visiting packages and
    /// dependencies in sorted order. The result starts at the node where the
    /// cycle was entered.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<PackageName>> {
        let mut marks: BTreeMap<&PackageName, Mark> = BTreeMap::new();
        for start in self.edges.keys() {
            if marks.contains_key(start) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a PackageName,
        marks: &mut BTreeMap<&'a PackageName, Mark>,
        path: &mut Vec<&'a PackageName>,
    ) -> Option<Vec<PackageName>> {
        marks.insert(node, Mark::Active);
        path.push(node);
        for next in self.edges.get(node).into_iter().flatten() {
            match marks.get(next).copied() {
                Some(Mark::Active) => {
                    let from = path.iter().position(|n| *n == next).unwrap_or(0);
                    return Some(path[from..].iter().map(|n| (*n).clone()).collect());
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    /// Find a cycle and choose the edge to cut: from the cycle's first node
    /// to its second.
    #[must_use]
    pub fn break_cycle(&self) -> Option<CycleBreak> {
        let cycle = self.find_cycle()?;
        let source = cycle.first()?;
        let target = cycle.get(1).unwrap_or(source);
        let version = self.versions.get(source).cloned().unwrap_or_default();
        let unit = UnitId::new(source.as_str(), &version);
        let dependency = target.to_string();
        Some(CycleBreak {
            unit,
            dependency,
            cycle,
        })
    }
}
