//! Source-archive inspection via `tar` and `unzip`.
//!
//! [`ArchiveInspector`] resolves a derivation to its source archive through
//! the [`BuildTool`], then lists and reads members with the system archive
//! tools. Every lookup is memoized for the lifetime of the inspector, so a
//! rule may ask the same question on every pass without repeating work.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use super::{BackendError, BuildTool, SourceInspector, run_checked};

/// Archive formats we can look into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Any tarball `tar` can auto-detect (`.tar.gz`, `.tgz`, `.tar.bz2`, `.tar.xz`).
    Tar,
    /// A zip file.
    Zip,
    /// A prebuilt wheel; never inspected.
    Wheel,
}

impl ArchiveKind {
    /// Classify a source path by extension.
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".whl") {
            Some(Self::Wheel)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if [".tar.gz", ".tgz", ".tar.bz2", ".tar.xz", ".tar"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

type FileKey = (String, String);

/// [`SourceInspector`] backed by a build tool and the system archivers.
pub struct ArchiveInspector<'a> {
    tool: &'a dyn BuildTool,
    sources: RefCell<HashMap<String, String>>,
    files: RefCell<HashMap<FileKey, Option<Vec<u8>>>>,
}

impl<'a> ArchiveInspector<'a> {
    /// Inspector resolving sources through `tool`.
    #[must_use]
    pub fn new(tool: &'a dyn BuildTool) -> Self {
        Self {
            tool,
            sources: RefCell::new(HashMap::new()),
            files: RefCell::new(HashMap::new()),
        }
    }

    fn source_of(&self, drv: &str) -> Result<String, BackendError> {
        if let Some(src) = self.sources.borrow().get(drv) {
            return Ok(src.clone());
        }
        let src = self.tool.derivation_source(drv)?;
        self.sources.borrow_mut().insert(drv.to_owned(), src.clone());
        Ok(src)
    }

    fn lookup(&self, drv: &str, name: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let src = self.source_of(drv)?;
        let Some(kind) = ArchiveKind::from_path(&src) else {
            tracing::debug!(%src, "source is not a known archive");
            return Ok(None);
        };
        let members = match kind {
            ArchiveKind::Wheel => return Ok(None),
            ArchiveKind::Tar => list(Command::new("tar").args(["-tf", &src]), "tar -tf")?,
            ArchiveKind::Zip => list(Command::new("unzip").args(["-Z1", &src]), "unzip -Z1")?,
        };
        let Some(member) = shallowest(&members, name) else {
            return Ok(None);
        };
        let mut cmd = match kind {
            ArchiveKind::Tar => {
                let mut c = Command::new("tar");
                c.args(["-xOf", &src, member]);
                c
            }
            ArchiveKind::Zip => {
                let mut c = Command::new("unzip");
                c.args(["-p", &src, member]);
                c
            }
            ArchiveKind::Wheel => return Ok(None),
        };
        cmd.env("LC_ALL", "C");
        let output = run_checked(cmd, &format!("extract {member} from {src}"))?;
        Ok(Some(output.stdout))
    }
}

fn list(cmd: &mut Command, summary: &str) -> Result<Vec<String>, BackendError> {
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
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_owned)
        .collect())
}

/// The shortest member path whose file name is exactly `name`.
fn shallowest<'m>(members: &'m [String], name: &str) -> Option<&'m str> {
    members
        .iter()
        .map(String::as_str)
        .filter(|m| *m == name || m.ends_with(&format!("/{name}")))
        .min_by_key(|m| (m.len(), *m))
}

/// Normalize a `build-system.requires` entry to a package attribute name.
///
/// Drops version specifiers, markers and extras, maps `_` to `-` and
/// lowercases.
#[must_use]
pub fn normalize_requirement(raw: &str) -> String {
    let end = raw.find(['>', '<', '=', '!', '~', ';', '[', ' ']).unwrap_or(raw.len());
    raw[..end].trim().replace('_', "-").to_lowercase()
}

fn parse_build_requires(bytes: &[u8], drv: &str) -> Result<Vec<String>, BackendError> {
    let text = String::from_utf8_lossy(bytes);
    let doc: toml::Value = toml::from_str(&text).map_err(|e| BackendError::Parse {
        context: format!("pyproject.toml of {drv}"),
        detail: e.message().to_owned(),
    })?;
    Ok(doc
        .get("build-system")
        .and_then(|b| b.get("requires"))
        .and_then(toml::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(toml::Value::as_str)
                .map(normalize_requirement)
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default())
}

impl SourceInspector for ArchiveInspector<'_> {
    fn build_requires(&self, drv: &str) -> Result<Option<Vec<String>>, BackendError> {
        match self.read_file(drv, "pyproject.toml")? {
            Some(bytes) => parse_build_requires(&bytes, drv).map(Some),
            None => Ok(None),
        }
    }

    fn read_file(&self, drv: &str, name: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let key = (drv.to_owned(), name.to_owned());
        if let Some(hit) = self.files.borrow().get(&key) {
            return Ok(hit.clone());
        }
        let found = self.lookup(drv, name)?;
        self.files.borrow_mut().insert(key, found.clone());
        Ok(found)
    }

    fn unpack(&self, drv: &str, dest: &Path) -> Result<bool, BackendError> {
        let src = self.source_of(drv)?;
        let mut cmd = match ArchiveKind::from_path(&src) {
            Some(ArchiveKind::Tar) => {
                let mut c = Command::new("tar");
                c.arg("-xf").arg(&src).arg("-C").arg(dest);
                c
            }
            Some(ArchiveKind::Zip) => {
                let mut c = Command::new("unzip");
                c.args(["-q", "-o", &src, "-d"]).arg(dest);
                c
            }
            Some(ArchiveKind::Wheel) | None => {
                tracing::warn!(%src, "unknown archive type, not unpacked");
                return Ok(false);
            }
        };
        std::fs::create_dir_all(dest).map_err(|source| BackendError::Io {
            context: format!("create {}", dest.display()),
            source,
        })?;
        cmd.env("LC_ALL", "C");
        run_checked(cmd, &format!("unpack {src}"))?;
        Ok(true)
    }
}
