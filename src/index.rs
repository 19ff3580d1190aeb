//! Package-index lookups (the PyPI JSON API), cached on disk.
//!
//! Responses are stored per package under the user cache directory
//! (`~/.cache/uv2nix-hammer/index/<name>.json`) together with the time they
//! were fetched. A cached document younger than the freshness window is used
//! without touching the network.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::PackageName;
use crate::version::Version;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// One distribution file of a release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFile {
    /// File name.
    pub filename: String,
    /// Download URL.
    pub url: String,
    /// `sdist` or `bdist_wheel`.
    #[serde(default)]
    pub packagetype: String,
    /// Whether the file was yanked.
    #[serde(default)]
    pub yanked: bool,
    /// Upload time.
    #[serde(default)]
    pub upload_time_iso_8601: Option<DateTime<Utc>>,
}

impl ReleaseFile {
    fn is_sdist(&self) -> bool {
        self.packagetype == "sdist"
            || self.url.ends_with(".tar.gz")
            || self.filename.ends_with(".tar.gz")
    }
}

/// The subset of the JSON API response we use.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDocument {
    /// Version → files.
    #[serde(default)]
    pub releases: BTreeMap<String, Vec<ReleaseFile>>,
}

/// A release picked for a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRelease {
    /// Version as listed on the index.
    pub version: String,
    /// Whether a source distribution exists.
    pub has_sdist: bool,
}

impl ProjectDocument {
    /// The requested release, or the newest stable one when `requested` is
    /// `None`. `None` when no such release exists.
    #[must_use]
    pub fn resolve(&self, requested: Option<&str>) -> Option<ResolvedRelease> {
        let version = match requested {
            Some(v) => self
                .releases
                .keys()
                .find(|raw| raw.as_str() == v)
                .or_else(|| {
                    let wanted = Version::parse(v)?;
                    self.releases
                        .keys()
                        .find(|raw| Version::parse(raw).is_some_and(|r| r == wanted))
                })?
                .clone(),
            None => self.newest_stable()?,
        };
        Some(ResolvedRelease {
            has_sdist: self.has_sdist(&version),
            version,
        })
    }

    /// Whether `version` was published (yanked or not).
    #[must_use]
    pub fn has_version(&self, version: &str) -> bool {
        self.release_files(version).is_some()
    }

    /// Newest release that has files, is not a pre-release, and is not fully
    /// yanked.
    #[must_use]
    pub fn newest_stable(&self) -> Option<String> {
        self.releases
            .iter()
            .filter(|(_, files)| !files.is_empty() && files.iter().any(|f| !f.yanked))
            .filter_map(|(raw, _)| Version::parse(raw).map(|v| (v, raw)))
            .filter(|(v, _)| !v.is_prerelease())
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, raw)| raw.clone())
    }

    /// Whether `version` ships a source distribution.
    #[must_use]
    pub fn has_sdist(&self, version: &str) -> bool {
        self.release_files(version)
            .is_some_and(|files| files.iter().any(ReleaseFile::is_sdist))
    }

    /// When the first file of `version` was uploaded.
    #[must_use]
    pub fn uploaded_at(&self, version: &str) -> Option<DateTime<Utc>> {
        self.release_files(version)?
            .iter()
            .filter_map(|f| f.upload_time_iso_8601)
            .min()
    }

    fn release_files(&self, version: &str) -> Option<&[ReleaseFile]> {
        if let Some(files) = self.releases.get(version) {
            return Some(files);
        }
        // `1.0` and `1.0.0` name the same release
        let wanted = Version::parse(version)?;
        self.releases
            .iter()
            .find(|(raw, _)| Version::parse(raw).is_some_and(|v| v == wanted))
            .map(|(_, files)| files.as_slice())
    }
}

#[derive(Serialize, Deserialize)]
struct CachedDocument {
    fetched_at: DateTime<Utc>,
    document: ProjectDocument,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Package-index failures.
#[derive(Debug)]
pub enum IndexError {
    /// The index does not know the package.
    NotFound {
        /// Package name as requested.
        package: String,
    },
    /// The HTTP request failed.
    Http {
        /// Requested URL.
        url: String,
        /// Transport or status detail.
        detail: String,
    },
    /// The cache could not be read or written.
    Cache {
        /// Cache file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { package } => write!(f, "package '{package}' is not on the index"),
            Self::Http { url, detail } => write!(f, "index request {url} failed: {detail}"),
            Self::Cache { path, source } => {
                write!(f, "index cache {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Cached JSON API client.
#[derive(Debug)]
pub struct PackageIndex {
    base_url: String,
    cache_dir: PathBuf,
    freshness: Duration,
}

impl PackageIndex {
    /// Client for `base_url` caching into `cache_dir`.
    #[must_use]
    pub fn new(base_url: &str, cache_dir: PathBuf, cache_hours: u32) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            cache_dir,
            freshness: Duration::hours(i64::from(cache_hours)),
        }
    }

    /// The default cache location (`<user cache dir>/uv2nix-hammer/index`),
    /// falling back to the system temp directory.
    #[must_use]
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("uv2nix-hammer")
            .join("index")
    }

    fn cache_path(&self, package: &PackageName) -> PathBuf {
        self.cache_dir.join(format!("{package}.json"))
    }

    /// Project document for `package`, from cache when fresh.
    ///
    /// # Errors
    /// [`IndexError`] when the package is unknown, the request fails, or the
    /// cache cannot be written.
    #[tracing::instrument(skip(self))]
    pub fn project(&self, package: &str) -> Result<ProjectDocument, IndexError> {
        let name = PackageName::new(package);
        let path = self.cache_path(&name);
        if let Some(cached) = self.read_cache(&path, Utc::now()) {
            tracing::debug!(path = %path.display(), "index cache hit");
            return Ok(cached);
        }
        let document = self.fetch(package, &name)?;
        write_cache(&path, &document)?;
        Ok(document)
    }

    fn read_cache(&self, path: &Path, now: DateTime<Utc>) -> Option<ProjectDocument> {
        let text = std::fs::read_to_string(path).ok()?;
        let cached: CachedDocument = match serde_json::from_str(&text) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable index cache");
                return None;
            }
        };
        (now - cached.fetched_at < self.freshness).then_some(cached.document)
    }

    fn fetch(&self, package: &str, name: &PackageName) -> Result<ProjectDocument, IndexError> {
        let url = format!("{}/{name}/json", self.base_url);
        tracing::info!(%url, "querying package index");
        let http = |detail: String| IndexError::Http {
            url: url.clone(),
            detail,
        };
        let response = reqwest::blocking::get(&url).map_err(|e| http(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(IndexError::NotFound {
                package: package.to_owned(),
            });
        }
        let response = response.error_for_status().map_err(|e| http(e.to_string()))?;
        response
            .json::<ProjectDocument>()
            .map_err(|e| http(e.to_string()))
    }
}

fn write_cache(path: &Path, document: &ProjectDocument) -> Result<(), IndexError> {
    let cache_err = |source: std::io::Error| IndexError::Cache {
        path: path.to_owned(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(cache_err)?;
    }
    let cached = CachedDocument {
        fetched_at: Utc::now(),
        document: document.clone(),
    };
    let text = serde_json::to_string(&cached).map_err(|e| cache_err(std::io::Error::other(e)))?;
    std::fs::write(path, text).map_err(cache_err)
}
