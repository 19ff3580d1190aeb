//! Rule option values: what a rule decided for one unit.
//!
//! [`OptionValue`] is a closed sum type. It must compare by value (equality
//! between the previous and the new decision is how progress is detected)
//! and survive a round trip through the TOML state file, including the three
//! marker variants that are not plain data:
//!
//! - [`OptionValue::Literal`]: raw Nix code, emitted unquoted,
//! - [`OptionValue::Path`]: a path relative to the generated artifact,
//! - [`OptionValue::Deferred`]: a file a rule still has to extract.
//!
//! On disk the markers are single-key tables (`{ "$literal" = "pkgs.zlib" }`),
//! so ordinary maps may not use keys starting with `$`.

use std::collections::BTreeMap;
use std::fmt;

use hammer_nix::NixValue;
use serde::{Deserialize, Serialize};

const LITERAL_KEY: &str = "$literal";
const PATH_KEY: &str = "$path";
const DEFERRED_KEY: &str = "$deferred";

/// A rule's decision for one unit.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawValue", into = "RawValue")]
pub enum OptionValue {
    /// A flag.
    Bool(bool),
    /// Plain text.
    Str(String),
    /// Raw Nix code.
    Literal(String),
    /// A path relative to the generated artifact.
    Path(String),
    /// A file that must be extracted next to the artifact before it is usable.
    Deferred(String),
    /// An ordered list.
    List(Vec<OptionValue>),
    /// A string-keyed mapping.
    Map(BTreeMap<String, OptionValue>),
}

impl OptionValue {
    /// Build a list of literals from code snippets.
    #[must_use]
    pub fn literals<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(items.into_iter().map(|s| Self::Literal(s.into())).collect())
    }

    /// Build a list of plain strings.
    #[must_use]
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(items.into_iter().map(|s| Self::Str(s.into())).collect())
    }

    /// Borrow the list items, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the text of a `Str`, `Literal`, `Path` or `Deferred` value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Literal(s) | Self::Path(s) | Self::Deferred(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the map entries, if this is a map.
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// `true` if this is a list containing `item`.
    #[must_use]
    pub fn list_contains(&self, item: &Self) -> bool {
        self.as_list().is_some_and(|items| items.contains(item))
    }

    /// The text of every `Str`/`Literal` item of a list value.
    #[must_use]
    pub fn list_texts(&self) -> Vec<String> {
        self.as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.as_text().map(str::to_owned))
            .collect()
    }

    /// Lower into a Nix value. A deferred file renders as the path it will
    /// be extracted to.
    #[must_use]
    pub fn to_nix(&self) -> NixValue {
        match self {
            Self::Bool(b) => NixValue::Bool(*b),
            Self::Str(s) => NixValue::Str(s.clone()),
            Self::Literal(s) => NixValue::Literal(s.clone()),
            Self::Path(p) | Self::Deferred(p) => NixValue::Path(p.clone()),
            Self::List(items) => NixValue::List(items.iter().map(Self::to_nix).collect()),
            Self::Map(map) => {
                NixValue::Attrs(map.iter().map(|(k, v)| (k.clone(), v.to_nix())).collect())
            }
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Literal(s) => write!(f, "literal({s})"),
            Self::Path(s) => write!(f, "path({s})"),
            Self::Deferred(s) => write!(f, "deferred({s})"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk representation
// ---------------------------------------------------------------------------

/// The untagged shape TOML and JSON can express directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Bool(bool),
    Str(String),
    List(Vec<RawValue>),
    Table(BTreeMap<String, RawValue>),
}

/// Error converting an on-disk value into an [`OptionValue`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptionValueError(String);

impl fmt::Display for OptionValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for OptionValueError {}

impl TryFrom<RawValue> for OptionValue {
    type Error = OptionValueError;

    fn try_from(raw: RawValue) -> Result<Self, Self::Error> {
        Ok(match raw {
            RawValue::Bool(b) => Self::Bool(b),
            RawValue::Str(s) => Self::Str(s),
            RawValue::List(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            RawValue::Table(table) => {
                if table.len() == 1 {
                    if let Some(marker) = marker_from_table(&table)? {
                        return Ok(marker);
                    }
                }
                if let Some(key) = table.keys().find(|k| k.starts_with('$')) {
                    return Err(OptionValueError(format!(
                        "unknown marker key '{key}' in rule option table"
                    )));
                }
                Self::Map(
                    table
                        .into_iter()
                        .map(|(k, v)| Self::try_from(v).map(|v| (k, v)))
                        .collect::<Result<_, _>>()?,
                )
            }
        })
    }
}

fn marker_from_table(
    table: &BTreeMap<String, RawValue>,
) -> Result<Option<OptionValue>, OptionValueError> {
    let Some((key, value)) = table.iter().next() else {
        return Ok(None);
    };
    let make: fn(String) -> OptionValue = match key.as_str() {
        LITERAL_KEY => OptionValue::Literal,
        PATH_KEY => OptionValue::Path,
        DEFERRED_KEY => OptionValue::Deferred,
        _ => return Ok(None),
    };
    match value {
        RawValue::Str(s) => Ok(Some(make(s.clone()))),
        _ => Err(OptionValueError(format!(
            "marker '{key}' must hold a string"
        ))),
    }
}

impl From<OptionValue> for RawValue {
    fn from(value: OptionValue) -> Self {
        let marker = |key: &str, s: String| {
            let mut table = BTreeMap::new();
            table.insert(key.to_owned(), Self::Str(s));
            Self::Table(table)
        };
        match value {
            OptionValue::Bool(b) => Self::Bool(b),
            OptionValue::Str(s) => Self::Str(s),
            OptionValue::Literal(s) => marker(LITERAL_KEY, s),
            OptionValue::Path(s) => marker(PATH_KEY, s),
            OptionValue::Deferred(s) => marker(DEFERRED_KEY, s),
            OptionValue::List(items) => Self::List(items.into_iter().map(Into::into).collect()),
            OptionValue::Map(map) => {
                Self::Table(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}
