//! The Nix value tree rendered into override files.

use std::collections::BTreeMap;

/// A Nix value as emitted by the override generator.
///
/// Attribute sets use a [`BTreeMap`] so rendering order is always the sorted
/// key order. [`NixValue::Literal`] and [`NixValue::Path`] bypass string
/// quoting: the former is emitted verbatim as code, the latter as a path
/// relative to the file it ends up in.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NixValue {
    /// `null`
    Null,
    /// `true` / `false`
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// A string, quoted on render (indented-string form if multi-line).
    Str(String),
    /// A file-relative path (`./<value>`).
    Path(String),
    /// Raw code, emitted as-is.
    Literal(String),
    /// `[ a b c ]`
    List(Vec<NixValue>),
    /// `{ k = v; }` with sorted keys.
    Attrs(BTreeMap<String, NixValue>),
}

impl NixValue {
    /// Convenience constructor for raw code.
    #[must_use]
    pub fn literal(code: impl Into<String>) -> Self {
        Self::Literal(code.into())
    }

    /// Convenience constructor for a quoted string.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// Returns `true` for empty lists and empty attribute sets.
    #[must_use]
    pub fn is_empty_collection(&self) -> bool {
        match self {
            Self::List(items) => items.is_empty(),
            Self::Attrs(attrs) => attrs.is_empty(),
            _ => false,
        }
    }
}

impl From<bool> for NixValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for NixValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for NixValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for NixValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl<T: Into<Self>> From<Vec<T>> for NixValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Self>> for NixValue {
    fn from(attrs: BTreeMap<String, Self>) -> Self {
        Self::Attrs(attrs)
    }
}
