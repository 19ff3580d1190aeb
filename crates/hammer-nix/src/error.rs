//! Error types for the Nix expression layer.

use thiserror::Error;

/// Errors produced while checking rendered Nix text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NixError {
    /// A closing delimiter did not match the innermost open one.
    #[error("line {line}: unexpected `{found}` (expected `{expected}`)")]
    MismatchedDelimiter {
        /// 1-based line of the offending character.
        line: usize,
        /// The closing delimiter that was found.
        found: char,
        /// The closing delimiter that would have balanced the open one.
        expected: char,
    },

    /// A closing delimiter appeared with nothing open.
    #[error("line {line}: unbalanced `{found}`")]
    Unbalanced {
        /// 1-based line of the offending character.
        line: usize,
        /// The stray delimiter.
        found: char,
    },

    /// A string, indented string or comment was never closed.
    #[error("line {line}: unterminated {what}")]
    Unterminated {
        /// 1-based line where the construct was opened.
        line: usize,
        /// Which construct ("string", "indented string", "comment", "`(`", ...).
        what: String,
    },

    /// The text is empty or contains only whitespace and comments.
    #[error("empty expression")]
    Empty,
}
