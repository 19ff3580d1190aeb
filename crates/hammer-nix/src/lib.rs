//! Nix expression layer for uv2nix-hammer.
//!
//! Every generated override file goes through this crate: rule decisions are
//! lowered into [`NixValue`]s, rendered to text with [`render`], and the
//! finished file is checked with [`check_syntax`] before it is written.
//!
//! # Crate layout
//!
//! - [`value`]: the [`NixValue`] tree (including the raw-code and
//!   file-relative path markers that bypass string quoting).
//! - [`render`]: deterministic pretty printer (sorted attribute keys).
//! - [`syntax`]: lexical round-trip check for rendered files.
//! - [`error`]: the [`NixError`] enum.

pub mod error;
pub mod render;
pub mod syntax;
pub mod value;

pub use error::NixError;
pub use render::{identifier, render, render_at, render_string};
pub use syntax::check_syntax;
pub use value::NixValue;
