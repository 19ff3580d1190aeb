//! Deterministic rule merge and override codegen.
//!
//! Turns one unit's persisted rule state into its `default.nix`:
//!
//! - **strategy**: the per-key merge strategy table ([`strategy::AttrKey`]).
//! - **engine**: apply every decision and fold the results key by key
//!   ([`engine::merge_state`]), detecting conflicts.
//! - **artifact**: render the merged structure and syntax-check it
//!   ([`artifact::render_artifact`]).
//!
//! # Determinism guarantee
//!
//! The same rule state always renders to the same bytes:
//!
//! - Rule state is a sorted map, so rules are applied in name order.
//! - Union keys are sorted sets; their content does not depend on order.
//! - Attribute keys are rendered in sorted order.

pub mod artifact;
pub mod engine;
pub mod error;
pub mod strategy;

pub use artifact::{fingerprint_of, render_artifact};
pub use engine::{MergeOutcome, MergedOverride, Merger, merge_state};
pub use error::{Destination, MergeError};
