//! Core data model: unit identity, rule option values, per-unit rule state.

pub mod option;
pub mod state;
pub mod unit;

pub use option::OptionValue;
pub use state::{RuleState, RuleStateFile, StateError};
pub use unit::{PackageName, UnitId};
