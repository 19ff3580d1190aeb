//! uv2nix-hammer library crate.
//!
//! The primary interface is the `uv2nix-hammer` binary. The library exposes
//! the rule engine, merge engine and orchestrator so that integration tests
//! can drive a run with scripted collaborators instead of nix and git.

pub mod backend;
pub mod config;
pub mod error;
pub mod index;
pub mod lognorm;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod project;
pub mod repo;
pub mod rules;
pub mod telemetry;
pub mod version;

pub use error::HammerError;
pub use orchestrator::{Orchestrator, Phase, RunOutcome, RunSettings, Tools, WorkDir};
