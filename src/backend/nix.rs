//! `nix` / `uv` command-line implementation of [`BuildTool`].

use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};

use super::{BackendError, BuildRun, BuildTool, run_checked};

/// Name of the flake input that points at the override repository.
pub const OVERRIDES_INPUT: &str = "uv2nix_hammer_overrides";

/// Drives `nix` and `uv` found on `PATH`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NixCli;

impl BuildTool for NixCli {
    fn lock_project(&self, project: &Path) -> Result<(), BackendError> {
        let mut cmd = Command::new("uv");
        cmd.args(["lock", "--no-cache"]).current_dir(project);
        run_checked(cmd, "uv lock --no-cache")?;
        Ok(())
    }

    fn refresh_overrides_input(&self, project: &Path) -> Result<(), BackendError> {
        let mut cmd = Command::new("nix");
        cmd.args(["flake", "lock", "--update-input", OVERRIDES_INPUT])
            .current_dir(project);
        run_checked(cmd, "nix flake lock --update-input")?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(project = %project.display()))]
    fn build(&self, project: &Path, log_path: &Path) -> Result<BuildRun, BackendError> {
        let log = File::create(log_path).map_err(|source| BackendError::Io {
            context: format!("create {}", log_path.display()),
            source,
        })?;
        let status = Command::new("nix")
            .args(["build", "--keep-going"])
            .current_dir(project)
            .stdout(Stdio::null())
            .stderr(log)
            .status()
            .map_err(|source| BackendError::Io {
                context: "spawn `nix build`".to_owned(),
                source,
            })?;
        let stderr = std::fs::read_to_string(log_path).map_err(|source| BackendError::Io {
            context: format!("read {}", log_path.display()),
            source,
        })?;
        let succeeded = project.join("result").exists();
        tracing::debug!(code = ?status.code(), succeeded, "build finished");
        Ok(BuildRun { stderr, succeeded })
    }

    fn derivation_log(&self, drv: &str) -> Result<String, BackendError> {
        let mut cmd = Command::new("nix");
        cmd.args(["log", drv]);
        let output = run_checked(cmd, &format!("nix log {drv}"))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn derivation_source(&self, drv: &str) -> Result<String, BackendError> {
        let mut cmd = Command::new("nix");
        cmd.args(["derivation", "show", drv]);
        let output = run_checked(cmd, &format!("nix derivation show {drv}"))?;
        parse_derivation_source(&String::from_utf8_lossy(&output.stdout), drv)
    }
}

/// Pull `env.src` out of `nix derivation show` JSON.
///
/// Newer nix releases key the object by the store name without the
/// `/nix/store/` prefix, so a single-entry object is accepted regardless of
/// its key.
pub(crate) fn parse_derivation_source(json: &str, drv: &str) -> Result<String, BackendError> {
    let parse_err = |detail: String| BackendError::Parse {
        context: format!("derivation of {drv}"),
        detail,
    };
    let doc: serde_json::Value = serde_json::from_str(json).map_err(|e| parse_err(e.to_string()))?;
    let object = doc
        .as_object()
        .ok_or_else(|| parse_err("expected a JSON object".to_owned()))?;
    let short = drv.rsplit('/').next().unwrap_or(drv);
    let entry = object
        .get(drv)
        .or_else(|| object.get(short))
        .or_else(|| (object.len() == 1).then(|| object.values().next()).flatten())
        .ok_or_else(|| parse_err("derivation not present in output".to_owned()))?;
    entry
        .pointer("/env/src")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| parse_err("no env.src attribute".to_owned()))
}
