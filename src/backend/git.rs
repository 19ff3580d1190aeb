//! `git` command-line implementation of [`Vcs`].

use std::path::Path;
use std::process::Command;

use super::{BackendError, Vcs, run_checked};

/// Drives the `git` binary found on `PATH`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GitCli;

impl GitCli {
    fn git(dir: &Path, args: &[&str]) -> Result<String, BackendError> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(dir);
        let summary = format!("git {}", args.join(" "));
        let output = run_checked(cmd, &summary)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn has_staged_changes(dir: &Path) -> Result<bool, BackendError> {
        let mut cmd = Command::new("git");
        cmd.args(["diff", "--cached", "--quiet"]).current_dir(dir);
        let status = cmd.status().map_err(|source| BackendError::Io {
            context: "spawn `git diff --cached --quiet`".to_owned(),
            source,
        })?;
        // exit 1 means "there are differences"
        Ok(status.code() == Some(1))
    }
}

impl Vcs for GitCli {
    fn clone_branch(&self, url: &str, dir: &Path, branch: &str) -> Result<(), BackendError> {
        let parent = dir.parent().unwrap_or_else(|| Path::new("."));
        let target = dir.to_string_lossy();
        Self::git(parent, &["clone", url, &target])?;
        Self::git(dir, &["switch", "-c", branch])?;
        tracing::info!(url, branch, dir = %dir.display(), "cloned override repository");
        Ok(())
    }

    fn ensure_repo(&self, dir: &Path) -> Result<(), BackendError> {
        if dir.join(".git").exists() {
            return Ok(());
        }
        Self::git(dir, &["init", "--quiet"])?;
        Ok(())
    }

    fn stage(&self, dir: &Path, paths: &[&str]) -> Result<(), BackendError> {
        let mut args = vec!["add", "--"];
        if paths.is_empty() {
            args.push(".");
        } else {
            args.extend_from_slice(paths);
        }
        Self::git(dir, &args)?;
        Ok(())
    }

    fn commit(&self, dir: &Path, message: &str) -> Result<(), BackendError> {
        if !Self::has_staged_changes(dir)? {
            tracing::info!(dir = %dir.display(), "nothing to commit");
            return Ok(());
        }
        Self::git(dir, &["commit", "--quiet", "-m", message])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        GitCli.ensure_repo(dir).unwrap();
        GitCli::git(dir, &["config", "user.email", "test@test.invalid"]).unwrap();
        GitCli::git(dir, &["config", "user.name", "Test"]).unwrap();
    }

    #[test]
    fn ensure_repo_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        GitCli.ensure_repo(dir.path()).unwrap();
        GitCli.ensure_repo(dir.path()).unwrap();
        assert!(dir.path().join(".git").exists());
    }

    #[test]
    fn stage_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        GitCli.stage(dir.path(), &["a.txt"]).unwrap();
        GitCli.commit(dir.path(), "add a").unwrap();
        let log = GitCli::git(dir.path(), &["log", "--format=%s"]).unwrap();
        assert_eq!(log, "add a");
    }

    #[test]
    fn commit_without_changes_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        GitCli.stage(dir.path(), &[]).unwrap();
        GitCli.commit(dir.path(), "first").unwrap();
        GitCli.commit(dir.path(), "second").unwrap();
        let log = GitCli::git(dir.path(), &["log", "--format=%s"]).unwrap();
        assert_eq!(log, "first");
    }
}
