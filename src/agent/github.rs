//! Typed wrappers over the GitHub CLI (`gh`).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::errors::ProcessError;

use super::process::{self, CommandSpec};

/// Token variables `gh` would otherwise prefer over its stored login.
const TOKEN_VARS: &[&str] = &[
    "GH_TOKEN",
    "GITHUB_TOKEN",
    "GH_ENTERPRISE_TOKEN",
    "GITHUB_ENTERPRISE_TOKEN",
];

/// A pull request as reported by `gh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
}

/// Subset of `gh pr view --json headRefName,url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestInfo {
    pub head_ref_name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct GitHubCli {
    program: String,
}

impl Default for GitHubCli {
    fn default() -> Self {
        Self::new("gh")
    }
}

impl GitHubCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn cmd(&self, cwd: &Path) -> CommandSpec {
        CommandSpec::new(&self.program, cwd).env("GH_PROMPT_DISABLED", "1")
    }

    /// `gh auth status` with token variables stripped, so only the stored
    /// interactive login is checked.
    pub async fn auth_status(&self, cwd: &Path) -> Result<(), ProcessError> {
        process::run(&self.auth_status_spec(cwd)).await?;
        Ok(())
    }

    fn auth_status_spec(&self, cwd: &Path) -> CommandSpec {
        TOKEN_VARS.iter().fold(
            self.cmd(cwd).args(["auth", "status"]),
            |spec, var| spec.env_remove(*var),
        )
    }

    pub async fn pr_view(&self, cwd: &Path, pr_number: u64) -> Result<PullRequestInfo> {
        let number = pr_number.to_string();
        let spec = self
            .cmd(cwd)
            .args(["pr", "view", number.as_str(), "--json", "headRefName,url"]);
        let output = process::run(&spec).await?;
        let info: PullRequestInfo = serde_json::from_str(output.stdout.trim())
            .with_context(|| format!("Unexpected `gh pr view` output: {}", output.stdout.trim()))?;
        if info.head_ref_name.trim().is_empty() {
            anyhow::bail!("PR #{} has no head branch", pr_number);
        }
        Ok(info)
    }

    pub async fn pr_create(
        &self,
        cwd: &Path,
        base: &str,
        head: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef> {
        let spec = self.cmd(cwd).args([
            "pr", "create", "--base", base, "--head", head, "--title", title, "--body", body,
        ]);
        let output = process::run(&spec).await?;
        let url = output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|line| line.starts_with("http"))
            .context("`gh pr create` did not print a pull request URL")?;
        let number = parse_pr_number(url)
            .with_context(|| format!("Cannot parse pull request number from {}", url))?;
        Ok(PullRequestRef {
            number,
            url: url.to_string(),
        })
    }
}

/// Extract `<n>` from a URL ending in `/pull/<n>`.
pub fn parse_pr_number(url: &str) -> Option<u64> {
    let trimmed = url.trim().trim_end_matches('/');
    let (rest, number) = trimmed.rsplit_once('/')?;
    if !rest.ends_with("/pull") {
        return None;
    }
    number.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pr_number() {
        assert_eq!(parse_pr_number("https://github.com/o/r/pull/99"), Some(99));
        assert_eq!(parse_pr_number("https://github.com/o/r/pull/7/\n"), Some(7));
        assert_eq!(parse_pr_number("https://github.com/o/r/issues/7"), None);
        assert_eq!(parse_pr_number("https://github.com/o/r/pull/abc"), None);
        assert_eq!(parse_pr_number("not a url"), None);
    }

    #[test]
    fn test_pull_request_info_deserializes() {
        let info: PullRequestInfo = serde_json::from_str(
            r#"{"headRefName":"feature/x","url":"https://github.com/o/r/pull/5"}"#,
        )
        .unwrap();
        assert_eq!(info.head_ref_name, "feature/x");
        assert_eq!(info.url, "https://github.com/o/r/pull/5");
    }

    #[cfg(unix)]
    fn fake_gh(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("gh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_auth_status_strips_token_variables() {
        let dir = tempfile::tempdir().unwrap();
        // Fails if any token variable leaks through.
        let gh = GitHubCli::new(fake_gh(
            dir.path(),
            r#"[ -z "$GH_TOKEN$GITHUB_TOKEN" ] || exit 3; exit 0"#,
        ));
        let spec = gh
            .auth_status_spec(dir.path())
            .env("GH_TOKEN", "secret")
            .env("GITHUB_TOKEN", "secret");
        let result = process::run(&spec).await;
        assert!(result.is_ok(), "{:?}", result);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_auth_status_failure() {
        let dir = tempfile::tempdir().unwrap();
        let gh = GitHubCli::new(fake_gh(dir.path(), "echo 'not logged in' >&2; exit 1"));
        let err = gh.auth_status(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("not logged in"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pr_create_parses_url() {
        let dir = tempfile::tempdir().unwrap();
        let gh = GitHubCli::new(fake_gh(
            dir.path(),
            "echo 'Creating pull request...'; echo 'https://github.com/o/r/pull/99'",
        ));
        let pr = gh
            .pr_create(dir.path(), "main", "airgit/issue-42-1", "t", "b")
            .await
            .unwrap();
        assert_eq!(pr.number, 99);
        assert_eq!(pr.url, "https://github.com/o/r/pull/99");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pr_view_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let gh = GitHubCli::new(fake_gh(dir.path(), "echo 'oops'"));
        assert!(gh.pr_view(dir.path(), 3).await.is_err());
    }
}
