//! Git info resolution (§1 "deliberately out of scope ... specified only
//! at their interface boundary", §6 "Process / git / metrics / logger are
//! thin injected ports"). The router never shells out itself — it asks
//! a [`GitInfoResolver`] for a fresh [`GitInfo`] and merges whatever comes
//! back, opportunistically, after `session_init` and after each `result`.

use async_trait::async_trait;
use broker_domain::GitInfo;
use tokio::process::Command;

/// A thin port over "what's the git state of this working directory".
/// Resolution is opportunistic — a failure (not a repo, `git` missing,
/// timeout) yields `None` rather than an error the router would have to
/// route around.
#[async_trait]
pub trait GitInfoResolver: Send + Sync {
    async fn resolve(&self, cwd: &str) -> Option<GitInfo>;
}

/// Shells out to the system `git` binary. Each invocation is independent
/// (no long-lived repository handle) since a session's `cwd` rarely
/// changes and refreshes are infrequent (once per turn at most).
pub struct CliGitInfoResolver;

impl CliGitInfoResolver {
    async fn run(cwd: &str, args: &[&str]) -> Option<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8(output.stdout).ok()?;
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

#[async_trait]
impl GitInfoResolver for CliGitInfoResolver {
    async fn resolve(&self, cwd: &str) -> Option<GitInfo> {
        let branch = Self::run(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await;
        branch.as_ref()?;
        let commit = Self::run(cwd, &["rev-parse", "HEAD"]).await;
        let status = Self::run(cwd, &["status", "--porcelain"]).await;
        Some(GitInfo {
            branch,
            commit,
            dirty: Some(status.is_some_and(|s| !s.is_empty())),
        })
    }
}

/// Never resolves anything — used where no `cwd` is known yet, or in
/// tests that don't want to depend on a `git` binary being present.
pub struct NoopGitInfoResolver;

#[async_trait]
impl GitInfoResolver for NoopGitInfoResolver {
    async fn resolve(&self, _cwd: &str) -> Option<GitInfo> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_resolver_always_returns_none() {
        assert!(NoopGitInfoResolver.resolve("/tmp").await.is_none());
    }

    #[tokio::test]
    async fn cli_resolver_returns_none_outside_a_repo() {
        let dir = tempfile::tempdir().unwrap();
        let info = CliGitInfoResolver.resolve(dir.path().to_str().unwrap()).await;
        assert!(info.is_none());
    }
}
