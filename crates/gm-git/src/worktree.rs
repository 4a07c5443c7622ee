use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::RepoHandle;

pub const DEFAULT_WORKTREE_ROOT: &str = ".worktrees";
pub const DEFAULT_BRANCH_PREFIX: &str = "team";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub session_id: String,
    pub branch: String,
    pub path: PathBuf,
    pub base_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeStat {
    pub stat: String,
    pub files: Vec<String>,
    pub base_commit: String,
}

/// Outcome of a `--no-ff` merge attempt. A failed merge is left in place,
/// conflict markers and all; the caller resolves or aborts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub conflicted_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeManager {
    git: GitCli,
    relative_root: PathBuf,
    branch_prefix: String,
}

impl Default for WorktreeManager {
    fn default() -> Self {
        Self {
            git: GitCli::default(),
            relative_root: PathBuf::from(DEFAULT_WORKTREE_ROOT),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
        }
    }
}

impl WorktreeManager {
    pub fn new(
        git: GitCli,
        relative_root: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            git,
            relative_root: relative_root.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    pub fn session_branch(&self, session_id: &str) -> String {
        format!("{}/{session_id}", self.branch_prefix)
    }

    pub fn session_worktree_path(&self, repo: &RepoHandle, session_id: &str) -> PathBuf {
        repo.root.join(&self.relative_root).join(session_id)
    }

    /// Create a new branch from the repo's current HEAD and attach a linked
    /// worktree for it. Fails if either the branch or the path exists; a
    /// half-created branch is deleted when the worktree attach fails.
    pub fn create(&self, repo: &RepoHandle, session_id: &str) -> Result<WorktreeInfo, GitError> {
        let branch = self.session_branch(session_id);
        let path = self.session_worktree_path(repo, session_id);

        if path.exists() {
            return Err(GitError::WorktreeAlreadyExists {
                session_id: session_id.to_string(),
                path,
            });
        }
        if self.branch_exists(repo, &branch)? {
            return Err(GitError::BranchAlreadyExists { branch });
        }

        let root = repo.root.join(&self.relative_root);
        fs::create_dir_all(&root).map_err(|source| GitError::Io {
            command: format!("create_dir_all {}", root.display()),
            source,
        })?;

        let base_branch = self
            .git
            .run(&repo.root, ["rev-parse", "--abbrev-ref", "HEAD"])?
            .stdout
            .trim()
            .to_string();

        self.git
            .run(&repo.root, ["branch", branch.as_str(), "HEAD"])?;

        if let Err(err) = self.git.run(
            &repo.root,
            [
                OsStr::new("worktree"),
                OsStr::new("add"),
                path.as_os_str(),
                OsStr::new(branch.as_str()),
            ],
        ) {
            let _ = self
                .git
                .run(&repo.root, ["branch", "-D", branch.as_str()]);
            return Err(err);
        }

        Ok(WorktreeInfo {
            session_id: session_id.to_string(),
            branch,
            path,
            base_branch,
        })
    }

    pub fn list(&self, repo: &RepoHandle) -> Result<Vec<ListedWorktree>, GitError> {
        let output = self
            .git
            .run(&repo.root, ["worktree", "list", "--porcelain"])?;
        parse_worktree_list(&output.stdout)
    }

    /// Worktrees whose branch carries this manager's prefix.
    pub fn list_sessions(&self, repo: &RepoHandle) -> Result<Vec<ListedWorktree>, GitError> {
        let prefix = format!("{}/", self.branch_prefix);
        Ok(self
            .list(repo)?
            .into_iter()
            .filter(|entry| {
                entry
                    .branch
                    .as_deref()
                    .is_some_and(|branch| branch.starts_with(&prefix))
            })
            .collect())
    }

    fn branch_exists(&self, repo: &RepoHandle, branch: &str) -> Result<bool, GitError> {
        let refname = format!("refs/heads/{branch}");
        let probe = self.git.run_status(
            &repo.root,
            ["rev-parse", "--verify", "--quiet", refname.as_str()],
        )?;
        Ok(probe.success())
    }

    fn merge_base(&self, repo: &RepoHandle, branch: &str) -> Result<String, GitError> {
        let output = self.git.run(&repo.root, ["merge-base", "HEAD", branch])?;
        Ok(output.stdout.trim().to_string())
    }

    /// Unified diff of the session's work against its merge base, folding in
    /// uncommitted worktree changes via a throwaway index.
    pub fn diff(&self, repo: &RepoHandle, session_id: &str) -> Result<String, GitError> {
        let branch = self.session_branch(session_id);
        let base = self.merge_base(repo, &branch)?;
        let worktree = self.session_worktree_path(repo, session_id);

        if !worktree.is_dir() {
            // Worktree already detached: only committed work remains.
            let output = self
                .git
                .run(&repo.root, ["diff", base.as_str(), branch.as_str()])?;
            return Ok(output.stdout);
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let temp_index = std::env::temp_dir().join(format!("gm-diff-index-{session_id}-{nanos}"));

        let result: Result<String, GitError> = (|| {
            let env = [("GIT_INDEX_FILE", temp_index.as_os_str())];
            self.git.run_with_env(&worktree, ["add", "-A"], &env)?;
            let output =
                self.git
                    .run_with_env(&worktree, ["diff", "--cached", base.as_str()], &env)?;
            Ok(output.stdout)
        })();

        let _ = fs::remove_file(&temp_index);
        result
    }

    /// Diffstat summary plus the set of changed paths for the session branch.
    pub fn stat(&self, repo: &RepoHandle, session_id: &str) -> Result<WorktreeStat, GitError> {
        let branch = self.session_branch(session_id);
        let base = self.merge_base(repo, &branch)?;

        let stat = self
            .git
            .run(
                &repo.root,
                ["diff", "--stat", base.as_str(), branch.as_str()],
            )?
            .stdout;
        let files = self.changed_files(repo, session_id)?;

        Ok(WorktreeStat {
            stat,
            files,
            base_commit: base,
        })
    }

    /// Repository-relative paths the session branch changed vs. its base.
    pub fn changed_files(&self, repo: &RepoHandle, session_id: &str) -> Result<Vec<String>, GitError> {
        let branch = self.session_branch(session_id);
        let base = self.merge_base(repo, &branch)?;
        let output = self.git.run(
            &repo.root,
            ["diff", "--name-only", base.as_str(), branch.as_str()],
        )?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `--no-ff` merge of `branch` into the current checkout. Never aborts:
    /// a conflicted merge stays in place for the caller to resolve or reset.
    pub fn merge(
        &self,
        repo: &RepoHandle,
        branch: &str,
        message: &str,
    ) -> Result<MergeOutcome, GitError> {
        let output = self.git.run_status(
            &repo.root,
            ["merge", "--no-ff", branch, "-m", message],
        )?;

        if output.success() {
            return Ok(MergeOutcome {
                success: true,
                stdout: output.stdout,
                stderr: output.stderr,
                conflicted_files: Vec::new(),
            });
        }

        let conflicted_files = self.conflicted_files(repo)?;
        Ok(MergeOutcome {
            success: false,
            stdout: output.stdout,
            stderr: output.stderr,
            conflicted_files,
        })
    }

    /// Paths with unresolved conflict entries in the index.
    pub fn conflicted_files(&self, repo: &RepoHandle) -> Result<Vec<String>, GitError> {
        let output = self
            .git
            .run(&repo.root, ["diff", "--name-only", "--diff-filter=U"])?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Restore the checkout after a failed merge. Tolerates there being no
    /// merge in progress.
    pub fn abort_merge(&self, repo: &RepoHandle) -> Result<(), GitError> {
        let _ = self.git.run_status(&repo.root, ["merge", "--abort"])?;
        Ok(())
    }

    /// Stage and commit any uncommitted changes in the session worktree.
    /// Returns whether a commit was created.
    pub fn auto_commit(
        &self,
        repo: &RepoHandle,
        session_id: &str,
        message: &str,
    ) -> Result<bool, GitError> {
        let worktree = self.session_worktree_path(repo, session_id);
        if !worktree.is_dir() {
            return Ok(false);
        }

        let status = self.git.run(&worktree, ["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }

        self.git.run(&worktree, ["add", "-A"])?;
        self.git.run(
            &worktree,
            [
                "-c",
                "user.name=gm",
                "-c",
                "user.email=gm@localhost",
                "commit",
                "-m",
                message,
            ],
        )?;
        Ok(true)
    }

    /// Force-remove the worktree and delete the branch. Idempotent: both
    /// steps tolerate the target already being gone.
    pub fn remove(&self, repo: &RepoHandle, session_id: &str) -> Result<(), GitError> {
        let branch = self.session_branch(session_id);
        let path = self.session_worktree_path(repo, session_id);

        let _ = self.git.run_status(
            &repo.root,
            [
                OsStr::new("worktree"),
                OsStr::new("remove"),
                OsStr::new("--force"),
                path.as_os_str(),
            ],
        )?;
        let _ = self
            .git
            .run_status(&repo.root, ["branch", "-D", branch.as_str()])?;
        Ok(())
    }
}

fn parse_worktree_list(raw: &str) -> Result<Vec<ListedWorktree>, GitError> {
    let mut listed = Vec::new();

    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;
    let mut current_head: Option<String> = None;

    for line in raw.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let Some(path) = current_path.take() {
                listed.push(ListedWorktree {
                    path,
                    branch: current_branch.take(),
                    head: current_head.take(),
                });
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest.trim()));
            continue;
        }
        if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.trim().trim_start_matches("refs/heads/").to_string();
            current_branch = Some(branch);
            continue;
        }
        if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.trim().to_string());
            continue;
        }
    }

    if listed.is_empty() && !raw.trim().is_empty() {
        return Err(GitError::Parse {
            context: "unable to parse git worktree list output".to_string(),
        });
    }

    Ok(listed)
}
