//! Git operations for per-record fix branches
//!
//! Branch, stage and commit go through git2; push and PR creation shell out
//! to `git` and `gh`.

use crate::model::{ErrorRecord, ErrorStatus};
use crate::session::Isolation;
use crate::util::resolve_repo_path;
use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{BranchType, Repository, Signature, Status};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the checked-out branch, or `None` when HEAD is detached.
pub fn current_branch(repo_path: &Path) -> Result<Option<String>> {
    let repo = Repository::open(repo_path)?;
    let head = repo.head().context("Failed to get HEAD")?;
    if !head.is_branch() {
        return Ok(None);
    }
    Ok(head.shorthand().map(str::to_string))
}

/// Create a new branch from current HEAD
pub fn create_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let commit = repo.head()?.peel_to_commit()?;
    repo.branch(name, &commit, false)
        .with_context(|| format!("Failed to create branch '{}'", name))?;
    Ok(())
}

/// Checkout an existing branch. Refuses to overwrite local modifications.
pub fn checkout_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let (object, reference) = repo
        .revparse_ext(name)
        .with_context(|| format!("Branch '{}' not found", name))?;

    repo.checkout_tree(&object, Some(CheckoutBuilder::new().safe()))
        .with_context(|| format!("Failed to check out '{}'", name))?;

    match reference.as_ref().and_then(|r| r.name()) {
        Some(refname) => repo.set_head(refname)?,
        None => repo.set_head_detached(object.id())?,
    }
    Ok(())
}

pub fn delete_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut branch = repo
        .find_branch(name, BranchType::Local)
        .with_context(|| format!("Branch '{}' not found", name))?;
    branch
        .delete()
        .with_context(|| format!("Failed to delete branch '{}'", name))?;
    Ok(())
}

pub fn branch_exists(repo_path: &Path, name: &str) -> bool {
    Repository::open(repo_path)
        .and_then(|repo| repo.find_branch(name, BranchType::Local).map(|_| ()))
        .is_ok()
}

/// Deletes every local `fix/*` branch except the checked-out one and
/// returns the deleted names.
pub fn cleanup_fix_branches(repo_path: &Path) -> Result<Vec<String>> {
    let repo = Repository::open(repo_path)?;
    let current = current_branch(repo_path)?;

    let mut deleted = Vec::new();
    for entry in repo.branches(Some(BranchType::Local))? {
        let (mut branch, _) = entry?;
        let Some(name) = branch.name()?.map(str::to_string) else {
            continue;
        };
        if !name.starts_with("fix/") || current.as_deref() == Some(name.as_str()) {
            continue;
        }
        match branch.delete() {
            Ok(()) => {
                debug!(branch = %name, "deleted fix branch");
                deleted.push(name);
            }
            Err(e) => warn!(branch = %name, "could not delete fix branch: {}", e),
        }
    }
    deleted.sort();
    Ok(deleted)
}

/// Branch name for a record: `fix/<first 8 of id>-<slug of summary>`.
pub fn generate_fix_branch_name(id: &str, summary: &str) -> String {
    let short_id: String = id.chars().take(8).collect();

    let slug = summary
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(5)
        .collect::<Vec<_>>()
        .join("-");

    let slug: String = slug.chars().take(40).collect();
    let slug = slug.trim_end_matches('-');

    if slug.is_empty() {
        format!("fix/{}", short_id)
    } else {
        format!("fix/{}-{}", short_id, slug)
    }
}

/// Whether `file_path` differs from HEAD or is untracked.
pub fn is_file_dirty(repo_path: &Path, file_path: &Path) -> Result<bool> {
    let repo = Repository::open(repo_path)?;
    let status = repo
        .status_file(file_path)
        .with_context(|| format!("Failed to read git status of {}", file_path.display()))?;
    Ok(!(status.is_empty() || status == Status::CURRENT || status.contains(Status::IGNORED)))
}

/// Stage a specific file
pub fn stage_file(repo_path: &Path, file_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;
    index.add_path(file_path)?;
    index.write()?;
    Ok(())
}

/// Commit staged changes; returns the new commit id
pub fn commit(repo_path: &Path, message: &str) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = repo.head()?.peel_to_commit()?;

    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| "branch-fixer".to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| "branch-fixer@localhost".to_string());
    let sig = Signature::now(&name, &email)?;

    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
    Ok(oid.to_string())
}

/// Discards working-tree changes to one file.
pub fn reset_file(repo_path: &Path, file_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force().path(file_path);
    repo.checkout_head(Some(&mut checkout))
        .with_context(|| format!("Failed to reset {}", file_path.display()))?;
    Ok(())
}

/// Push a branch to origin (shells out to git)
pub fn push_branch(repo_path: &Path, branch: &str) -> Result<String> {
    let output = Command::new("git")
        .current_dir(repo_path)
        .args(["push", "-u", "origin", branch])
        .output()
        .context("Failed to execute git push")?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(anyhow::anyhow!(
            "git push failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Check if gh CLI is available
pub fn gh_available() -> bool {
    Command::new("gh")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check if gh is authenticated
pub fn gh_authenticated() -> bool {
    Command::new("gh")
        .args(["auth", "status"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Push `head` and open a pull request against `base`; returns the PR URL
pub fn create_pr(repo_path: &Path, head: &str, base: &str, title: &str, body: &str) -> Result<String> {
    if !gh_available() {
        return Err(anyhow::anyhow!(
            "gh CLI not installed. Install from https://cli.github.com"
        ));
    }
    if !gh_authenticated() {
        return Err(anyhow::anyhow!(
            "gh CLI not authenticated. Run 'gh auth login' first"
        ));
    }

    push_branch(repo_path, head)?;

    let output = Command::new("gh")
        .current_dir(repo_path)
        .args([
            "pr", "create", "--head", head, "--base", base, "--title", title, "--body", body,
        ])
        .output()
        .context("Failed to create PR")?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(anyhow::anyhow!(
            "Failed to create PR: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// A fix committed on its own branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBranch {
    pub record_id: Uuid,
    pub branch: String,
    pub commit: String,
    pub title: String,
}

/// One branch per record, cut from the branch checked out at start.
pub struct GitIsolation {
    root: PathBuf,
    base_branch: String,
    active: Mutex<HashMap<Uuid, String>>,
    fixed: Mutex<Vec<FixedBranch>>,
}

impl GitIsolation {
    /// Fails on a detached HEAD, since there would be nothing to return to.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let base_branch = current_branch(&root)?
            .ok_or_else(|| anyhow::anyhow!("HEAD is detached; check out a branch first"))?;
        Ok(Self {
            root,
            base_branch,
            active: Mutex::new(HashMap::new()),
            fixed: Mutex::new(Vec::new()),
        })
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Fixes committed so far, in settle order.
    pub fn fixed_branches(&self) -> Vec<FixedBranch> {
        match self.fixed.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn relative_path(&self, record: &ErrorRecord) -> Result<PathBuf> {
        resolve_repo_path(&self.root, &record.file_path)
            .map(|p| p.relative)
            .map_err(|e| anyhow::anyhow!(e))
    }

    fn take_active(&self, id: Uuid) -> Option<String> {
        match self.active.lock() {
            Ok(mut guard) => guard.remove(&id),
            Err(poisoned) => poisoned.into_inner().remove(&id),
        }
    }

    fn discard_branch(&self, branch: &str) -> Result<()> {
        checkout_branch(&self.root, &self.base_branch)?;
        delete_branch(&self.root, branch)?;
        debug!(branch, "deleted fix branch");
        Ok(())
    }
}

impl Isolation for GitIsolation {
    fn enter(&self, record: &ErrorRecord) -> Result<()> {
        let relative = self.relative_path(record)?;
        if is_file_dirty(&self.root, &relative)? {
            anyhow::bail!(
                "{} has uncommitted changes; commit or stash them first",
                relative.display()
            );
        }

        let summary = if record.test_function.is_empty() {
            relative.to_string_lossy().to_string()
        } else {
            record.test_function.clone()
        };
        let branch = generate_fix_branch_name(&record.id.to_string(), &summary);
        create_branch(&self.root, &branch)?;
        checkout_branch(&self.root, &branch)?;
        debug!(branch = %branch, test = %record.node_id(), "entered fix branch");

        match self.active.lock() {
            Ok(mut guard) => guard.insert(record.id, branch),
            Err(poisoned) => poisoned.into_inner().insert(record.id, branch),
        };
        Ok(())
    }

    fn settle(&self, record: &ErrorRecord) -> Result<()> {
        let Some(branch) = self.take_active(record.id) else {
            return Ok(());
        };
        let relative = self.relative_path(record)?;

        if record.is_inconsistent() {
            warn!(file = %relative.display(), "resetting file after failed rollback");
            reset_file(&self.root, &relative)?;
            return self.discard_branch(&branch);
        }

        if record.status() != ErrorStatus::Fixed {
            return self.discard_branch(&branch);
        }

        let title = if record.test_function.is_empty() {
            format!("Fix collection of {}", relative.display())
        } else {
            format!("Fix {} in {}", record.test_function, relative.display())
        };
        stage_file(&self.root, &relative)?;
        let commit_id = commit(&self.root, &title)?;
        checkout_branch(&self.root, &self.base_branch)?;
        info!(branch = %branch, commit = %commit_id, "committed fix");

        let fixed = FixedBranch {
            record_id: record.id,
            branch,
            commit: commit_id,
            title,
        };
        match self.fixed.lock() {
            Ok(mut guard) => guard.push(fixed),
            Err(poisoned) => poisoned.into_inner().push(fixed),
        }
        Ok(())
    }
}
