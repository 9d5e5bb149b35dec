//! Git sync driver for the local library tree.
//!
//! The tree is bound to a single remote (`origin`) and branch (`main`).
//! Two policies define this driver and both are destructive by design:
//!
//! - **push is always a force push** — after a user-initiated sync the
//!   local tree is authoritative and remote history is overwritten;
//! - **pull is a hard reset to `origin/main`** — local commits and
//!   uncommitted changes are discarded before and after the fetch.
//!
//! There is no three-way merge and no conflict detection; last writer
//! wins at repository granularity. Callers gate the pull path behind
//! [`ahead_behind`] when they want to warn the user first.
//!
//! Network-shaped operations (push/fetch/clone) ride the fixed-delay
//! retry policy; local index operations (add/commit/init) never do.
//! libgit2 work runs on the blocking pool.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Cred, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository, ResetType,
    StatusOptions,
};
use tracing::{debug, info};

use crate::github::UserIdentity;
use crate::retry::{retry_fixed, RetryConfig};

const REMOTE_NAME: &str = "origin";
const BRANCH: &str = "main";
const REMOTE_TRACKING_REF: &str = "refs/remotes/origin/main";
const FORCE_PUSH_REFSPEC: &str = "+refs/heads/main:refs/heads/main";
const FETCH_REFSPEC: &str = "+refs/heads/main:refs/remotes/origin/main";

// ─── Public operations ───────────────────────────────────────────────────────

/// Stage everything, commit when dirty, and force-push `main` to `origin`.
///
/// The push happens even when there is nothing new to commit — the remote
/// may still be behind (a previous push attempt may have failed).
pub async fn commit_and_push(tree: &Path, message: &str) -> Result<()> {
    let tree_buf = tree.to_path_buf();
    let msg = message.to_string();
    let committed = tokio::task::spawn_blocking(move || -> Result<bool> {
        let repo = open_tree(&tree_buf)?;
        let dirty = stage_all(&repo)?;
        if dirty {
            commit_staged(&repo, &msg)?;
        }
        Ok(dirty)
    })
    .await
    .context("git commit task panicked")??;

    if committed {
        debug!(path = %tree.display(), "changes committed");
    } else {
        debug!(path = %tree.display(), "working tree clean — nothing to commit");
    }

    push_force(tree).await?;
    info!(path = %tree.display(), "library pushed to origin/main");
    Ok(())
}

/// Overwrite the local tree with the remote state.
///
/// Resets hard to the known `origin/main` first (discarding local work,
/// mirroring the reset-then-pull sequence), fetches with retries, then
/// resets again to the freshly fetched tip.
pub async fn pull_changes(tree: &Path) -> Result<()> {
    run_blocking(tree, reset_to_remote_main)
        .await
        .context("git reset task panicked")??;

    let tree_buf = tree.to_path_buf();
    retry_fixed(&RetryConfig::network(), || {
        let tree = tree_buf.clone();
        async move {
            tokio::task::spawn_blocking(move || fetch_main(&tree))
                .await
                .unwrap_or_else(|e| Err(anyhow!("git fetch task panicked: {e}")))
        }
    })
    .await?;

    let updated = run_blocking(tree, reset_to_remote_main)
        .await
        .context("git reset task panicked")??;
    if !updated {
        bail!("origin/main not found after fetch — was the remote repository emptied?");
    }
    info!(path = %tree.display(), "library reset to origin/main");
    Ok(())
}

/// Commits on local `main` missing from `origin/main`, and vice versa.
/// Does not touch the network — compares against the last fetched state.
pub async fn ahead_behind(tree: &Path) -> Result<(usize, usize)> {
    run_blocking(tree, |tree| {
        let repo = open_tree(tree)?;
        let local = repo
            .head()
            .context("local repository has no commits")?
            .peel_to_commit()?
            .id();
        let upstream = match repo.find_reference(REMOTE_TRACKING_REF) {
            Ok(r) => r.peel_to_commit()?.id(),
            Err(_) => return Ok((0, 0)),
        };
        Ok(repo.graph_ahead_behind(local, upstream)?)
    })
    .await
    .context("git status task panicked")?
}

/// Bootstrap for a brand-new remote: initialize the tree as a repository
/// on `main`, set commit identity, point `origin` at `remote_url`
/// (token-bearing — it lands in the local Git config only), commit the
/// current contents, and force-push.
pub async fn init_and_push(tree: &Path, remote_url: &str, identity: &UserIdentity) -> Result<()> {
    let tree_buf = tree.to_path_buf();
    let url = remote_url.to_string();
    let who = identity.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&tree_buf).context("failed to create the sync tree directory")?;
        let repo = Repository::init(&tree_buf).context("failed to initialize repository")?;
        ensure_main_branch(&repo)?;
        configure_identity(&repo, &who)?;
        set_origin(&repo, &url)?;

        let dirty = stage_all(&repo)?;
        // A first push needs at least one commit even for an empty tree.
        if dirty || repo.head().is_err() {
            commit_staged(&repo, &default_timestamp_message())?;
        }
        Ok(())
    })
    .await
    .context("git init task panicked")??;

    push_force(tree).await?;
    info!(path = %tree.display(), "initialized repository and pushed to origin/main");
    Ok(())
}

/// Bootstrap for an existing remote: clone it into `tree` (retried — the
/// clone is a network operation) and set commit identity on the result.
pub async fn clone_repo(remote_url: &str, tree: &Path, identity: &UserIdentity) -> Result<()> {
    let url = remote_url.to_string();
    let tree_buf = tree.to_path_buf();
    retry_fixed(&RetryConfig::network(), || {
        let url = url.clone();
        let tree = tree_buf.clone();
        async move {
            tokio::task::spawn_blocking(move || clone_into(&url, &tree))
                .await
                .unwrap_or_else(|e| Err(anyhow!("git clone task panicked: {e}")))
        }
    })
    .await?;

    let who = identity.clone();
    run_blocking(tree, move |tree| {
        let repo = open_tree(tree)?;
        configure_identity(&repo, &who)
    })
    .await
    .context("git config task panicked")??;

    info!(path = %tree.display(), "remote repository cloned");
    Ok(())
}

// ─── Blocking internals ──────────────────────────────────────────────────────

async fn run_blocking<T, F>(tree: &Path, f: F) -> std::result::Result<Result<T>, tokio::task::JoinError>
where
    T: Send + 'static,
    F: FnOnce(&Path) -> Result<T> + Send + 'static,
{
    let tree = tree.to_path_buf();
    tokio::task::spawn_blocking(move || f(&tree)).await
}

fn open_tree(tree: &Path) -> Result<Repository> {
    Repository::open(tree)
        .with_context(|| format!("{} is not a Git repository", tree.display()))
}

/// Stage every addition, modification, and deletion. Returns whether the
/// index now differs from HEAD.
fn stage_all(repo: &Repository) -> Result<bool> {
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    let dirty = statuses.iter().any(|e| {
        let s = e.status();
        s.is_index_new()
            || s.is_index_modified()
            || s.is_index_deleted()
            || s.is_index_renamed()
            || s.is_index_typechange()
    });
    Ok(dirty)
}

fn commit_staged(repo: &Repository, message: &str) -> Result<()> {
    let mut index = repo.index()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = repo
        .signature()
        .context("commit identity (user.name / user.email) is not configured")?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(())
}

/// Make sure HEAD points at `main`, creating the branch if the repository
/// started life on a different default.
fn ensure_main_branch(repo: &Repository) -> Result<()> {
    match repo.head() {
        Ok(head) if head.shorthand() == Some(BRANCH) => Ok(()),
        Ok(head) => {
            let commit = head.peel_to_commit()?;
            repo.branch(BRANCH, &commit, true)?;
            repo.set_head(&format!("refs/heads/{BRANCH}"))?;
            repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
            Ok(())
        }
        // Unborn repository: point HEAD at main so the first commit lands there.
        Err(_) => {
            repo.set_head(&format!("refs/heads/{BRANCH}"))?;
            Ok(())
        }
    }
}

fn configure_identity(repo: &Repository, identity: &UserIdentity) -> Result<()> {
    let mut cfg = repo.config()?;
    cfg.set_str("user.name", &identity.username)?;
    cfg.set_str("user.email", &identity.email)?;
    Ok(())
}

fn set_origin(repo: &Repository, url: &str) -> Result<()> {
    if repo.find_remote(REMOTE_NAME).is_ok() {
        repo.remote_set_url(REMOTE_NAME, url)?;
    } else {
        repo.remote(REMOTE_NAME, url)?;
    }
    Ok(())
}

/// Credential callbacks for HTTPS remotes. The access token rides in the
/// remote URL as the userinfo part; libgit2 still asks for the password
/// half. Local-path remotes never invoke this.
fn auth_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut cbs = RemoteCallbacks::new();
    cbs.credentials(|_url, username_from_url, _allowed| {
        Cred::userpass_plaintext(username_from_url.unwrap_or("git"), "")
    });
    cbs
}

fn push_once(tree: &Path) -> Result<()> {
    let repo = open_tree(tree)?;
    let mut remote = repo
        .find_remote(REMOTE_NAME)
        .context("remote 'origin' is not configured")?;
    let mut opts = PushOptions::new();
    opts.remote_callbacks(auth_callbacks());
    remote
        .push(&[FORCE_PUSH_REFSPEC], Some(&mut opts))
        .context("force push to origin/main failed")?;
    Ok(())
}

async fn push_force(tree: &Path) -> Result<()> {
    let tree_buf: PathBuf = tree.to_path_buf();
    retry_fixed(&RetryConfig::network(), || {
        let tree = tree_buf.clone();
        async move {
            tokio::task::spawn_blocking(move || push_once(&tree))
                .await
                .unwrap_or_else(|e| Err(anyhow!("git push task panicked: {e}")))
        }
    })
    .await
}

fn fetch_main(tree: &Path) -> Result<()> {
    let repo = open_tree(tree)?;
    let mut remote = repo
        .find_remote(REMOTE_NAME)
        .context("remote 'origin' is not configured")?;
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(auth_callbacks());
    remote
        .fetch(&[FETCH_REFSPEC], Some(&mut opts), None)
        .context("fetch from origin failed")?;
    Ok(())
}

/// Hard-reset the working tree to `origin/main`. Returns `false` when the
/// remote-tracking ref does not exist yet (nothing fetched).
fn reset_to_remote_main(tree: &Path) -> Result<bool> {
    let repo = open_tree(tree)?;
    let target = match repo.find_reference(REMOTE_TRACKING_REF) {
        Ok(r) => r,
        Err(_) => return Ok(false),
    };
    let commit = target.peel_to_commit()?;
    repo.reset(commit.as_object(), ResetType::Hard, None)?;
    Ok(true)
}

fn clone_into(url: &str, tree: &Path) -> Result<()> {
    // A failed earlier attempt may have left a partial checkout behind.
    if tree.exists() {
        std::fs::remove_dir_all(tree).context("failed to clear partial clone target")?;
    }
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(auth_callbacks());
    let mut builder = RepoBuilder::new();
    builder.fetch_options(opts);
    builder.clone(url, tree).context("clone failed")?;
    Ok(())
}

fn default_timestamp_message() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}
