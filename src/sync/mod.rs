//! Sync entry points: initialize, sync now, pull.
//!
//! One guard per sync tree serializes operations — a second trigger while
//! one is in flight fails fast instead of interleaving Git index writes
//! with tree mutations. The guard is in-process only; the tree has no
//! file-level lock.
//!
//! Outcome surface: success is `Ok`, failure is `Err`, and divergence is
//! a value ([`ProvisionOutcome::ExistingDiverged`]) because resolving it
//! is a user decision, not something this layer automates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::config::{SyncBackend, SyncConfig};
use crate::git;
use crate::github::provision::{self, ProvisionOutcome};
use crate::github::GithubClient;
use crate::webdav::WebDavClient;

/// Summary handed to front-ends by `status`.
#[derive(Debug)]
pub struct SyncStatus {
    pub backend: SyncBackend,
    pub sync_tree: PathBuf,
    pub tree_exists: bool,
    /// Commits on local `main` missing from `origin/main` (Git backend only).
    pub ahead: usize,
    /// Commits on `origin/main` missing from local `main` (Git backend only).
    pub behind: usize,
}

pub struct SyncService {
    config: SyncConfig,
    github: GithubClient,
    /// Single-flight guards, one per sync tree path.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SyncService {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let github = GithubClient::new(
            &config.github.api_base_url,
            &config.github.oauth_base_url,
        )?;
        Ok(Self {
            config,
            github,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn github(&self) -> &GithubClient {
        &self.github
    }

    /// Acquire the single-flight guard for `tree`, failing fast when an
    /// operation is already running against it.
    async fn acquire(&self, tree: &Path) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry(tree.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().map_err(|_| {
            anyhow!(
                "a sync operation is already in flight for {}",
                tree.display()
            )
        })
    }

    fn credential(&self) -> Result<(&str, &str)> {
        let token = self
            .config
            .github
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .context("no GitHub access token configured — run `arcadia-sync login` first")?;
        let owner = self
            .config
            .github
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .context("no GitHub username configured — run `arcadia-sync login` first")?;
        Ok((token, owner))
    }

    fn webdav_client(&self) -> Result<WebDavClient> {
        let dav = &self.config.webdav;
        if dav.url.is_empty() {
            anyhow::bail!("webdav.url is not configured");
        }
        Ok(WebDavClient::new(&dav.url, &dav.username, &dav.password)?)
    }

    /// Create or adopt the remote repository (Git backend).
    pub async fn initialize(&self) -> Result<ProvisionOutcome> {
        let _guard = self.acquire(&self.config.sync_tree).await?;
        let (token, owner) = self.credential()?;
        provision::initialize_repo(
            &self.github,
            token,
            owner,
            &self.config.sync_tree,
            &self.config.data_file,
        )
        .await
    }

    /// Push the local tree to the configured remote.
    pub async fn sync_now(&self, message: Option<&str>) -> Result<()> {
        let _guard = self.acquire(&self.config.sync_tree).await?;
        match self.config.backend {
            SyncBackend::Github => {
                let message = message
                    .map(str::to_string)
                    .unwrap_or_else(default_commit_message);
                git::commit_and_push(&self.config.sync_tree, &message).await
            }
            SyncBackend::Webdav => {
                let client = self.webdav_client()?;
                client
                    .upload_directory(&self.config.sync_tree, &self.config.webdav.remote_dir)
                    .await?;
                Ok(())
            }
        }
    }

    /// Overwrite the local tree with the remote state. Destructive of
    /// local-only changes on both backends.
    pub async fn pull(&self) -> Result<()> {
        let _guard = self.acquire(&self.config.sync_tree).await?;
        let tree = &self.config.sync_tree;
        match self.config.backend {
            SyncBackend::Github => git::pull_changes(tree).await,
            SyncBackend::Webdav => {
                let client = self.webdav_client()?;
                // Whole-tree download is last-writer-wins: wipe first.
                match tokio::fs::remove_dir_all(tree).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).context("failed to clear the local tree before download")
                    }
                }
                tokio::fs::create_dir_all(tree)
                    .await
                    .context("failed to recreate the local tree")?;
                client
                    .download_directory(&self.config.webdav.remote_dir, tree)
                    .await?;
                info!(tree = %tree.display(), "local tree replaced from WebDAV remote");
                Ok(())
            }
        }
    }

    /// Dry-run guard for the destructive pull: would local work be lost?
    pub async fn pull_preflight(&self) -> Result<bool> {
        let tree = &self.config.sync_tree;
        match self.config.backend {
            SyncBackend::Github => {
                let (ahead, _) = git::ahead_behind(tree).await?;
                Ok(ahead > 0)
            }
            // No change tracking on WebDAV — any local content would be
            // overwritten wholesale.
            SyncBackend::Webdav => Ok(tree_has_entries(tree).await),
        }
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let tree = self.config.sync_tree.clone();
        let tree_exists = tokio::fs::try_exists(&tree).await.unwrap_or(false);
        let (ahead, behind) = match self.config.backend {
            SyncBackend::Github if tree_exists => {
                git::ahead_behind(&tree).await.unwrap_or((0, 0))
            }
            _ => (0, 0),
        };
        Ok(SyncStatus {
            backend: self.config.backend,
            sync_tree: tree,
            tree_exists,
            ahead,
            behind,
        })
    }
}

async fn tree_has_entries(tree: &Path) -> bool {
    match tokio::fs::read_dir(tree).await {
        Ok(mut rd) => matches!(rd.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

/// The host application commits with a millisecond timestamp when the
/// user supplies no message.
fn default_commit_message() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> SyncService {
        let config = SyncConfig::new(Some(dir.path().to_path_buf()), None, None);
        SyncService::new(config).unwrap()
    }

    #[tokio::test]
    async fn overlapping_operations_are_rejected() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let tree = svc.config().sync_tree.clone();

        let first = svc.acquire(&tree).await.unwrap();
        let second = svc.acquire(&tree).await;
        assert!(second.is_err());

        drop(first);
        assert!(svc.acquire(&tree).await.is_ok());
    }

    #[tokio::test]
    async fn guards_are_per_tree() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);

        let _a = svc.acquire(Path::new("/tmp/tree-a")).await.unwrap();
        assert!(svc.acquire(Path::new("/tmp/tree-b")).await.is_ok());
    }

    #[tokio::test]
    async fn missing_credential_is_reported() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let err = svc.initialize().await.unwrap_err();
        assert!(err.to_string().contains("login"));
    }

    #[test]
    fn default_commit_message_is_a_timestamp() {
        let msg = default_commit_message();
        assert!(msg.parse::<i64>().is_ok());
    }
}
