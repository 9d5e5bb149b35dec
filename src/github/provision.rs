//! First-time provisioning of the remote sync repository.
//!
//! The decision tree is deliberately conservative: when both sides hold
//! data the outcome is [`ProvisionOutcome::ExistingDiverged`] and nothing
//! is touched — reconciliation is a human decision, not an algorithm here.
//! The "does local hold data" signal is the top-level emptiness of the
//! serialized store, nothing deeper.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::git;
use crate::github::GithubClient;
use crate::retry::{retry_fixed, RetryConfig};

/// Result of [`initialize_repo`]. Divergence is a value, not an error —
/// the caller owns the resolution policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// No remote existed; one was created and the local tree pushed to it.
    Created { remote_url: String },
    /// A remote existed and the local store was empty; the remote was
    /// cloned over the (discarded) local tree.
    ExistingEmpty { remote_url: String },
    /// Both the remote and the local store hold data. Nothing was changed.
    ExistingDiverged { remote_url: String },
}

impl ProvisionOutcome {
    pub fn remote_url(&self) -> &str {
        match self {
            Self::Created { remote_url }
            | Self::ExistingEmpty { remote_url }
            | Self::ExistingDiverged { remote_url } => remote_url,
        }
    }
}

/// Create or adopt the remote sync repository for `owner`.
///
/// - remote exists, local store empty → wipe the sync tree, clone the
///   remote into its place;
/// - remote exists, local store non-empty → report divergence, touch
///   nothing;
/// - remote absent → create it, initialize the sync tree as a repository
///   on `main`, and force-push the local contents.
pub async fn initialize_repo(
    gh: &GithubClient,
    token: &str,
    owner: &str,
    sync_tree: &Path,
    data_file: &Path,
) -> Result<ProvisionOutcome> {
    let existing = retry_fixed(&RetryConfig::network(), || gh.lookup_repo(token, owner))
        .await
        .context("failed to check for the remote repository")?;

    let local_empty = local_store_is_empty(data_file).await?;

    match existing {
        Some(remote) if local_empty => {
            info!(tree = %sync_tree.display(), "remote exists and local store is empty — adopting remote");
            match tokio::fs::remove_dir_all(sync_tree).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).context("failed to clear the local sync tree before cloning")
                }
            }
            let identity = gh.user_identity(token).await?;
            let auth_url = with_embedded_token(&remote.clone_url, token);
            git::clone_repo(&auth_url, sync_tree, &identity).await?;
            Ok(ProvisionOutcome::ExistingEmpty {
                remote_url: remote.clone_url,
            })
        }
        Some(remote) => {
            info!("remote exists and local store holds data — reporting divergence");
            Ok(ProvisionOutcome::ExistingDiverged {
                remote_url: remote.clone_url,
            })
        }
        None => {
            let created = gh
                .create_private_repo(token)
                .await
                .context("failed to create the remote repository")?;
            let identity = gh.user_identity(token).await?;
            let auth_url = with_embedded_token(&created.clone_url, token);
            git::init_and_push(sync_tree, &auth_url, &identity).await?;
            info!("created remote repository and pushed the local tree");
            Ok(ProvisionOutcome::Created {
                remote_url: created.clone_url,
            })
        }
    }
}

/// The divergence heuristic: an empty top-level JSON object means "no
/// local content yet". Anything else — including non-object JSON — counts
/// as data.
async fn local_store_is_empty(data_file: &Path) -> Result<bool> {
    let raw = tokio::fs::read(data_file)
        .await
        .with_context(|| format!("failed to read local data file {}", data_file.display()))?;
    let value: serde_json::Value =
        serde_json::from_slice(&raw).context("local data file is not valid JSON")?;
    Ok(matches!(value, serde_json::Value::Object(map) if map.is_empty()))
}

/// Embed the access token as the userinfo part of an HTTPS clone URL.
/// Non-HTTPS URLs (local paths in tests) pass through unchanged. The
/// result ends up in the local Git config only — never in logs.
fn with_embedded_token(clone_url: &str, token: &str) -> String {
    clone_url.replacen("https://", &format!("https://{token}@"), 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_object_counts_as_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("data.json");
        tokio::fs::write(&file, b"{}").await.unwrap();
        assert!(local_store_is_empty(&file).await.unwrap());
    }

    #[tokio::test]
    async fn populated_object_counts_as_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("data.json");
        tokio::fs::write(&file, br#"{"a":1}"#).await.unwrap();
        assert!(!local_store_is_empty(&file).await.unwrap());
    }

    #[tokio::test]
    async fn non_object_json_counts_as_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("data.json");
        tokio::fs::write(&file, b"[]").await.unwrap();
        assert!(!local_store_is_empty(&file).await.unwrap());
    }

    #[tokio::test]
    async fn missing_data_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("absent.json");
        assert!(local_store_is_empty(&file).await.is_err());
    }

    #[test]
    fn token_is_embedded_in_https_urls_only() {
        assert_eq!(
            with_embedded_token("https://github.com/u/my-arcadia.git", "tok"),
            "https://tok@github.com/u/my-arcadia.git"
        );
        // Local bare repositories (tests) are left untouched.
        assert_eq!(
            with_embedded_token("/tmp/remote.git", "tok"),
            "/tmp/remote.git"
        );
    }
}
