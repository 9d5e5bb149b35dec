//! GitHub REST client for the sync subsystem.
//!
//! Covers exactly the calls cloud sync needs: repository lookup and
//! creation, the OAuth code→token exchange, and account identity
//! resolution. Responses are deserialized into narrow structs — only the
//! fields the sync flow consumes.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::retry::{retry_fixed, RetryConfig};

pub mod provision;

/// Fixed name of the per-account sync repository. One remote target per
/// installation; the owner login is the only variable part.
pub const SYNC_REPO_NAME: &str = "my-arcadia";

const ACCEPT_GITHUB_V3: &str = "application/vnd.github.v3+json";
const HTTP_TIMEOUT_SECS: u64 = 30;

// ─── API types (deserialize responses) ───────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GhRepo {
    pub clone_url: String,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhEmail {
    email: String,
    primary: bool,
}

#[derive(Debug, Deserialize)]
struct GhTokenResponse {
    access_token: Option<String>,
    error_description: Option<String>,
}

/// Account identity used for Git commit attribution.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub username: String,
    pub email: String,
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    oauth_base: String,
}

impl GithubClient {
    pub fn new(api_base_url: &str, oauth_base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(concat!("arcadia-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base_url.trim_end_matches('/').to_string(),
            oauth_base: oauth_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// The browser URL that starts the OAuth authorization-code flow.
    pub fn authorize_url(&self, client_id: &str, state: &str) -> String {
        format!(
            "{}/login/oauth/authorize?client_id={client_id}&scope=repo%20user:email&state={state}",
            self.oauth_base
        )
    }

    /// Exchange an authorization code for an access token.
    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
    ) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/login/oauth/access_token", self.oauth_base))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&serde_json::json!({
                "client_id": client_id,
                "client_secret": client_secret,
                "code": code,
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: GhTokenResponse = resp.json().await?;
        match body.access_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(anyhow!(
                "token exchange rejected: {}",
                body.error_description
                    .unwrap_or_else(|| "no access token in response".to_string())
            )),
        }
    }

    /// Resolve the login of the account the token belongs to.
    pub async fn user_login(&self, token: &str) -> Result<String> {
        let user: GhUser = self
            .http
            .get(format!("{}/user", self.api_base))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, ACCEPT_GITHUB_V3)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(user.login)
    }

    /// Resolve login + primary email for Git commit attribution.
    ///
    /// Both calls ride the standard network retry policy.
    pub async fn user_identity(&self, token: &str) -> Result<UserIdentity> {
        let username = retry_fixed(&RetryConfig::network(), || self.user_login(token))
            .await
            .context("failed to resolve account login")?;

        let emails: Vec<GhEmail> = retry_fixed(&RetryConfig::network(), || async {
            self.http
                .get(format!("{}/user/emails", self.api_base))
                .bearer_auth(token)
                .header(reqwest::header::ACCEPT, ACCEPT_GITHUB_V3)
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<GhEmail>>()
                .await
        })
        .await
        .context("failed to list account emails")?;

        let email = emails
            .into_iter()
            .find(|e| e.primary)
            .map(|e| e.email)
            .context("account has no primary email")?;

        Ok(UserIdentity { username, email })
    }

    /// Look up the fixed sync repository under `owner`.
    ///
    /// `Ok(None)` means a clean 404 — the repository does not exist yet.
    /// Any other failure propagates so the retry layer can see it.
    pub async fn lookup_repo(&self, token: &str, owner: &str) -> Result<Option<GhRepo>> {
        let resp = self
            .http
            .get(format!("{}/repos/{owner}/{SYNC_REPO_NAME}", self.api_base))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, ACCEPT_GITHUB_V3)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let repo: GhRepo = resp.error_for_status()?.json().await?;
        Ok(Some(repo))
    }

    /// Create the private sync repository on the account the token belongs to.
    pub async fn create_private_repo(&self, token: &str) -> Result<GhRepo> {
        let repo: GhRepo = self
            .http
            .post(format!("{}/user/repos", self.api_base))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, ACCEPT_GITHUB_V3)
            .json(&serde_json::json!({
                "name": SYNC_REPO_NAME,
                "private": true,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_embeds_client_and_state() {
        let gh = GithubClient::new("https://api.github.com", "https://github.com").unwrap();
        let url = gh.authorize_url("abc123", "deadbeef");
        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("client_id=abc123"));
        assert!(url.contains("state=deadbeef"));
        assert!(url.contains("scope=repo%20user:email"));
    }

    #[test]
    fn base_urls_are_normalized() {
        let gh = GithubClient::new("https://api.github.com/", "https://github.com/").unwrap();
        assert!(!gh.api_base.ends_with('/'));
        assert!(!gh.oauth_base.ends_with('/'));
    }
}
