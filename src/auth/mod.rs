//! GitHub OAuth login over a short-lived localhost listener.
//!
//! The flow: generate a CSRF state nonce, hand the caller an authorize
//! URL to open in the browser, and wait for the provider to redirect back
//! to `/callback` on the fixed local port. The listener is an owned value
//! held by [`AuthFlow`] — it is torn down on success, failure, and
//! timeout alike, so the port is always released. A second flow started
//! while one is listening fails at bind time with
//! [`AuthError::PortInUse`] instead of hanging.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use rand_core::{OsRng, RngCore};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::config::GithubConfig;
use crate::github::GithubClient;

const SUCCESS_PAGE: &str =
    "<html><body><h2>Authentication complete</h2><p>You can close this window and return to Arcadia.</p></body></html>";
const STALE_PAGE: &str =
    "<html><body><h2>No pending authorization</h2><p>This login attempt has already finished.</p></body></html>";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("local callback port {0} is already in use — is another login in progress?")]
    PortInUse(u16),
    #[error("authorization callback state does not match the expected nonce")]
    StateMismatch,
    #[error("authorization timed out after {0} s")]
    TimedOut(u64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Credential produced by a completed login flow.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub access_token: String,
}

/// A started login flow holding the bound callback listener.
///
/// Dropping the flow releases the port; [`AuthFlow::finish`] consumes it
/// and guarantees the same on every terminal path.
pub struct AuthFlow {
    listener: TcpListener,
    state: String,
    authorize_url: String,
    client_id: String,
    client_secret: String,
    timeout: Duration,
}

impl AuthFlow {
    /// Bind the callback listener and compute the authorize URL.
    pub async fn start(gh: &GithubClient, config: &GithubConfig) -> Result<Self, AuthError> {
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            return Err(AuthError::Other(anyhow!(
                "github.client_id / github.client_secret are not configured"
            )));
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.callback_port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                AuthError::PortInUse(config.callback_port)
            } else {
                AuthError::Other(
                    anyhow::Error::new(e).context("failed to bind the OAuth callback listener"),
                )
            }
        })?;

        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        let state = hex::encode(nonce);

        let authorize_url = gh.authorize_url(&config.client_id, &state);
        info!(port = config.callback_port, "OAuth callback listener bound");

        Ok(Self {
            listener,
            state,
            authorize_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            timeout: Duration::from_secs(config.auth_timeout_secs),
        })
    }

    /// The URL the user must open in a browser to authorize the app.
    pub fn authorize_url(&self) -> &str {
        &self.authorize_url
    }

    /// Serve the callback until the flow reaches a terminal state, then
    /// tear the listener down and report the outcome.
    pub async fn finish(self, gh: &GithubClient) -> Result<Credential, AuthError> {
        let AuthFlow {
            listener,
            state,
            authorize_url: _,
            client_id,
            client_secret,
            timeout,
        } = self;

        let (done_tx, done_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let ctx = Arc::new(CallbackCtx {
            expected_state: state,
            gh: gh.clone(),
            client_id,
            client_secret,
            done: Mutex::new(Some(done_tx)),
        });

        let app = Router::new()
            .route("/callback", get(handle_callback))
            .with_state(ctx);

        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let outcome = tokio::select! {
            res = done_rx => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(AuthError::Other(anyhow!(
                    "callback handler dropped without reporting a result"
                ))),
            },
            _ = tokio::time::sleep(timeout) => Err(AuthError::TimedOut(timeout.as_secs())),
        };

        // Tear the listener down on every path before reporting.
        let _ = shutdown_tx.send(());
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err = %e, "callback server error during shutdown"),
            Err(e) => warn!(err = %e, "callback server task failed during shutdown"),
        }

        if let Ok(cred) = &outcome {
            info!(username = %cred.username, "OAuth login completed");
        }
        outcome
    }
}

// ─── Callback handling ───────────────────────────────────────────────────────

struct CallbackCtx {
    expected_state: String,
    gh: GithubClient,
    client_id: String,
    client_secret: String,
    done: Mutex<Option<oneshot::Sender<Result<Credential, AuthError>>>>,
}

async fn handle_callback(
    State(ctx): State<Arc<CallbackCtx>>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<String> {
    let Some(tx) = ctx.done.lock().await.take() else {
        return Html(STALE_PAGE.to_string());
    };

    let outcome = exchange(&ctx, &params).await;
    let page = match &outcome {
        Ok(_) => SUCCESS_PAGE.to_string(),
        Err(e) => format!(
            "<html><body><h2>Authentication failed</h2><p>{e}</p></body></html>"
        ),
    };
    let _ = tx.send(outcome);
    Html(page)
}

async fn exchange(
    ctx: &CallbackCtx,
    params: &HashMap<String, String>,
) -> Result<Credential, AuthError> {
    let returned_state = params.get("state").map(String::as_str).unwrap_or_default();
    if returned_state != ctx.expected_state {
        warn!("OAuth callback carried an unexpected state value");
        return Err(AuthError::StateMismatch);
    }

    let code = params
        .get("code")
        .ok_or_else(|| AuthError::Other(anyhow!("callback is missing the 'code' parameter")))?;

    let access_token = ctx
        .gh
        .exchange_code(&ctx.client_id, &ctx.client_secret, code)
        .await?;
    let username = ctx.gh.user_login(&access_token).await?;

    Ok(Credential {
        username,
        access_token,
    })
}
