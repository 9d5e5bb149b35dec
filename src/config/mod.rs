use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::error;

pub const DEFAULT_CALLBACK_PORT: u16 = 20721;
const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
const DEFAULT_OAUTH_BASE_URL: &str = "https://github.com";
const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 300;
const SYNC_TREE_DIR: &str = "library";
const DATA_FILE_NAME: &str = "data.json";

// ─── SyncBackend ─────────────────────────────────────────────────────────────

/// Which remote backs the sync tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncBackend {
    /// Private GitHub repository (`my-arcadia`), driven over Git.
    Github,
    /// Plain WebDAV server, driven as a recursive tree mirror.
    Webdav,
}

impl std::str::FromStr for SyncBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "webdav" => Ok(Self::Webdav),
            other => Err(format!(
                "unknown sync backend '{other}' (expected: github | webdav)"
            )),
        }
    }
}

// ─── GithubConfig ────────────────────────────────────────────────────────────

/// GitHub backend configuration (`[github]` in config.toml).
///
/// `access_token` and `username` are written back by `arcadia-sync login`;
/// everything else is user-supplied or defaulted.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GithubConfig {
    /// OAuth application client id.
    pub client_id: String,
    /// OAuth application client secret.
    pub client_secret: String,
    /// REST API base URL (default: https://api.github.com).
    pub api_base_url: String,
    /// OAuth authorize/token base URL (default: https://github.com).
    pub oauth_base_url: String,
    /// Fixed local port the browser redirect lands on (default: 20721).
    pub callback_port: u16,
    /// How long `login` waits for the user to finish the browser flow
    /// before tearing the listener down (seconds, default: 300).
    pub auth_timeout_secs: u64,
    /// Access token obtained by `login`. Grants `repo` scope — treat the
    /// config file accordingly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Account login resolved during `login`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            oauth_base_url: DEFAULT_OAUTH_BASE_URL.to_string(),
            callback_port: DEFAULT_CALLBACK_PORT,
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            access_token: None,
            username: None,
        }
    }
}

// ─── WebdavConfig ────────────────────────────────────────────────────────────

/// WebDAV backend configuration (`[webdav]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebdavConfig {
    /// Server base URL, e.g. `https://dav.example.com/remote.php/dav/files/me`.
    pub url: String,
    /// Basic-auth username.
    pub username: String,
    /// Basic-auth password. Stored in plain text in config.toml, same as the
    /// host application's config store.
    pub password: String,
    /// Remote directory the sync tree mirrors into (default: "arcadia").
    pub remote_dir: String,
}

impl Default for WebdavConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            remote_dir: "arcadia".to_string(),
        }
    }
}

// ─── TOML shadow struct ──────────────────────────────────────────────────────

/// Raw deserialization target for `{data_dir}/config.toml`.
///
/// Every field is optional — the resolved [`SyncConfig`] applies
/// CLI/env > TOML > built-in defaults, in that order.
#[derive(Debug, Default, Deserialize, Serialize)]
struct TomlConfig {
    /// Which backend `push`/`pull` drive: "github" (default) | "webdav".
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<SyncBackend>,
    /// Log level (trace, debug, info, warn, error).
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<String>,
    /// Override the sync tree location (default: `{data_dir}/library`).
    #[serde(skip_serializing_if = "Option::is_none")]
    sync_tree: Option<PathBuf>,
    /// Override the canonical data file (default: `{sync_tree}/data.json`).
    #[serde(skip_serializing_if = "Option::is_none")]
    data_file: Option<PathBuf>,
    /// GitHub backend settings (`[github]`).
    #[serde(skip_serializing_if = "Option::is_none")]
    github: Option<GithubConfig>,
    /// WebDAV backend settings (`[webdav]`).
    #[serde(skip_serializing_if = "Option::is_none")]
    webdav: Option<WebdavConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── SyncConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root for config.toml and the default sync tree location.
    pub data_dir: PathBuf,
    /// The local directory mirrored to the remote. Owned exclusively by the
    /// sync subsystem while an operation is in flight.
    pub sync_tree: PathBuf,
    /// The serialized key-path store. Only inspected for top-level
    /// emptiness — the divergence heuristic during provisioning.
    pub data_file: PathBuf,
    /// Backend `push`/`pull` drive.
    pub backend: SyncBackend,
    /// Log level string handed to the EnvFilter.
    pub log: String,
    pub github: GithubConfig,
    pub webdav: WebdavConfig,
}

impl SyncConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        data_dir: Option<PathBuf>,
        backend: Option<SyncBackend>,
        log: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let backend = backend.or(toml.backend).unwrap_or(SyncBackend::Github);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let sync_tree = toml
            .sync_tree
            .unwrap_or_else(|| data_dir.join(SYNC_TREE_DIR));
        let data_file = toml
            .data_file
            .unwrap_or_else(|| sync_tree.join(DATA_FILE_NAME));

        let mut github = toml.github.unwrap_or_default();
        if let Ok(id) = std::env::var("ARCADIA_GITHUB_CLIENT_ID") {
            if !id.is_empty() {
                github.client_id = id;
            }
        }
        if let Ok(secret) = std::env::var("ARCADIA_GITHUB_CLIENT_SECRET") {
            if !secret.is_empty() {
                github.client_secret = secret;
            }
        }
        if let Ok(token) = std::env::var("ARCADIA_GITHUB_TOKEN") {
            if !token.is_empty() {
                github.access_token = Some(token);
            }
        }

        let webdav = toml.webdav.unwrap_or_default();

        Self {
            data_dir,
            sync_tree,
            data_file,
            backend,
            log,
            github,
            webdav,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Write the credential obtained by `login` back into config.toml,
    /// preserving any other settings already in the file.
    pub fn persist_credential(&mut self, username: &str, access_token: &str) -> anyhow::Result<()> {
        self.github.username = Some(username.to_string());
        self.github.access_token = Some(access_token.to_string());

        let mut toml = load_toml(&self.data_dir).unwrap_or_default();
        let mut github = toml.github.unwrap_or_else(|| self.github.clone());
        github.username = Some(username.to_string());
        github.access_token = Some(access_token.to_string());
        toml.github = Some(github);

        std::fs::create_dir_all(&self.data_dir)?;
        let rendered = toml::to_string_pretty(&toml)?;
        std::fs::write(self.config_path(), rendered)?;
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/arcadia
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("arcadia");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/arcadia or ~/.local/share/arcadia
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("arcadia");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("arcadia");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\arcadia
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("arcadia");
        }
    }
    PathBuf::from(".arcadia")
}
