//! WebDAV sync driver: recursive tree mirrors over MKCOL / PUT / GET /
//! PROPFIND.
//!
//! Upload skips `.git` wholesale — the Git remote URL inside it embeds
//! the access token, and VCS metadata has no business on the DAV server.
//! Both directions are last-writer-wins: the caller wipes the local tree
//! before a download, and uploads overwrite remote files in place.
//!
//! A local file that vanishes mid-upload is logged and skipped (the tree
//! may be partially populated); every other I/O failure propagates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, StatusCode};
use tracing::{debug, info, warn};

use crate::retry::{retry_fixed, RetryConfig};

const VCS_DIR: &str = ".git";
const HTTP_TIMEOUT_SECS: u64 = 60;

/// RFC 3986 path-segment escape set.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'/')
    .add(b'\\');

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?><D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/></D:prop></D:propfind>"#;

#[derive(Debug, thiserror::Error)]
pub enum WebDavError {
    #[error("HTTP {status} for {path}")]
    Status { status: StatusCode, path: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid WebDAV base URL: {0}")]
    BadBaseUrl(String),
    #[error("unparseable directory listing: {0}")]
    InvalidListing(String),
}

impl WebDavError {
    fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// One row of a PROPFIND `Depth: 1` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    /// Path relative to the client base, no leading slash.
    pub path: String,
    /// Final path segment.
    pub name: String,
    pub is_dir: bool,
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WebDavClient {
    http: reqwest::Client,
    /// `scheme://host[:port]`, no trailing slash.
    origin: String,
    /// Path part of the base URL ("" or "/x/y"), no trailing slash.
    base_path: String,
    username: String,
    password: String,
    transfer_retry: RetryConfig,
    lock_retry: RetryConfig,
}

impl WebDavClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self, WebDavError> {
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|e| WebDavError::BadBaseUrl(format!("{base_url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| WebDavError::BadBaseUrl(format!("{base_url}: missing host")))?;
        let mut origin = format!("{}://{host}", parsed.scheme());
        if let Some(port) = parsed.port() {
            origin.push_str(&format!(":{port}"));
        }
        let base_path = parsed.path().trim_end_matches('/').to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            origin,
            base_path,
            username: username.to_string(),
            password: password.to_string(),
            transfer_retry: RetryConfig::transfer(),
            lock_retry: RetryConfig::transfer(),
        })
    }

    /// Swap the retry policies. Unit tests use [`RetryConfig::instant`]
    /// to avoid real waiting.
    pub fn with_retry(mut self, transfer: RetryConfig, lock: RetryConfig) -> Self {
        self.transfer_retry = transfer;
        self.lock_retry = lock;
        self
    }

    fn url_for(&self, remote_path: &str) -> String {
        let mut out = format!("{}{}", self.origin, self.base_path);
        for seg in remote_path.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            out.push_str(&utf8_percent_encode(seg, PATH_SEGMENT).to_string());
        }
        out
    }

    /// Strip the base path from a multistatus `href` and percent-decode it.
    fn relative_path(&self, href: &str) -> Option<String> {
        let path = match reqwest::Url::parse(href) {
            Ok(url) => url.path().to_string(),
            Err(_) => href.to_string(),
        };
        let decoded = percent_decode_str(&path).decode_utf8().ok()?.to_string();
        let trimmed = decoded.trim_end_matches('/');
        let rel = trimmed.strip_prefix(&self.base_path).unwrap_or(trimmed);
        Some(rel.trim_start_matches('/').to_string())
    }

    // ── Protocol primitives ──────────────────────────────────────────────

    pub async fn mkcol(&self, path: &str) -> Result<(), WebDavError> {
        let resp = self
            .http
            .request(mkcol_method(), self.url_for(path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebDavError::Status {
                status,
                path: path.to_string(),
            })
        }
    }

    pub async fn put(&self, path: &str, contents: Vec<u8>) -> Result<(), WebDavError> {
        let resp = self
            .http
            .put(self.url_for(path))
            .basic_auth(&self.username, Some(&self.password))
            .body(contents)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebDavError::Status {
                status,
                path: path.to_string(),
            })
        }
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>, WebDavError> {
        let resp = self
            .http
            .get(self.url_for(path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WebDavError::Status {
                status,
                path: path.to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// List the immediate children of a remote directory.
    pub async fn list(&self, dir: &str) -> Result<Vec<DavEntry>, WebDavError> {
        let resp = self
            .http
            .request(propfind_method(), self.url_for(dir))
            .basic_auth(&self.username, Some(&self.password))
            .header("Depth", "1")
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        let status = resp.status();
        if status != StatusCode::MULTI_STATUS && !status.is_success() {
            return Err(WebDavError::Status {
                status,
                path: dir.to_string(),
            });
        }

        let body = resp.text().await?;
        let raw = parse_multistatus(&body).map_err(WebDavError::InvalidListing)?;
        let listed = dir.trim_matches('/');

        Ok(raw
            .into_iter()
            .filter_map(|(href, is_dir)| {
                let rel = self.relative_path(&href)?;
                // PROPFIND includes the listed collection itself — drop it.
                if rel == listed {
                    return None;
                }
                let name = rel.rsplit('/').next()?.to_string();
                if name.is_empty() {
                    return None;
                }
                Some(DavEntry {
                    path: rel,
                    name,
                    is_dir,
                })
            })
            .collect())
    }

    // ── Directory creation ───────────────────────────────────────────────

    /// Create a remote directory path segment by segment, tolerating
    /// "already exists" (405) responses.
    pub async fn ensure_dir_all(&self, dir: &str) -> Result<(), WebDavError> {
        let mut current = String::new();
        for seg in dir.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(seg);
            match self.mkcol_with_lock_retry(&current).await {
                Ok(()) => {}
                Err(e) if e.status_code() == Some(StatusCode::METHOD_NOT_ALLOWED) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// MKCOL with a capped retry loop for 423 "locked" responses.
    async fn mkcol_with_lock_retry(&self, path: &str) -> Result<(), WebDavError> {
        let mut attempt: u32 = 0;
        loop {
            match self.mkcol(path).await {
                Ok(()) => return Ok(()),
                Err(e)
                    if e.status_code() == Some(StatusCode::LOCKED)
                        && attempt < self.lock_retry.max_retries =>
                {
                    warn!(
                        path,
                        delay_ms = self.lock_retry.delay.as_millis() as u64,
                        "remote directory is locked — retrying"
                    );
                    tokio::time::sleep(self.lock_retry.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Tree mirrors ─────────────────────────────────────────────────────

    /// Mirror a local directory tree to the remote.
    pub async fn upload_directory(
        &self,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<(), WebDavError> {
        let mut stack: Vec<(PathBuf, String)> = vec![(
            local_dir.to_path_buf(),
            remote_dir.trim_matches('/').to_string(),
        )];

        while let Some((local, remote)) = stack.pop() {
            if local.file_name().map(|n| n == VCS_DIR).unwrap_or(false) {
                debug!(path = %local.display(), "skipping VCS metadata");
                continue;
            }

            let meta = match tokio::fs::metadata(&local).await {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %local.display(), "local entry not found — skipping");
                    continue;
                }
                Err(e) => return Err(WebDavError::io(&local, e)),
            };

            if meta.is_dir() {
                self.ensure_dir_all(&remote).await?;
                let mut rd = match tokio::fs::read_dir(&local).await {
                    Ok(rd) => rd,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %local.display(), "local directory not found — skipping");
                        continue;
                    }
                    Err(e) => return Err(WebDavError::io(&local, e)),
                };
                while let Some(entry) = rd
                    .next_entry()
                    .await
                    .map_err(|e| WebDavError::io(&local, e))?
                {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    stack.push((entry.path(), format!("{remote}/{name}")));
                }
            } else {
                let contents = match tokio::fs::read(&local).await {
                    Ok(c) => c,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %local.display(), "local file not found — skipping");
                        continue;
                    }
                    Err(e) => return Err(WebDavError::io(&local, e)),
                };
                retry_fixed(&self.transfer_retry, || self.put(&remote, contents.clone()))
                    .await?;
                debug!(remote = %remote, "uploaded");
            }
        }

        info!(local = %local_dir.display(), remote = remote_dir, "directory upload complete");
        Ok(())
    }

    /// Mirror a remote directory tree into the local filesystem.
    ///
    /// The caller is expected to have wiped `local_dir` first — this
    /// writes over whatever is there without reconciliation.
    pub async fn download_directory(
        &self,
        remote_dir: &str,
        local_dir: &Path,
    ) -> Result<(), WebDavError> {
        let mut stack: Vec<(String, PathBuf)> = vec![(
            remote_dir.trim_matches('/').to_string(),
            local_dir.to_path_buf(),
        )];

        while let Some((remote, local)) = stack.pop() {
            tokio::fs::create_dir_all(&local)
                .await
                .map_err(|e| WebDavError::io(&local, e))?;

            for entry in self.list(&remote).await? {
                let child_local = local.join(&entry.name);
                if entry.is_dir {
                    stack.push((entry.path, child_local));
                } else {
                    let bytes =
                        retry_fixed(&self.transfer_retry, || self.get(&entry.path)).await?;
                    tokio::fs::write(&child_local, &bytes)
                        .await
                        .map_err(|e| WebDavError::io(&child_local, e))?;
                    debug!(remote = %entry.path, "downloaded");
                }
            }
        }

        info!(remote = remote_dir, local = %local_dir.display(), "directory download complete");
        Ok(())
    }
}

fn mkcol_method() -> Method {
    Method::from_bytes(b"MKCOL").expect("MKCOL is a valid method token")
}

fn propfind_method() -> Method {
    Method::from_bytes(b"PROPFIND").expect("PROPFIND is a valid method token")
}

/// Pull `(href, is_collection)` pairs out of a PROPFIND multistatus body.
/// Namespace prefixes vary between servers; elements are matched by local
/// name only.
fn parse_multistatus(body: &str) -> Result<Vec<(String, bool)>, String> {
    let mut reader = Reader::from_str(body);
    let mut entries = Vec::new();
    let mut href: Option<String> = None;
    let mut is_dir = false;
    let mut in_href = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => {
                    href = None;
                    is_dir = false;
                }
                b"href" => in_href = true,
                b"collection" => is_dir = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"collection" => is_dir = true,
            Ok(Event::Text(t)) if in_href => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                href.get_or_insert_with(String::new).push_str(text.trim());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"href" => in_href = false,
                b"response" => {
                    if let Some(h) = href.take() {
                        entries.push((h, is_dir));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> WebDavClient {
        WebDavClient::new("https://dav.example.com/base", "user", "pw").unwrap()
    }

    #[test]
    fn url_for_escapes_segments() {
        let c = client();
        assert_eq!(
            c.url_for("games/Baldur's Gate/cover.png"),
            "https://dav.example.com/base/games/Baldur's%20Gate/cover.png"
        );
    }

    #[test]
    fn url_for_normalizes_slashes() {
        let c = client();
        assert_eq!(c.url_for("/a//b/"), "https://dav.example.com/base/a/b");
    }

    #[test]
    fn relative_path_strips_base_and_decodes() {
        let c = client();
        assert_eq!(
            c.relative_path("/base/games/Baldur's%20Gate/").as_deref(),
            Some("games/Baldur's Gate")
        );
        assert_eq!(
            c.relative_path("https://dav.example.com/base/a.txt").as_deref(),
            Some("a.txt")
        );
    }

    #[test]
    fn parses_multistatus_listing() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/base/arcadia/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/base/arcadia/data.json</D:href>
    <D:propstat><D:prop><D:resourcetype/></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/base/arcadia/covers/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;

        let entries = parse_multistatus(body).unwrap();
        assert_eq!(
            entries,
            vec![
                ("/base/arcadia/".to_string(), true),
                ("/base/arcadia/data.json".to_string(), false),
                ("/base/arcadia/covers/".to_string(), true),
            ]
        );
    }

    #[test]
    fn parses_unprefixed_namespace() {
        let body = r#"<multistatus xmlns="DAV:">
  <response><href>/f.bin</href><propstat><prop><resourcetype/></prop></propstat></response>
</multistatus>"#;
        let entries = parse_multistatus(body).unwrap();
        assert_eq!(entries, vec![("/f.bin".to_string(), false)]);
    }

    #[test]
    fn garbage_listing_is_an_error() {
        assert!(parse_multistatus("<multistatus><resp").is_err());
    }
}
