//! WebDAV driver tests against an in-process stub server.
//!
//! The stub keeps files and collections in memory and records every
//! request, so the `.git` exclusion and retry behavior can be asserted
//! without a real DAV deployment.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tempfile::TempDir;

use arcadia_sync::retry::RetryConfig;
use arcadia_sync::webdav::WebDavClient;

#[derive(Default)]
struct DavStore {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    /// (method, path) of every request seen.
    log: Vec<(String, String)>,
    /// Paths that answer MKCOL with 423 this many more times.
    locked: HashMap<String, u32>,
}

type Shared = Arc<Mutex<DavStore>>;

async fn dav_handler(State(store): State<Shared>, req: Request<Body>) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().trim_matches('/').to_string();
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    let mut s = store.lock().unwrap();
    s.log.push((method.clone(), path.clone()));

    match method.as_str() {
        "MKCOL" => {
            if let Some(n) = s.locked.get_mut(&path) {
                if *n > 0 {
                    *n -= 1;
                    return StatusCode::LOCKED.into_response();
                }
            }
            if s.dirs.contains(&path) {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            s.dirs.insert(path);
            StatusCode::CREATED.into_response()
        }
        "PUT" => {
            s.files.insert(path, body.to_vec());
            StatusCode::CREATED.into_response()
        }
        "GET" => match s.files.get(&path) {
            Some(bytes) => bytes.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        "PROPFIND" => {
            if !s.dirs.contains(&path) {
                return StatusCode::NOT_FOUND.into_response();
            }
            let mut xml = String::from(
                r#"<?xml version="1.0"?><D:multistatus xmlns:D="DAV:">"#,
            );
            xml.push_str(&format!(
                "<D:response><D:href>/{path}/</D:href><D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat></D:response>"
            ));
            let prefix = format!("{path}/");
            for d in &s.dirs {
                if let Some(rest) = d.strip_prefix(&prefix) {
                    if !rest.is_empty() && !rest.contains('/') {
                        xml.push_str(&format!(
                            "<D:response><D:href>/{d}/</D:href><D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat></D:response>"
                        ));
                    }
                }
            }
            for f in s.files.keys() {
                if let Some(rest) = f.strip_prefix(&prefix) {
                    if !rest.contains('/') {
                        xml.push_str(&format!(
                            "<D:response><D:href>/{f}</D:href><D:propstat><D:prop><D:resourcetype/></D:prop></D:propstat></D:response>"
                        ));
                    }
                }
            }
            xml.push_str("</D:multistatus>");
            (
                StatusCode::MULTI_STATUS,
                [("Content-Type", "application/xml")],
                xml,
            )
                .into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Bind the stub on a random port; returns (base_url, store).
async fn spawn_stub() -> (String, Shared) {
    let store: Shared = Arc::new(Mutex::new(DavStore::default()));
    let app = Router::new().fallback(dav_handler).with_state(store.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), store)
}

fn client(base: &str) -> WebDavClient {
    WebDavClient::new(base, "user", "pw")
        .unwrap()
        .with_retry(RetryConfig::instant(), RetryConfig::instant())
}

#[tokio::test]
async fn round_trip_preserves_tree() {
    let (base, _store) = spawn_stub().await;
    let dav = client(&base);

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("library");
    std::fs::create_dir_all(local.join("sub")).unwrap();
    std::fs::write(local.join("a.txt"), b"alpha").unwrap();
    std::fs::write(local.join("sub").join("b.txt"), b"beta").unwrap();

    dav.upload_directory(&local, "arcadia").await.unwrap();

    let restored = dir.path().join("restored");
    dav.download_directory("arcadia", &restored).await.unwrap();

    assert_eq!(std::fs::read(restored.join("a.txt")).unwrap(), b"alpha");
    assert_eq!(
        std::fs::read(restored.join("sub").join("b.txt")).unwrap(),
        b"beta"
    );
}

#[tokio::test]
async fn vcs_metadata_is_never_uploaded() {
    let (base, store) = spawn_stub().await;
    let dav = client(&base);

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("library");
    std::fs::create_dir_all(local.join(".git").join("objects")).unwrap();
    // The remote URL in .git/config is exactly what must not leak.
    std::fs::write(
        local.join(".git").join("config"),
        b"[remote \"origin\"]\n  url = https://token@example.com/r.git\n",
    )
    .unwrap();
    std::fs::write(local.join(".git").join("objects").join("aa"), b"blob").unwrap();
    std::fs::write(local.join("data.json"), br#"{"g":1}"#).unwrap();

    dav.upload_directory(&local, "arcadia").await.unwrap();

    let s = store.lock().unwrap();
    assert!(
        s.log.iter().all(|(_, path)| !path.contains(".git")),
        "a request touched a .git path: {:?}",
        s.log
    );
    assert!(s.files.contains_key("arcadia/data.json"));
    assert_eq!(s.files.len(), 1);
}

#[tokio::test]
async fn locked_directory_creation_is_retried() {
    let (base, store) = spawn_stub().await;
    store.lock().unwrap().locked.insert("arcadia".to_string(), 2);
    let dav = client(&base);

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("library");
    std::fs::create_dir_all(&local).unwrap();
    std::fs::write(local.join("a.txt"), b"alpha").unwrap();

    dav.upload_directory(&local, "arcadia").await.unwrap();

    let s = store.lock().unwrap();
    assert!(s.dirs.contains("arcadia"));
    let mkcols = s
        .log
        .iter()
        .filter(|(m, p)| m == "MKCOL" && p == "arcadia")
        .count();
    assert_eq!(mkcols, 3, "two locked responses then one success");
}

#[tokio::test]
async fn existing_remote_directories_are_tolerated() {
    let (base, _store) = spawn_stub().await;
    let dav = client(&base);

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("library");
    std::fs::create_dir_all(&local).unwrap();
    std::fs::write(local.join("a.txt"), b"one").unwrap();

    // Upload twice: the second run hits MKCOL 405 on every directory.
    dav.upload_directory(&local, "arcadia").await.unwrap();
    std::fs::write(local.join("a.txt"), b"two").unwrap();
    dav.upload_directory(&local, "arcadia").await.unwrap();

    assert_eq!(dav.get("arcadia/a.txt").await.unwrap(), b"two");
}
