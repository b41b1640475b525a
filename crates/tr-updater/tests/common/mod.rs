#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tr_updater::environment::DeploymentProbe;
use tr_updater::relaunch::ProcessControl;

pub const OLD_BINARY: &[u8] = b"#!/bin/sh\necho old build\n";
pub const NEW_BINARY: &[u8] = b"#!/bin/sh\necho new build, a bit longer than the old one\n";
pub const ASSET: &str = "hasheous-taskrunner-linux-1.5.0-x64";

// ---------------------------------------------------------------------------
// Release feed server
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FeedState {
    feed: Mutex<Option<Result<String, u16>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    hits: Mutex<HashMap<String, usize>>,
    failures_left: Mutex<HashMap<String, usize>>,
}

/// Local stand-in for the release feed and its asset downloads.
#[derive(Clone)]
pub struct FeedServer {
    pub addr: SocketAddr,
    state: Arc<FeedState>,
}

impl FeedServer {
    pub async fn start() -> Self {
        let state = Arc::new(FeedState::default());
        let router = Router::new()
            .route("/releases", get(releases))
            .route("/assets/{name}", get(asset))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });

        Self { addr, state }
    }

    pub fn feed_url(&self) -> String {
        format!("http://{}/releases", self.addr)
    }

    pub fn asset_url(&self, name: &str) -> String {
        format!("http://{}/assets/{name}", self.addr)
    }

    pub fn set_feed(&self, body: Value) {
        *self.state.feed.lock().expect("lock") = Some(Ok(body.to_string()));
    }

    pub fn set_raw_feed(&self, body: &str) {
        *self.state.feed.lock().expect("lock") = Some(Ok(body.to_string()));
    }

    pub fn set_feed_status(&self, status: u16) {
        *self.state.feed.lock().expect("lock") = Some(Err(status));
    }

    pub fn put_file(&self, name: &str, body: &[u8]) {
        self.state
            .files
            .lock()
            .expect("lock")
            .insert(name.to_string(), body.to_vec());
    }

    /// Answer the next `count` requests for `name` with a 500.
    pub fn fail_next(&self, name: &str, count: usize) {
        self.state
            .failures_left
            .lock()
            .expect("lock")
            .insert(name.to_string(), count);
    }

    pub fn hits(&self, name: &str) -> usize {
        self.state
            .hits
            .lock()
            .expect("lock")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Publish one stable release with the binary, and a checksum when given.
    pub fn publish(&self, tag: &str, binary: &[u8], checksum: Option<&str>) {
        let mut assets = vec![json!({ "name": ASSET, "browser_download_url": self.asset_url(ASSET) })];
        self.put_file(ASSET, binary);
        if let Some(checksum) = checksum {
            let name = format!("{ASSET}.sha256");
            assets.push(json!({ "name": name, "browser_download_url": self.asset_url(&name) }));
            self.put_file(&name, format!("{checksum}  {ASSET}\n").as_bytes());
        }
        self.set_feed(json!([
            { "tag_name": "v1.0.0", "prerelease": false, "assets": [] },
            { "tag_name": tag, "prerelease": false, "assets": assets },
        ]));
    }
}

async fn releases(State(state): State<Arc<FeedState>>) -> Response {
    match state.feed.lock().expect("lock").clone() {
        Some(Ok(body)) => ([("content-type", "application/json")], body).into_response(),
        Some(Err(status)) => StatusCode::from_u16(status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        None => ([("content-type", "application/json")], "[]").into_response(),
    }
}

async fn asset(State(state): State<Arc<FeedState>>, UrlPath(name): UrlPath<String>) -> Response {
    *state.hits.lock().expect("lock").entry(name.clone()).or_default() += 1;

    if let Some(left) = state.failures_left.lock().expect("lock").get_mut(&name) {
        if *left > 0 {
            *left -= 1;
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    match state.files.lock().expect("lock").get(&name) {
        Some(body) => body.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Records relaunches and exits instead of performing them.
#[derive(Default)]
pub struct RecordingProcess {
    pub relaunches: Mutex<Vec<(PathBuf, Vec<String>)>>,
    pub helpers: Mutex<Vec<PathBuf>>,
    pub exits: Mutex<Vec<i32>>,
    pub fail_relaunch: bool,
    pub fail_helper: bool,
}

impl RecordingProcess {
    pub fn failing_relaunch() -> Self {
        Self {
            fail_relaunch: true,
            ..Self::default()
        }
    }

    pub fn failing_helper() -> Self {
        Self {
            fail_helper: true,
            ..Self::default()
        }
    }

    pub fn exit_codes(&self) -> Vec<i32> {
        self.exits.lock().expect("lock").clone()
    }

    pub fn relaunched(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.relaunches.lock().expect("lock").clone()
    }
}

impl ProcessControl for RecordingProcess {
    fn relaunch(&self, executable: &Path, args: &[String]) -> io::Result<()> {
        if self.fail_relaunch {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "relaunch refused"));
        }
        self.relaunches
            .lock()
            .expect("lock")
            .push((executable.to_path_buf(), args.to_vec()));
        Ok(())
    }

    fn spawn_helper(&self, script: &Path) -> io::Result<()> {
        if self.fail_helper {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "helper refused"));
        }
        self.helpers.lock().expect("lock").push(script.to_path_buf());
        Ok(())
    }

    fn exit(&self, code: i32) {
        self.exits.lock().expect("lock").push(code);
    }
}

/// A probe that never reports a development or container environment.
pub fn quiet_probe(dir: &Path) -> DeploymentProbe {
    DeploymentProbe {
        dev_marker_var: String::new(),
        container_marker_var: String::new(),
        container_marker_file: dir.join("no-such-marker"),
        cgroup_file: None,
        check_debugger: false,
    }
}

pub fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
