// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures: an in-process HTTP server and manager builders.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Response, StatusCode};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use modelstash::download::TransferSettings;
use modelstash::registry::JsonFileStore;
use modelstash::{
    ArtifactKind, ArtifactManager, ArtifactRegistry, LifecycleEvent, ManifestCatalog,
    ManifestEntry, Subscription,
};

/// Size of the payload every route serves.
pub const PAYLOAD_LEN: usize = 512 * 1024;

const SLOW_CHUNK: usize = 4 * 1024;
const SLOW_DELAY: Duration = Duration::from_millis(10);

/// Upper bound for any wait in the tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// In-process HTTP server serving one random payload.
///
/// Routes:
/// - `/fixed.bin`: whole payload with Content-Length
/// - `/slow.bin`: payload in small delayed chunks with Content-Length
/// - `/unsized.bin`: delayed chunks without Content-Length
/// - `/truncated.bin`: declares the full length, sends half
/// - `/error.bin`: HTTP 500
/// - `/abort.bin`: declares the full length, sends a few chunks, then fails
///   the body once [`MockServer::abort_body`] is called
pub struct MockServer {
    pub base_url: String,
    pub payload: Arc<Vec<u8>>,
    abort: Arc<Notify>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct ServerState {
    payload: Arc<Vec<u8>>,
    abort: Arc<Notify>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockServer {
    pub async fn start() -> Self {
        let mut payload = vec![0u8; PAYLOAD_LEN];
        rand::thread_rng().fill_bytes(&mut payload);
        let payload = Arc::new(payload);
        let abort = Arc::new(Notify::new());

        let app = Router::new()
            .route("/fixed.bin", get(fixed))
            .route("/slow.bin", get(slow))
            .route("/unsized.bin", get(unsized_body))
            .route("/truncated.bin", get(truncated))
            .route("/abort.bin", get(abort_midway))
            .route("/error.bin", get(server_error))
            .with_state(ServerState {
                payload: Arc::clone(&payload),
                abort: Arc::clone(&abort),
            });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server");
        });

        Self {
            base_url: format!("http://{}", addr),
            payload,
            abort,
            task,
        }
    }

    /// Make the pending `/abort.bin` body fail.
    pub fn abort_body(&self) {
        self.abort.notify_one();
    }

    pub fn url(&self, route: &str) -> String {
        format!("{}/{}", self.base_url, route)
    }

    /// SHA-256 of the payload as lowercase hex.
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.payload.as_slice()))
    }

    /// A catalog entry downloading `route` into `<id>.bin`.
    pub fn entry(&self, id: &str, route: &str) -> ManifestEntry {
        ManifestEntry::new(
            id,
            format!("Test {}", id),
            ArtifactKind::Transcription,
            PAYLOAD_LEN as u64,
            self.url(route),
            format!("{}.bin", id),
        )
    }
}

async fn fixed(State(state): State<ServerState>) -> Vec<u8> {
    state.payload.as_ref().clone()
}

fn delayed_chunks(payload: Vec<u8>) -> Body {
    let chunks: Vec<Vec<u8>> = payload.chunks(SLOW_CHUNK).map(<[u8]>::to_vec).collect();
    let stream = futures_util::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(SLOW_DELAY).await;
        Ok::<_, std::io::Error>(chunk)
    });
    Body::from_stream(stream)
}

async fn slow(State(state): State<ServerState>) -> Response<Body> {
    Response::builder()
        .header(header::CONTENT_LENGTH, state.payload.len())
        .body(delayed_chunks(state.payload.as_ref().clone()))
        .expect("slow response")
}

async fn unsized_body(State(state): State<ServerState>) -> Response<Body> {
    Response::builder()
        .body(delayed_chunks(state.payload.as_ref().clone()))
        .expect("unsized response")
}

async fn truncated(State(state): State<ServerState>) -> Response<Body> {
    let half = state.payload[..state.payload.len() / 2].to_vec();
    Response::builder()
        .header(header::CONTENT_LENGTH, state.payload.len())
        .body(delayed_chunks(half))
        .expect("truncated response")
}

async fn abort_midway(State(state): State<ServerState>) -> Response<Body> {
    let head: Vec<Vec<u8>> = state
        .payload
        .chunks(SLOW_CHUNK)
        .take(4)
        .map(<[u8]>::to_vec)
        .collect();
    let abort = Arc::clone(&state.abort);
    let stream = futures_util::stream::iter(head)
        .then(|chunk| async move {
            tokio::time::sleep(SLOW_DELAY).await;
            Ok::<_, std::io::Error>(chunk)
        })
        .chain(futures_util::stream::once(async move {
            abort.notified().await;
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "body aborted",
            ))
        }));
    Response::builder()
        .header(header::CONTENT_LENGTH, state.payload.len())
        .body(Body::from_stream(stream))
        .expect("abort response")
}

async fn server_error() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

/// Manager over `entries` with a durable registry in `storage`.
pub fn manager(
    storage: &Path,
    entries: Vec<ManifestEntry>,
    preference_order: Option<Vec<String>>,
) -> ArtifactManager {
    let catalog = ManifestCatalog::from_entries(entries).expect("valid catalog");
    let registry = ArtifactRegistry::open(Arc::new(JsonFileStore::new(
        storage.join("registry.json"),
    )))
    .expect("open registry");
    ArtifactManager::new(
        catalog,
        registry,
        storage,
        TransferSettings::default(),
        preference_order,
    )
    .expect("build manager")
}

/// Receive events until a terminal one for `id` arrives.
pub async fn events_until_terminal(sub: &mut Subscription, id: &str) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(TEST_TIMEOUT, sub.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event channel closed");
        let terminal = event.is_terminal() && event.artifact_id() == Some(id);
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Wait for the first progress event for `id`.
pub async fn first_progress(sub: &mut Subscription, id: &str) {
    loop {
        let event = tokio::time::timeout(TEST_TIMEOUT, sub.recv())
            .await
            .expect("timed out waiting for progress")
            .expect("event channel closed");
        match event {
            LifecycleEvent::Progress { id: event_id, .. } if event_id == id => return,
            other if other.is_terminal() => panic!("transfer ended early: {:?}", other),
            _ => {}
        }
    }
}

/// Progress percentages published for `id`, in order.
pub fn progress_percents(events: &[LifecycleEvent], id: &str) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            LifecycleEvent::Progress { id: event_id, state } if event_id == id => {
                Some(state.progress_percent)
            }
            _ => None,
        })
        .collect()
}

/// Count events matching `predicate`.
pub fn count(events: &[LifecycleEvent], predicate: impl Fn(&LifecycleEvent) -> bool) -> usize {
    events.iter().filter(|event| predicate(event)).count()
}
