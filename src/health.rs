// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Health check support.
//!
//! This module provides the liveness, readiness and status endpoints of the
//! controller.

use std::sync::{Arc, RwLock};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::StatusCode as HttpStatusCode;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::ObjectCache;
use crate::function::ReconcileKey;
use crate::leader_election::LeaderState;
use crate::workqueue::WorkQueue;

/// Snapshot served on `/statusz`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Identity of this replica.
    pub identity: String,
    /// Whether leader election is enabled.
    pub leader_election: bool,
    /// Leadership state of this replica.
    pub leader_state: &'static str,
    /// Most recently observed lease holder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    /// Whether the watch caches of the current term finished their initial list.
    pub caches_synced: bool,
    /// Keys waiting in the work queue.
    pub queue_depth: usize,
}

struct Term {
    cache: Arc<dyn ObjectCache>,
    queue: WorkQueue<ReconcileKey>,
}

struct Inner {
    identity: String,
    leader_election: bool,
    state: LeaderState,
    leader: Option<String>,
    term: Option<Term>,
}

/// Shared view of the controller's state, updated by the controller manager.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<Inner>>,
}

impl HealthState {
    /// Creates the state for a replica named `identity`.
    pub fn new(identity: impl Into<String>, leader_election: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                identity: identity.into(),
                leader_election,
                state: LeaderState::Standby,
                leader: None,
                term: None,
            })),
        }
    }

    /// Records the leadership state.
    pub fn set_leader_state(&self, state: LeaderState) {
        self.inner.write().unwrap().state = state;
    }

    /// Records the observed lease holder.
    pub fn set_leader(&self, leader: impl Into<String>) {
        self.inner.write().unwrap().leader = Some(leader.into());
    }

    /// Attaches the cache and queue of a running term.
    pub fn attach(&self, cache: Arc<dyn ObjectCache>, queue: WorkQueue<ReconcileKey>) {
        self.inner.write().unwrap().term = Some(Term { cache, queue });
    }

    /// Detaches the current term.
    pub fn detach(&self) {
        self.inner.write().unwrap().term = None;
    }

    /// Returns a snapshot of the state.
    pub fn status(&self) -> Status {
        let inner = self.inner.read().unwrap();
        let (caches_synced, queue_depth) = match &inner.term {
            Some(term) => (term.cache.has_synced(), term.queue.len()),
            None => (false, 0),
        };
        Status {
            identity: inner.identity.clone(),
            leader_election: inner.leader_election,
            leader_state: inner.state.as_str(),
            leader: inner.leader.clone(),
            caches_synced,
            queue_depth,
        }
    }

    /// Returns true if the replica can serve its role.
    ///
    /// A standby is ready. An active replica is ready once its caches synced.
    pub fn is_ready(&self) -> bool {
        let status = self.status();
        if status.leader_election && status.leader_state != LeaderState::Leading.as_str() {
            return true;
        }
        status.caches_synced
    }
}

/// Health check server.
///
/// Serves HTTP endpoints for health checks.
pub struct HealthServer {
    state: HealthState,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a new health server.
    pub fn new(state: HealthState, bind_address: String, bind_port: u16) -> Self {
        Self {
            state,
            bind_address,
            bind_port,
        }
    }

    /// Runs the health server until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("health server listening on {}", addr);

        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let state = self.state.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let http = hyper::server::conn::http1::Builder::new();
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = state.clone();
                    async move { Ok::<_, hyper::Error>(route(req.uri().path(), &state)) }
                });

                if let Err(e) = http.serve_connection(io, service).await {
                    tracing::debug!(error = %e, "health connection closed with error");
                }
            });
        }
    }

    /// Runs the health server in a background task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

fn route(path: &str, state: &HealthState) -> Response<Full<Bytes>> {
    match path {
        "/healthz" => response(HttpStatusCode::OK, "text/plain", "ok"),
        "/readyz" => {
            if state.is_ready() {
                response(HttpStatusCode::OK, "text/plain", "ok")
            } else {
                response(HttpStatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
            }
        }
        "/statusz" => match serde_json::to_string(&state.status()) {
            Ok(json) => response(HttpStatusCode::OK, "application/json", json),
            Err(e) => response(
                HttpStatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            ),
        },
        _ => response(HttpStatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

fn response(
    status: HttpStatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
