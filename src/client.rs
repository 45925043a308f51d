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

//! Write-side boundaries: the cluster API client and the event sink.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::{MemoryCache, ObjectCache};
use crate::function::{Function, ReconcileKey};
use crate::resources::{DependentKind, DependentResource};

/// Errors returned by the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with the same name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The apiserver rejected the object as invalid.
    #[error("invalid object: {0}")]
    Invalid(String),

    /// Network failure, throttling or any other retryable condition.
    #[error("transient API error: {0}")]
    Transient(String),
}

/// Creates dependent objects in the cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Creates `resource`.
    async fn create(&self, resource: &DependentResource) -> Result<(), ApiError>;
}

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something the user should act on.
    Warning,
}

/// Event reasons surfaced on `Function` objects.
pub mod reasons {
    /// The function and all its dependents exist.
    pub const SYNCED: &str = "Synced";
    /// A dependent name is taken by an object the function does not control.
    pub const RESOURCE_EXISTS: &str = "ErrResourceExists";
    /// The function spec cannot be reconciled.
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

/// Event messages surfaced on `Function` objects.
pub mod messages {
    /// Message for [`super::reasons::SYNCED`].
    pub const SYNCED: &str = "Function synced successfully";

    /// Message for [`super::reasons::RESOURCE_EXISTS`].
    pub fn resource_exists(name: &str) -> String {
        format!("Resource {name:?} already exists and is not managed by Function")
    }
}

/// Publishes user-visible events about a `Function`.
///
/// Recording is fire-and-forget: failures are logged by the implementation
/// and never fail a reconciliation.
#[async_trait]
pub trait EventRecorder: Send + Sync + 'static {
    /// Records an event on `function`.
    async fn record(&self, function: &Function, type_: EventType, reason: &str, message: String);
}

/// [`ClusterClient`] that records every create call.
///
/// Optionally mirrors created objects into a [`MemoryCache`], the way a watch
/// would, and fails calls on demand.
#[derive(Clone, Default)]
pub struct RecordingClient {
    created: Arc<Mutex<Vec<DependentResource>>>,
    failures: Arc<Mutex<VecDeque<ApiError>>>,
    cache: Option<MemoryCache>,
    latency: Option<Duration>,
    in_flight: Arc<Mutex<HashMap<ReconcileKey, usize>>>,
    max_in_flight: Arc<Mutex<HashMap<ReconcileKey, usize>>>,
}

impl RecordingClient {
    /// Creates a client that only records calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors created objects into `cache`.
    pub fn with_cache(mut self, cache: MemoryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Delays every create call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails the next create call with `error`.
    pub fn fail_next(&self, error: ApiError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// All successful create calls, in order.
    pub fn created(&self) -> Vec<DependentResource> {
        self.created.lock().unwrap().clone()
    }

    /// Number of successful create calls.
    pub fn create_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Kinds created, in order.
    pub fn created_kinds(&self) -> Vec<DependentKind> {
        self.created().iter().map(DependentResource::kind).collect()
    }

    /// Largest number of concurrent create calls observed for one owner.
    pub fn max_concurrent_for(&self, owner: &ReconcileKey) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(owner)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, owner: &ReconcileKey) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(owner.clone()).or_insert(0);
        *count += 1;
        let mut max = self.max_in_flight.lock().unwrap();
        let seen = max.entry(owner.clone()).or_insert(0);
        *seen = (*seen).max(*count);
    }

    fn exit(&self, owner: &ReconcileKey) {
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(owner) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ClusterClient for RecordingClient {
    async fn create(&self, resource: &DependentResource) -> Result<(), ApiError> {
        let owner = resource.meta().owner.owner_key();
        self.enter(&owner);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.exit(&owner);

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        if let Some(cache) = &self.cache {
            let meta = resource.meta();
            if cache
                .get_dependent(resource.kind(), &meta.namespace, &meta.name)
                .is_some()
            {
                return Err(ApiError::AlreadyExists(meta.name.clone()));
            }
            cache.insert_created(resource);
        }
        self.created.lock().unwrap().push(resource.clone());
        Ok(())
    }
}

/// An event captured by [`RecordingEventRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Function the event is attached to.
    pub key: ReconcileKey,
    /// Severity.
    pub type_: EventType,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

/// [`EventRecorder`] that keeps events in memory.
#[derive(Clone, Default)]
pub struct RecordingEventRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingEventRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, in order.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Recorded events with the given reason.
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.reason == reason)
            .collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEventRecorder {
    async fn record(&self, function: &Function, type_: EventType, reason: &str, message: String) {
        let key = ReconcileKey::for_function(function)
            .unwrap_or_else(|_| ReconcileKey::new("", ""));
        self.events.lock().unwrap().push(RecordedEvent {
            key,
            type_,
            reason: reason.to_string(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionSpec;
    use crate::resources;

    fn echo() -> Function {
        Function::new_in(
            "useless",
            "echo",
            FunctionSpec {
                func_name: "echo".to_string(),
                image: "reg/echo:latest".to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_recording_client_records_and_fails_on_demand() {
        let client = RecordingClient::new();
        let desired = resources::build(&echo());

        client.fail_next(ApiError::Transient("connection reset".to_string()));
        let err = client.create(&desired.get(DependentKind::Workload)).await.unwrap_err();
        assert!(matches!(err, ApiError::Transient(_)));
        assert_eq!(client.create_count(), 0);

        client.create(&desired.get(DependentKind::Workload)).await.unwrap();
        assert_eq!(client.created_kinds(), vec![DependentKind::Workload]);
    }

    #[tokio::test]
    async fn test_recording_client_mirrors_into_cache() {
        let cache = MemoryCache::new();
        let client = RecordingClient::new().with_cache(cache.clone());
        let desired = resources::build(&echo());

        client.create(&desired.get(DependentKind::Endpoint)).await.unwrap();
        assert!(cache.get_dependent(DependentKind::Endpoint, "useless", "echo").is_some());

        let err = client.create(&desired.get(DependentKind::Endpoint)).await.unwrap_err();
        assert_eq!(err, ApiError::AlreadyExists("echo".to_string()));
    }

    #[tokio::test]
    async fn test_recording_event_recorder() {
        let recorder = RecordingEventRecorder::new();
        recorder
            .record(&echo(), EventType::Normal, reasons::SYNCED, messages::SYNCED.to_string())
            .await;

        let events = recorder.with_reason(reasons::SYNCED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, ReconcileKey::new("useless", "echo"));
        assert_eq!(events[0].message, "Function synced successfully");
    }

    #[test]
    fn test_resource_exists_message() {
        assert_eq!(
            messages::resource_exists("foo"),
            "Resource \"foo\" already exists and is not managed by Function"
        );
    }
}
