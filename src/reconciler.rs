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

//! Reconciliation of a single `Function`.
//!
//! A pass reads the function from the watch cache, derives its dependents and
//! creates whichever of them are missing. Dependents that already exist and
//! are controlled by the function are accepted as they are.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{messages, reasons, ApiError, EventType};
use crate::controller_context::ControllerContext;
use crate::function::{Function, InvalidKey, ReconcileKey};
use crate::resources::{self, DependentKind};

/// What the worker does with a key after a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Put the key back with exponential backoff.
    Requeue,
    /// Reset the backoff and wait for the next external change.
    Drop,
}

/// Errors returned by a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The spec cannot produce valid dependents. Waits for a spec update.
    #[error("invalid function spec: {0}")]
    Validation(String),

    /// A dependent name is taken by an object this function does not control.
    #[error("{kind} {name} already exists and is not managed by this function")]
    OwnershipConflict {
        /// Kind of the conflicting dependent.
        kind: DependentKind,
        /// Name of the conflicting dependent.
        name: String,
    },

    /// The cluster API call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The queued key does not name a function.
    #[error(transparent)]
    MalformedKey(#[from] InvalidKey),

    /// The pass was cancelled before it finished.
    #[error("reconciliation aborted")]
    Aborted,

    /// The pass panicked; carries the panic message.
    #[error("reconciliation panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Returns how the worker should treat the failed key.
    pub fn policy(&self) -> RetryPolicy {
        match self {
            ReconcileError::Validation(_) | ReconcileError::MalformedKey(_) => RetryPolicy::Drop,
            ReconcileError::Api(ApiError::NotFound(_) | ApiError::Invalid(_)) => {
                RetryPolicy::Drop
            }
            ReconcileError::OwnershipConflict { .. }
            | ReconcileError::Api(_)
            | ReconcileError::Aborted
            | ReconcileError::Panicked(_) => RetryPolicy::Requeue,
        }
    }
}

/// Drives one `Function` toward its desired dependents.
#[derive(Clone)]
pub struct Reconciler {
    ctx: ControllerContext,
}

impl Reconciler {
    /// Creates a reconciler over the shared handles in `ctx`.
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// Runs one reconciliation pass for `key`.
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<(), ReconcileError> {
        key.validate()?;

        let Some(function) = self.ctx.cache.get_function(key) else {
            debug!(%key, "function no longer exists");
            return Ok(());
        };

        if let Err(reason) = validate(&function) {
            self.ctx
                .recorder
                .record(
                    &function,
                    EventType::Warning,
                    reasons::INVALID_SPEC,
                    reason.clone(),
                )
                .await;
            return Err(ReconcileError::Validation(reason));
        }

        self.sync_dependents(key, &function).await?;

        self.ctx
            .recorder
            .record(
                &function,
                EventType::Normal,
                reasons::SYNCED,
                messages::SYNCED.to_string(),
            )
            .await;
        Ok(())
    }

    async fn sync_dependents(
        &self,
        key: &ReconcileKey,
        function: &Arc<Function>,
    ) -> Result<(), ReconcileError> {
        let desired = resources::build(function);

        // Every name is checked before anything is created.
        let mut missing = Vec::new();
        for kind in DependentKind::RECONCILE_ORDER {
            let resource = desired.get(kind);
            let meta = resource.meta();

            match self.ctx.cache.get_dependent(kind, &meta.namespace, &meta.name) {
                None => missing.push(kind),
                Some(existing) if existing.is_controlled_by(function) => {
                    debug!(%key, %kind, name = %meta.name, "dependent already owned");
                }
                Some(_) => {
                    warn!(%key, %kind, name = %meta.name, "dependent owned by someone else");
                    self.ctx
                        .recorder
                        .record(
                            function,
                            EventType::Warning,
                            reasons::RESOURCE_EXISTS,
                            messages::resource_exists(&meta.name),
                        )
                        .await;
                    return Err(ReconcileError::OwnershipConflict {
                        kind,
                        name: meta.name.clone(),
                    });
                }
            }
        }

        for kind in missing {
            let resource = desired.get(kind);
            let name = &resource.meta().name;
            match self.ctx.client.create(&resource).await {
                Ok(()) => info!(%key, %kind, %name, "created dependent"),
                Err(ApiError::NotFound(reason)) => {
                    // The namespace went away underneath us.
                    debug!(%key, %kind, %reason, "namespace gone, skipping");
                    return Ok(());
                }
                Err(ApiError::Invalid(reason)) => {
                    self.ctx
                        .recorder
                        .record(
                            function,
                            EventType::Warning,
                            reasons::INVALID_SPEC,
                            reason.clone(),
                        )
                        .await;
                    return Err(ReconcileError::Validation(reason));
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

/// Longest name the apiserver accepts for a Service.
const MAX_NAME_LEN: usize = 63;

fn validate(function: &Function) -> Result<(), String> {
    if function.spec.func_name.trim().is_empty() {
        return Err("funcName must be specified".to_string());
    }
    let name = function.dependent_name();
    if !is_dns1123_label(&name) {
        return Err(format!(
            "funcName {name:?} must be a DNS-1123 label: at most {MAX_NAME_LEN} lowercase \
             alphanumerics or '-', starting and ending with an alphanumeric"
        ));
    }
    if function.spec.replicas.is_some_and(|r| r < 0) {
        return Err("replicas must not be negative".to_string());
    }
    Ok(())
}

fn is_dns1123_label(name: &str) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| alnum(c) || c == '-')
        && name.starts_with(alnum)
        && name.ends_with(alnum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DependentObject, MemoryCache};
    use crate::client::{RecordingClient, RecordingEventRecorder};
    use crate::config::FunctionControllerConfig;
    use crate::function::{FunctionSpec, OwnerLink};

    fn spec(func_name: &str) -> FunctionSpec {
        FunctionSpec {
            func_name: func_name.to_string(),
            func_content: String::new(),
            image: "reg/echo:latest".to_string(),
            replicas: Some(2),
        }
    }

    struct Fixture {
        cache: MemoryCache,
        client: Arc<RecordingClient>,
        recorder: Arc<RecordingEventRecorder>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let cache = MemoryCache::new();
        let client = Arc::new(RecordingClient::new().with_cache(cache.clone()));
        let recorder = Arc::new(RecordingEventRecorder::new());
        let ctx = ControllerContext::new(
            Arc::new(cache.clone()),
            client.clone(),
            recorder.clone(),
            Arc::new(FunctionControllerConfig::default()),
        );
        Fixture {
            cache,
            client,
            recorder,
            reconciler: Reconciler::new(ctx),
        }
    }

    #[tokio::test]
    async fn test_missing_function_is_noop() {
        let f = fixture();
        let key = ReconcileKey::new("default", "gone");
        assert!(f.reconciler.reconcile(&key).await.is_ok());
        assert_eq!(f.client.create_count(), 0);
        assert!(f.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_creates_dependents_in_order() {
        let f = fixture();
        let key = f
            .cache
            .upsert_function(Function::new_in("default", "echo", spec("Echo")));

        f.reconciler.reconcile(&key).await.unwrap();

        assert_eq!(
            f.client.created_kinds(),
            DependentKind::RECONCILE_ORDER.to_vec()
        );
        assert!(f
            .client
            .created()
            .iter()
            .all(|r| r.meta().name == "echo"));
        assert_eq!(f.recorder.with_reason(reasons::SYNCED).len(), 1);
    }

    #[tokio::test]
    async fn test_second_pass_creates_nothing() {
        let f = fixture();
        let key = f
            .cache
            .upsert_function(Function::new_in("default", "echo", spec("echo")));

        f.reconciler.reconcile(&key).await.unwrap();
        f.reconciler.reconcile(&key).await.unwrap();

        assert_eq!(f.client.create_count(), 3);
        assert_eq!(f.recorder.with_reason(reasons::SYNCED).len(), 2);
    }

    #[tokio::test]
    async fn test_empty_func_name_is_absorbed() {
        let f = fixture();
        let key = f
            .cache
            .upsert_function(Function::new_in("default", "broken", spec("  ")));

        let err = f.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
        assert_eq!(err.policy(), RetryPolicy::Drop);
        assert_eq!(f.client.create_count(), 0);
        assert_eq!(f.recorder.with_reason(reasons::INVALID_SPEC).len(), 1);
    }

    #[tokio::test]
    async fn test_negative_replicas_is_absorbed() {
        let f = fixture();
        let mut spec = spec("echo");
        spec.replicas = Some(-1);
        let key = f
            .cache
            .upsert_function(Function::new_in("default", "echo", spec));

        let err = f.reconciler.reconcile(&key).await.unwrap_err();
        assert_eq!(err.policy(), RetryPolicy::Drop);
        assert_eq!(f.client.create_count(), 0);
    }

    #[tokio::test]
    async fn test_unowned_dependent_blocks_the_pass() {
        let f = fixture();
        f.cache.upsert_dependent(DependentObject {
            kind: DependentKind::Endpoint,
            namespace: "default".to_string(),
            name: "foo".to_string(),
            resource_version: None,
            controller: None,
        });
        let key = f
            .cache
            .upsert_function(Function::new_in("default", "foo", spec("foo")));

        let err = f.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::OwnershipConflict {
                kind: DependentKind::Endpoint,
                ..
            }
        ));
        assert_eq!(err.policy(), RetryPolicy::Requeue);
        assert_eq!(f.client.create_count(), 0);
        assert_eq!(f.recorder.with_reason(reasons::RESOURCE_EXISTS).len(), 1);
        assert!(f.recorder.with_reason(reasons::SYNCED).is_empty());
    }

    #[tokio::test]
    async fn test_dependent_owned_by_other_function_conflicts() {
        let f = fixture();
        let other = Function::new_in("default", "other", spec("shared"));
        f.cache.upsert_dependent(DependentObject {
            kind: DependentKind::Workload,
            namespace: "default".to_string(),
            name: "shared".to_string(),
            resource_version: None,
            controller: Some(OwnerLink::for_function(&other)),
        });
        let key = f
            .cache
            .upsert_function(Function::new_in("default", "mine", spec("shared")));

        let err = f.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::OwnershipConflict {
                kind: DependentKind::Workload,
                ..
            }
        ));
        assert_eq!(f.client.create_count(), 0);
        assert!(f.recorder.with_reason(reasons::SYNCED).is_empty());
    }

    #[tokio::test]
    async fn test_unowned_autoscaler_blocks_every_create() {
        let f = fixture();
        f.cache.upsert_dependent(DependentObject {
            kind: DependentKind::Autoscaler,
            namespace: "default".to_string(),
            name: "foo".to_string(),
            resource_version: None,
            controller: None,
        });
        let key = f
            .cache
            .upsert_function(Function::new_in("default", "foo", spec("foo")));

        let err = f.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::OwnershipConflict {
                kind: DependentKind::Autoscaler,
                ..
            }
        ));
        assert_eq!(f.client.create_count(), 0);
    }

    #[tokio::test]
    async fn test_func_name_must_be_a_dns_label() {
        let too_long = "a".repeat(64);
        for func_name in [" echo", "my_func", "-echo", "echo-", too_long.as_str()] {
            let f = fixture();
            let key = f
                .cache
                .upsert_function(Function::new_in("default", "bad", spec(func_name)));

            let err = f.reconciler.reconcile(&key).await.unwrap_err();
            assert!(matches!(err, ReconcileError::Validation(_)), "{func_name:?}");
            assert_eq!(err.policy(), RetryPolicy::Drop);
            assert_eq!(f.client.create_count(), 0);
            assert_eq!(f.recorder.with_reason(reasons::INVALID_SPEC).len(), 1);
        }
    }

    #[test]
    fn test_dns1123_labels() {
        assert!(is_dns1123_label("echo"));
        assert!(is_dns1123_label("echo-2"));
        assert!(is_dns1123_label("0"));
        assert!(!is_dns1123_label("Echo"));
        assert!(!is_dns1123_label("echo.v1"));
        assert!(!is_dns1123_label(""));
    }

    #[tokio::test]
    async fn test_rejected_create_is_absorbed() {
        let f = fixture();
        let key = f
            .cache
            .upsert_function(Function::new_in("default", "echo", spec("echo")));
        f.client
            .fail_next(ApiError::Invalid("spec.ports: Invalid value".to_string()));

        let err = f.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
        assert_eq!(err.policy(), RetryPolicy::Drop);
        assert_eq!(f.recorder.with_reason(reasons::INVALID_SPEC).len(), 1);
        assert!(f.recorder.with_reason(reasons::SYNCED).is_empty());
    }

    #[tokio::test]
    async fn test_transient_error_is_retryable() {
        let f = fixture();
        let key = f
            .cache
            .upsert_function(Function::new_in("default", "echo", spec("echo")));
        f.client
            .fail_next(ApiError::Transient("connection reset".to_string()));

        let err = f.reconciler.reconcile(&key).await.unwrap_err();
        assert_eq!(err.policy(), RetryPolicy::Requeue);

        f.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(f.client.create_count(), 3);
    }

    #[tokio::test]
    async fn test_malformed_key_is_dropped() {
        let f = fixture();
        let err = f
            .reconciler
            .reconcile(&ReconcileKey::new("default", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedKey(_)));
        assert_eq!(err.policy(), RetryPolicy::Drop);
    }
}
