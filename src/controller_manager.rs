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

//! Controller manager - the main orchestrator.
//!
//! The manager owns the process lifecycle. With leader election enabled it
//! runs a [`LeaderElector`] and starts a fresh pipeline for every term it
//! leads; otherwise it runs one pipeline until shutdown. A pipeline starts
//! the informers, routes their notifications into a new work queue and runs
//! the [`FunctionController`] workers, all under a term-scoped token.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::{ClusterClient, EventRecorder};
use crate::config::FunctionControllerConfig;
use crate::controller::{Controller, ControllerError, FunctionController, Result};
use crate::controller_context::{ControllerContext, InformerFactory};
use crate::event_router::EventRouter;
use crate::health::HealthState;
use crate::leader_election::{LeaderCallbacks, LeaderElectionConfig, LeaderElector, LeaseStore};
use crate::workqueue::{ExponentialBackoff, WorkQueue};

/// The controller manager.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use function_controller::cache::MemoryCache;
/// use function_controller::client::{RecordingClient, RecordingEventRecorder};
/// use function_controller::config::FunctionControllerConfig;
/// use function_controller::controller_context::MemoryInformerFactory;
/// use function_controller::controller_manager::ControllerManager;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut config = FunctionControllerConfig::default();
/// config.leader_election.leader_elect = false;
///
/// let manager = ControllerManager::new(
///     config,
///     "replica-0",
///     Arc::new(MemoryInformerFactory::new(MemoryCache::new())),
///     Arc::new(RecordingClient::new()),
///     Arc::new(RecordingEventRecorder::new()),
/// );
/// manager.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct ControllerManager {
    /// Configuration for this instance.
    config: Arc<FunctionControllerConfig>,

    /// Identity of this replica.
    identity: String,

    /// Pipeline run while this replica is active.
    pipeline: Arc<Pipeline>,

    /// Lease backend; required when leader election is enabled.
    lease_store: Option<Arc<dyn LeaseStore>>,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,
}

impl ControllerManager {
    /// Creates a new controller manager.
    pub fn new(
        config: FunctionControllerConfig,
        identity: impl Into<String>,
        informers: Arc<dyn InformerFactory>,
        client: Arc<dyn ClusterClient>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let config = Arc::new(config);
        let identity = identity.into();
        let health = HealthState::new(identity.clone(), config.leader_election.leader_elect);

        Self {
            pipeline: Arc::new(Pipeline {
                config: Arc::clone(&config),
                identity: identity.clone(),
                informers,
                client,
                recorder,
                health,
            }),
            config,
            identity,
            lease_store: None,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Sets the lease backend used for leader election.
    pub fn with_lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Shared state served by the health endpoints.
    pub fn health(&self) -> HealthState {
        self.pipeline.health.clone()
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        info!("initiating graceful shutdown");
        self.shutdown_token.cancel();
    }

    /// Runs the controller manager until shutdown or a fatal error.
    pub async fn run(&self) -> Result<()> {
        info!(identity = %self.identity, "starting function controller");

        self.config
            .validate()
            .map_err(|e| ControllerError::InvalidConfig {
                name: "function-controller".to_string(),
                reason: e.to_string(),
            })?;

        if !self.config.leader_election.leader_elect {
            info!("leader election disabled, running as the only replica");
            return self
                .pipeline
                .run_term(self.shutdown_token.child_token())
                .await;
        }

        let Some(store) = self.lease_store.clone() else {
            return Err(ControllerError::InvalidConfig {
                name: "leader-election".to_string(),
                reason: "leader election is enabled but no lease store was configured"
                    .to_string(),
            });
        };

        let settings = &self.config.leader_election;
        let elector = Arc::new(LeaderElector::new(
            LeaderElectionConfig::new(
                settings.resource_namespace.clone(),
                settings.resource_name.clone(),
                self.identity.clone(),
            )
            .with_lease_duration(settings.lease_duration)
            .with_renew_deadline(settings.renew_deadline)
            .with_retry_period(settings.retry_period)
            .with_release_on_cancel(settings.release_on_cancel),
            store,
        ));

        let mut states = elector.subscribe();
        let health = self.pipeline.health.clone();
        let forward = tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                health.set_leader_state(state);
                if states.changed().await.is_err() {
                    break;
                }
            }
        });

        let callbacks: Arc<dyn LeaderCallbacks> = self.pipeline.clone();
        let result = elector
            .run(callbacks, self.shutdown_token.clone())
            .await
            .map_err(|e| ControllerError::Runtime {
                name: "leader-election".to_string(),
                source: e.into(),
            });

        drop(elector);
        forward.abort();
        result
    }
}

/// Everything one leadership term needs.
struct Pipeline {
    config: Arc<FunctionControllerConfig>,
    identity: String,
    informers: Arc<dyn InformerFactory>,
    client: Arc<dyn ClusterClient>,
    recorder: Arc<dyn EventRecorder>,
    health: HealthState,
}

impl Pipeline {
    async fn run_term(&self, cancel: CancellationToken) -> Result<()> {
        let informers = self.informers.start(cancel.clone());

        let queue = WorkQueue::with_backoff(ExponentialBackoff::new(
            self.config.workqueue.base_delay,
            self.config.workqueue.max_delay,
        ));
        self.health.attach(informers.cache.clone(), queue.clone());

        let ctx = ControllerContext::new(
            informers.cache.clone(),
            self.client.clone(),
            self.recorder.clone(),
            self.config.clone(),
        );
        let controller = FunctionController::new(queue.clone()).with_workers(ctx.workers());

        let router = Arc::new(EventRouter::new(queue, informers.cache));
        let router_cancel = cancel.child_token();
        let router_task = tokio::spawn(router.run(informers.notifications, router_cancel.clone()));

        let result = controller.run(ctx, cancel).await;

        router_cancel.cancel();
        if let Err(e) = router_task.await {
            error!(error = %e, "event router task failed");
        }
        self.health.detach();

        match &result {
            Ok(()) => info!("controller terminated successfully"),
            Err(e) => error!(error = %e, "controller terminated with error"),
        }
        result
    }
}

#[async_trait]
impl LeaderCallbacks for Pipeline {
    async fn on_started_leading(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.run_term(cancel).await?;
        Ok(())
    }

    async fn on_stopped_leading(&self) {
        info!("leadership term ended, pipeline stopped");
    }

    fn on_new_leader(&self, identity: &str) {
        self.health.set_leader(identity);
        if identity == self.identity {
            return;
        }
        info!(leader = %identity, "new leader elected");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::{MemoryCache, ObjectCache};
    use crate::client::{reasons, RecordingClient, RecordingEventRecorder};
    use crate::controller_context::MemoryInformerFactory;
    use crate::event_router::{Notification, ObjectKind};
    use crate::function::{Function, FunctionSpec, ReconcileKey};
    use crate::leader_election::{LeaderState, MemoryLeaseStore};

    fn echo() -> Function {
        Function::new_in(
            "default",
            "echo",
            FunctionSpec {
                func_name: "echo".to_string(),
                func_content: String::new(),
                image: "reg/echo:latest".to_string(),
                replicas: Some(2),
            },
        )
    }

    #[test]
    fn test_health_starts_standby() {
        let manager = ControllerManager::new(
            FunctionControllerConfig::default(),
            "a",
            Arc::new(MemoryInformerFactory::new(MemoryCache::new())),
            Arc::new(RecordingClient::new()),
            Arc::new(RecordingEventRecorder::new()),
        );
        let status = manager.health().status();
        assert_eq!(status.identity, "a");
        assert_eq!(status.leader_state, LeaderState::Standby.as_str());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_new_leader_logged_only_for_other_replicas() {
        let manager = ControllerManager::new(
            FunctionControllerConfig::default(),
            "a",
            Arc::new(MemoryInformerFactory::new(MemoryCache::new())),
            Arc::new(RecordingClient::new()),
            Arc::new(RecordingEventRecorder::new()),
        );
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            manager.pipeline.on_new_leader("a");
        });
        assert!(logs.0.lock().unwrap().is_empty());
        assert_eq!(manager.health().status().leader.as_deref(), Some("a"));

        tracing::subscriber::with_default(
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_writer({
                    let logs = logs.clone();
                    move || logs.clone()
                })
                .finish(),
            || manager.pipeline.on_new_leader("b"),
        );
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("new leader elected"));
        assert_eq!(manager.health().status().leader.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_missing_lease_store_is_rejected() {
        let manager = ControllerManager::new(
            FunctionControllerConfig::default(),
            "a",
            Arc::new(MemoryInformerFactory::new(MemoryCache::new())),
            Arc::new(RecordingClient::new()),
            Arc::new(RecordingEventRecorder::new()),
        );
        assert!(matches!(
            manager.run().await,
            Err(ControllerError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = FunctionControllerConfig::default();
        config.generic.workers = 0;
        let manager = ControllerManager::new(
            config,
            "a",
            Arc::new(MemoryInformerFactory::new(MemoryCache::new())),
            Arc::new(RecordingClient::new()),
            Arc::new(RecordingEventRecorder::new()),
        );
        assert!(matches!(
            manager.run().await,
            Err(ControllerError::InvalidConfig { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_reconciles_notifications() {
        let cache = MemoryCache::new();
        let factory = Arc::new(MemoryInformerFactory::new(cache.clone()));
        let client = Arc::new(RecordingClient::new().with_cache(cache.clone()));
        let recorder = Arc::new(RecordingEventRecorder::new());

        let manager = Arc::new(
            ControllerManager::new(
                FunctionControllerConfig::default(),
                "a",
                factory.clone(),
                client.clone(),
                recorder.clone(),
            )
            .with_lease_store(Arc::new(MemoryLeaseStore::new())),
        );
        let handle = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.run().await }
        });

        cache.upsert_function(echo());
        let function = cache
            .get_function(&ReconcileKey::new("default", "echo"))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while !factory.notify(Notification::applied(ObjectKind::Function, &function.metadata)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while recorder.with_reason(reasons::SYNCED).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(client.create_count(), 3);
        assert_eq!(
            manager.health().status().leader_state,
            LeaderState::Leading.as_str()
        );

        manager.shutdown();
        handle.await.unwrap().unwrap();
    }
}
