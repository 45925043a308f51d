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

//! Core controller traits and the `Function` controller.
//!
//! The controller waits for the watch cache to sync, then runs a fixed pool
//! of workers that pull keys from the shared [`WorkQueue`] and reconcile them.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// Re-export cancellation token for use in controller interface
pub use tokio_util::sync::CancellationToken;

use crate::controller_context::ControllerContext;
use crate::function::ReconcileKey;
use crate::reconciler::{ReconcileError, Reconciler, RetryPolicy};
use crate::workqueue::WorkQueue;

/// Name the function controller reports in logs and events.
pub const CONTROLLER_NAME: &str = "useless-controller";

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The controller stopped on an unrecoverable error.
    #[error("controller {name} runtime error: {source}")]
    Runtime {
        /// Controller name.
        name: String,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The watch caches never reported a completed initial list.
    #[error("controller {0} timed out waiting for caches to sync")]
    CacheSync(String),

    /// The configuration was rejected before anything started.
    #[error("invalid configuration for controller {name}: {reason}")]
    InvalidConfig {
        /// Controller name.
        name: String,
        /// Why the configuration was rejected.
        reason: String,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// The base trait that all controllers must implement.
///
/// A controller watches the shared state of the cluster through the apiserver
/// and makes changes attempting to move the current state towards the desired state.
///
/// [`Controller::run`] blocks until the token is cancelled or a fatal error
/// occurs. On cancellation it returns `Ok(())` once its workers stopped.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller.
    fn name(&self) -> &str;

    /// Runs the controller's main loop.
    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()>;

    /// Returns the number of worker tasks this controller uses.
    fn worker_count(&self) -> usize {
        1
    }
}

/// Reconciles `Function` objects pulled from a work queue.
#[derive(Clone)]
pub struct FunctionController {
    queue: WorkQueue<ReconcileKey>,
    workers: usize,
}

impl FunctionController {
    /// Creates a controller draining `queue`.
    pub fn new(queue: WorkQueue<ReconcileKey>) -> Self {
        Self { queue, workers: 1 }
    }

    /// Sets the number of concurrent workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

#[async_trait]
impl Controller for FunctionController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        info!(controller = CONTROLLER_NAME, "waiting for caches to sync");
        let synced = tokio::select! {
            _ = cancel.cancelled() => {
                self.queue.shut_down();
                return Ok(());
            }
            synced = ctx.cache.wait_for_sync() => synced,
        };
        if !synced {
            self.queue.shut_down();
            return Err(ControllerError::CacheSync(CONTROLLER_NAME.to_string()));
        }

        info!(
            controller = CONTROLLER_NAME,
            workers = self.workers,
            "starting workers"
        );
        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            let worker = Worker {
                id,
                queue: self.queue.clone(),
                reconciler: Reconciler::new(ctx.clone()),
                cancel: cancel.clone(),
            };
            workers.spawn(worker.run());
        }

        cancel.cancelled().await;
        info!(controller = CONTROLLER_NAME, "shutting down workers");
        self.queue.shut_down();

        let shutdown_timeout = ctx.config.generic.shutdown_timeout;
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "worker task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout = ?shutdown_timeout,
                remaining = workers.len(),
                "workers did not stop in time, aborting"
            );
            workers.abort_all();
        }

        info!(controller = CONTROLLER_NAME, "workers stopped");
        Ok(())
    }

    fn worker_count(&self) -> usize {
        self.workers
    }
}

struct Worker {
    id: usize,
    queue: WorkQueue<ReconcileKey>,
    reconciler: Reconciler,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");
        while self.process_next_work_item().await {}
        debug!(worker = self.id, "worker stopped");
    }

    /// Handles one key. Returns false once the worker should exit.
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        if self.cancel.is_cancelled() {
            self.queue.forget(&key);
            self.queue.done(&key);
            return false;
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReconcileError::Aborted),
            outcome = AssertUnwindSafe(self.reconciler.reconcile(&key)).catch_unwind() => {
                outcome.unwrap_or_else(|panic| Err(ReconcileError::Panicked(panic_message(&*panic))))
            }
        };

        self.handle_result(&key, result);
        self.queue.done(&key);
        true
    }

    fn handle_result(&self, key: &ReconcileKey, result: std::result::Result<(), ReconcileError>) {
        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                debug!(worker = self.id, %key, "successfully synced");
                return;
            }
            Err(err) => err,
        };

        if matches!(err, ReconcileError::Aborted) || self.cancel.is_cancelled() {
            debug!(worker = self.id, %key, "reconciliation abandoned on shutdown");
            self.queue.forget(key);
            return;
        }

        match err.policy() {
            RetryPolicy::Requeue => {
                warn!(
                    worker = self.id,
                    %key,
                    error = %err,
                    retries = self.queue.num_requeues(key),
                    "error syncing function, requeueing"
                );
                self.queue.add_rate_limited(key.clone());
            }
            RetryPolicy::Drop => {
                warn!(worker = self.id, %key, error = %err, "dropping function from queue");
                self.queue.forget(key);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
