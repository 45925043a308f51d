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

//! Controller context - shared resources for the function controller.

use std::sync::{Arc, Mutex};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{MemoryCache, ObjectCache};
use crate::client::{ClusterClient, EventRecorder};
use crate::config::FunctionControllerConfig;
use crate::event_router::Notification;

/// Shared context for one leadership term of the controller.
///
/// Holds the read side (watch cache), the write side (API client and event
/// recorder) and the configuration.
#[derive(Clone)]
pub struct ControllerContext {
    /// Watch cache for functions and their dependents.
    pub cache: Arc<dyn ObjectCache>,

    /// Client used to create dependents.
    pub client: Arc<dyn ClusterClient>,

    /// Sink for user-visible events.
    pub recorder: Arc<dyn EventRecorder>,

    /// Configuration for this controller instance.
    pub config: Arc<FunctionControllerConfig>,
}

impl ControllerContext {
    /// Creates a new controller context.
    pub fn new(
        cache: Arc<dyn ObjectCache>,
        client: Arc<dyn ClusterClient>,
        recorder: Arc<dyn EventRecorder>,
        config: Arc<FunctionControllerConfig>,
    ) -> Self {
        Self {
            cache,
            client,
            recorder,
            config,
        }
    }

    /// Number of reconcile workers.
    pub fn workers(&self) -> usize {
        self.config.generic.workers
    }
}

/// Running informers: the cache they maintain and the changes they observe.
pub struct Informers {
    /// Cache kept up to date by the informers.
    pub cache: Arc<dyn ObjectCache>,

    /// Changes observed after being applied to `cache`.
    pub notifications: BoxStream<'static, Notification>,
}

/// Starts informers for functions and their dependents.
///
/// Called once per leadership term; everything started must stop when
/// `cancel` fires.
pub trait InformerFactory: Send + Sync + 'static {
    /// Starts the informers.
    fn start(&self, cancel: CancellationToken) -> Informers;
}

/// [`InformerFactory`] over a [`MemoryCache`].
///
/// Notifications are injected with [`MemoryInformerFactory::notify`]. Each
/// call to `start` opens a fresh notification channel; earlier streams end.
#[derive(Clone)]
pub struct MemoryInformerFactory {
    cache: MemoryCache,
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<Notification>>>>,
}

impl MemoryInformerFactory {
    /// Creates a factory serving `cache`.
    pub fn new(cache: MemoryCache) -> Self {
        Self {
            cache,
            sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Delivers `notification` to the current informers.
    ///
    /// Returns false if no informers are running.
    pub fn notify(&self, notification: Notification) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(tx) => tx.send(notification).is_ok(),
            None => false,
        }
    }
}

impl InformerFactory for MemoryInformerFactory {
    fn start(&self, cancel: CancellationToken) -> Informers {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);

        let notifications = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|notification| (notification, rx))
        })
        .take_until(cancel.cancelled_owned())
        .boxed();

        Informers {
            cache: Arc::new(self.cache.clone()),
            notifications,
        }
    }
}
