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

//! Translation of watch notifications into reconcile keys.
//!
//! A `Function` notification enqueues its own key. A dependent notification
//! enqueues the key of the `Function` that controls it, or nothing if the
//! object is not managed by this controller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ObjectCache;
use crate::function::{OwnerLink, ReconcileKey};
use crate::resources::DependentKind;
use crate::workqueue::WorkQueue;

/// Kind of object a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A `Function`.
    Function,
    /// An object a `Function` may own.
    Dependent(DependentKind),
}

/// A change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Kind of the changed object.
    pub kind: ObjectKind,
    /// Namespace of the changed object.
    pub namespace: String,
    /// Name of the changed object.
    pub name: String,
    /// Version marker of the object after the change.
    pub resource_version: Option<String>,
    /// Controller owner of the object.
    pub controller: Option<OwnerLink>,
    /// Whether the object was deleted.
    pub deleted: bool,
}

impl Notification {
    /// Notification for an added or updated object.
    pub fn applied(kind: ObjectKind, meta: &ObjectMeta) -> Self {
        Self {
            kind,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            resource_version: meta.resource_version.clone(),
            controller: OwnerLink::controller_of(meta),
            deleted: false,
        }
    }

    /// Notification for a deleted object.
    pub fn deleted(kind: ObjectKind, meta: &ObjectMeta) -> Self {
        Self {
            deleted: true,
            ..Self::applied(kind, meta)
        }
    }
}

type ObjectIndex = (ObjectKind, String, String);

/// Routes notifications to the work queue.
pub struct EventRouter {
    queue: WorkQueue<ReconcileKey>,
    cache: Arc<dyn ObjectCache>,
    last_seen: Mutex<HashMap<ObjectIndex, String>>,
}

impl EventRouter {
    /// Creates a router feeding `queue`, resolving owners through `cache`.
    pub fn new(queue: WorkQueue<ReconcileKey>, cache: Arc<dyn ObjectCache>) -> Self {
        Self {
            queue,
            cache,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the key to reconcile for `notification`, if any.
    pub fn route(&self, notification: &Notification) -> Option<ReconcileKey> {
        if !self.is_new_version(notification) {
            return None;
        }

        match notification.kind {
            ObjectKind::Function => {
                if notification.deleted {
                    // Dependents are removed by the garbage collector.
                    return None;
                }
                let key = ReconcileKey::new(&notification.namespace, &notification.name);
                match key.validate() {
                    Ok(()) => Some(key),
                    Err(e) => {
                        warn!(error = %e, "dropping notification for malformed function");
                        None
                    }
                }
            }
            ObjectKind::Dependent(kind) => self.resolve_owner(kind, notification),
        }
    }

    /// Routes `notification` and enqueues the resulting key.
    pub fn handle(&self, notification: &Notification) {
        if let Some(key) = self.route(notification) {
            debug!(key = %key, "enqueueing function");
            self.queue.add(key);
        }
    }

    /// Turns a stream of notifications into the stream of keys to reconcile.
    pub fn keys<S>(self: Arc<Self>, notifications: S) -> impl Stream<Item = ReconcileKey>
    where
        S: Stream<Item = Notification>,
    {
        notifications.filter_map(move |notification| {
            let key = self.route(&notification);
            async move { key }
        })
    }

    /// Enqueues keys for `notifications` until the stream ends or `cancel` fires.
    pub async fn run<S>(self: Arc<Self>, notifications: S, cancel: CancellationToken)
    where
        S: Stream<Item = Notification> + Send,
    {
        let queue = self.queue.clone();
        let keys = self.keys(notifications);
        futures::pin_mut!(keys);

        info!("event router started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = keys.next() => match next {
                    Some(key) => {
                        debug!(key = %key, "enqueueing function");
                        queue.add(key);
                    }
                    None => {
                        warn!("notification stream ended");
                        break;
                    }
                },
            }
        }
        info!("event router stopped");
    }

    /// Filters repeated notifications carrying an already seen version.
    fn is_new_version(&self, notification: &Notification) -> bool {
        let index = (
            notification.kind,
            notification.namespace.clone(),
            notification.name.clone(),
        );
        let mut last_seen = self.last_seen.lock().unwrap();

        if notification.deleted {
            last_seen.remove(&index);
            return true;
        }

        let Some(version) = &notification.resource_version else {
            return true;
        };
        if last_seen.get(&index) == Some(version) {
            debug!(
                name = %notification.name,
                version = %version,
                "skipping notification with unchanged version"
            );
            return false;
        }
        last_seen.insert(index, version.clone());
        true
    }

    fn resolve_owner(&self, kind: DependentKind, notification: &Notification) -> Option<ReconcileKey> {
        let owner = notification.controller.as_ref()?;
        if !owner.is_function() {
            return None;
        }

        let key = owner.owner_key();
        if self.cache.get_function(&key).is_none() {
            debug!(
                kind = %kind,
                name = %notification.name,
                owner = %key,
                "ignoring orphaned object"
            );
            return None;
        }
        Some(key)
    }
}
