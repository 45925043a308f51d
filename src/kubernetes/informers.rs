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

//! Watch caches over the apiserver.
//!
//! One reflector per watched kind keeps a local store current and forwards
//! every change as a [`Notification`]. Stores and watches are created anew
//! for each leadership term and stop with its token.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{DependentObject, ObjectCache};
use crate::controller_context::{InformerFactory, Informers};
use crate::event_router::{Notification, ObjectKind};
use crate::function::{Function, ReconcileKey};
use crate::resources::DependentKind;

/// Number of kinds watched per term.
const WATCHED_KINDS: usize = 4;

/// [`ObjectCache`] over reflector stores.
#[derive(Clone)]
pub struct KubeCache {
    functions: Store<Function>,
    deployments: Store<Deployment>,
    services: Store<Service>,
    autoscalers: Store<HorizontalPodAutoscaler>,
    synced: watch::Receiver<usize>,
}

fn object_ref<K>(namespace: &str, name: &str) -> ObjectRef<K>
where
    K: Resource<DynamicType = ()>,
{
    ObjectRef::new(name).within(namespace)
}

#[async_trait]
impl ObjectCache for KubeCache {
    fn get_function(&self, key: &ReconcileKey) -> Option<Arc<Function>> {
        self.functions
            .get(&object_ref(&key.namespace, &key.name))
    }

    fn get_dependent(
        &self,
        kind: DependentKind,
        namespace: &str,
        name: &str,
    ) -> Option<DependentObject> {
        match kind {
            DependentKind::Workload => self
                .deployments
                .get(&object_ref(namespace, name))
                .map(|object| DependentObject::from_meta(kind, object.meta())),
            DependentKind::Endpoint => self
                .services
                .get(&object_ref(namespace, name))
                .map(|object| DependentObject::from_meta(kind, object.meta())),
            DependentKind::Autoscaler => self
                .autoscalers
                .get(&object_ref(namespace, name))
                .map(|object| DependentObject::from_meta(kind, object.meta())),
        }
    }

    async fn wait_for_sync(&self) -> bool {
        let mut synced = self.synced.clone();
        let ready = synced.wait_for(|count| *count >= WATCHED_KINDS).await.is_ok();
        ready
    }

    fn has_synced(&self) -> bool {
        *self.synced.borrow() >= WATCHED_KINDS
    }
}

/// Starts reflectors for `Function`s and the kinds they own.
#[derive(Clone)]
pub struct KubeInformerFactory {
    client: Client,
    namespace: Option<String>,
}

impl KubeInformerFactory {
    /// Watches `namespace`, or every namespace when `None`.
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn watch<K>(
        &self,
        kind: ObjectKind,
        notifications: mpsc::UnboundedSender<Notification>,
        synced: Arc<watch::Sender<usize>>,
        cancel: CancellationToken,
    ) -> Store<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
    {
        let (reader, writer) = reflector::store();
        let stream = watcher(self.api::<K>(), watcher::Config::default())
            .default_backoff()
            .reflect(writer);

        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            let mut initial_list_done = false;
            debug!(?kind, "watch started");

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(event) => event,
                        None => break,
                    },
                };

                let notification = match event {
                    Ok(watcher::Event::Apply(object)) | Ok(watcher::Event::InitApply(object)) => {
                        Notification::applied(kind, object.meta())
                    }
                    Ok(watcher::Event::Delete(object)) => Notification::deleted(kind, object.meta()),
                    Ok(watcher::Event::Init) => continue,
                    Ok(watcher::Event::InitDone) => {
                        if !initial_list_done {
                            initial_list_done = true;
                            synced.send_modify(|count| *count += 1);
                            info!(?kind, "initial list complete");
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(?kind, error = %e, "watch failed, backing off");
                        continue;
                    }
                };

                if notifications.send(notification).is_err() {
                    break;
                }
            }
            debug!(?kind, "watch stopped");
        });

        reader
    }
}

impl InformerFactory for KubeInformerFactory {
    fn start(&self, cancel: CancellationToken) -> Informers {
        let (tx, rx) = mpsc::unbounded_channel();
        let synced = Arc::new(watch::channel(0usize).0);

        let cache = KubeCache {
            functions: self.watch(ObjectKind::Function, tx.clone(), synced.clone(), cancel.clone()),
            deployments: self.watch(
                ObjectKind::Dependent(DependentKind::Workload),
                tx.clone(),
                synced.clone(),
                cancel.clone(),
            ),
            services: self.watch(
                ObjectKind::Dependent(DependentKind::Endpoint),
                tx.clone(),
                synced.clone(),
                cancel.clone(),
            ),
            autoscalers: self.watch(
                ObjectKind::Dependent(DependentKind::Autoscaler),
                tx,
                synced.clone(),
                cancel.clone(),
            ),
            synced: synced.subscribe(),
        };

        let notifications = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|notification| (notification, rx))
        })
        .take_until(cancel.cancelled_owned())
        .boxed();

        Informers {
            cache: Arc::new(cache),
            notifications,
        }
    }
}
