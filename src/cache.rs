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

//! Read-only view of the watch cache.
//!
//! The reconciler and the event router only ever read cluster state through
//! [`ObjectCache`]; the cache itself is maintained by the informers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tokio::sync::watch;

use crate::function::{Function, OwnerLink, ReconcileKey};
use crate::resources::{DependentKind, DependentResource};

/// The parts of a cached dependent object the controller looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentObject {
    /// Kind of the object.
    pub kind: DependentKind,
    /// Namespace of the object.
    pub namespace: String,
    /// Name of the object.
    pub name: String,
    /// Version marker of the cached copy.
    pub resource_version: Option<String>,
    /// Controller owner, if any.
    pub controller: Option<OwnerLink>,
}

impl DependentObject {
    /// Builds a cached view from object metadata.
    pub fn from_meta(kind: DependentKind, meta: &ObjectMeta) -> Self {
        Self {
            kind,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            resource_version: meta.resource_version.clone(),
            controller: OwnerLink::controller_of(meta),
        }
    }

    /// Returns true if `function` controls this object.
    pub fn is_controlled_by(&self, function: &Function) -> bool {
        self.controller
            .as_ref()
            .is_some_and(|owner| owner.is_controlled_by(function))
    }
}

/// Lookup interface over the watch cache.
#[async_trait]
pub trait ObjectCache: Send + Sync + 'static {
    /// Returns the cached `Function` for `key`.
    fn get_function(&self, key: &ReconcileKey) -> Option<Arc<Function>>;

    /// Returns the cached dependent of `kind` named `name` in `namespace`.
    fn get_dependent(&self, kind: DependentKind, namespace: &str, name: &str)
        -> Option<DependentObject>;

    /// Waits until every watched kind completed its initial list.
    ///
    /// Returns false if the cache can never become ready.
    async fn wait_for_sync(&self) -> bool;

    /// Returns true once every watched kind completed its initial list.
    fn has_synced(&self) -> bool;
}

type DependentIndex = (DependentKind, String, String);

/// In-memory [`ObjectCache`].
///
/// Used in tests and wherever the core runs without a live cluster. Objects
/// receive a fresh resource version on every write.
#[derive(Clone)]
pub struct MemoryCache {
    functions: Arc<RwLock<HashMap<ReconcileKey, Arc<Function>>>>,
    dependents: Arc<RwLock<HashMap<DependentIndex, DependentObject>>>,
    version: Arc<RwLock<u64>>,
    synced: Arc<watch::Sender<bool>>,
}

impl MemoryCache {
    /// Creates an empty, already synced cache.
    pub fn new() -> Self {
        let cache = Self::unsynced();
        cache.mark_synced();
        cache
    }

    /// Creates an empty cache that reports unsynced until [`MemoryCache::mark_synced`].
    pub fn unsynced() -> Self {
        Self {
            functions: Arc::new(RwLock::new(HashMap::new())),
            dependents: Arc::new(RwLock::new(HashMap::new())),
            version: Arc::new(RwLock::new(0)),
            synced: Arc::new(watch::channel(false).0),
        }
    }

    /// Marks the cache as synced, releasing [`ObjectCache::wait_for_sync`] waiters.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    fn next_version(&self) -> String {
        let mut version = self.version.write().unwrap();
        *version += 1;
        version.to_string()
    }

    /// Stores or replaces a `Function`. Returns its key.
    pub fn upsert_function(&self, mut function: Function) -> ReconcileKey {
        function.metadata.resource_version = Some(self.next_version());
        let key = ReconcileKey::new(function.namespace().unwrap_or_default(), function.name_any());
        self.functions
            .write()
            .unwrap()
            .insert(key.clone(), Arc::new(function));
        key
    }

    /// Removes a `Function`.
    pub fn remove_function(&self, key: &ReconcileKey) -> Option<Arc<Function>> {
        self.functions.write().unwrap().remove(key)
    }

    /// Stores or replaces a dependent object.
    pub fn upsert_dependent(&self, mut object: DependentObject) -> DependentObject {
        object.resource_version = Some(self.next_version());
        let index = (object.kind, object.namespace.clone(), object.name.clone());
        self.dependents
            .write()
            .unwrap()
            .insert(index, object.clone());
        object
    }

    /// Stores a dependent exactly as the controller would have created it.
    pub fn insert_created(&self, resource: &DependentResource) -> DependentObject {
        let meta = resource.meta();
        self.upsert_dependent(DependentObject {
            kind: resource.kind(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            resource_version: None,
            controller: Some(meta.owner.clone()),
        })
    }

    /// Removes a dependent object.
    pub fn remove_dependent(
        &self,
        kind: DependentKind,
        namespace: &str,
        name: &str,
    ) -> Option<DependentObject> {
        self.dependents
            .write()
            .unwrap()
            .remove(&(kind, namespace.to_string(), name.to_string()))
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectCache for MemoryCache {
    fn get_function(&self, key: &ReconcileKey) -> Option<Arc<Function>> {
        self.functions.read().unwrap().get(key).cloned()
    }

    fn get_dependent(
        &self,
        kind: DependentKind,
        namespace: &str,
        name: &str,
    ) -> Option<DependentObject> {
        self.dependents
            .read()
            .unwrap()
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    async fn wait_for_sync(&self) -> bool {
        let mut rx = self.synced.subscribe();
        let synced = rx.wait_for(|synced| *synced).await.is_ok();
        synced
    }

    fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionSpec;
    use crate::resources;

    fn function(name: &str) -> Function {
        Function::new_in(
            "useless",
            name,
            FunctionSpec {
                func_name: name.to_string(),
                image: format!("reg/{name}:latest"),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_function_lookup() {
        let cache = MemoryCache::new();
        let key = cache.upsert_function(function("echo"));
        assert_eq!(key, ReconcileKey::new("useless", "echo"));
        assert!(cache.get_function(&key).is_some());
        assert!(cache.get_function(&ReconcileKey::new("other", "echo")).is_none());

        cache.remove_function(&key);
        assert!(cache.get_function(&key).is_none());
    }

    #[test]
    fn test_versions_change_on_write() {
        let cache = MemoryCache::new();
        let key = cache.upsert_function(function("echo"));
        let first = cache.get_function(&key).unwrap().metadata.resource_version.clone();
        cache.upsert_function(function("echo"));
        let second = cache.get_function(&key).unwrap().metadata.resource_version.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn test_insert_created_is_owned() {
        let cache = MemoryCache::new();
        let echo = function("echo");
        let desired = resources::build(&echo);
        let object = cache.insert_created(&desired.get(DependentKind::Workload));

        assert!(object.is_controlled_by(&echo));
        assert!(!object.is_controlled_by(&function("other")));
        assert_eq!(
            cache.get_dependent(DependentKind::Workload, "useless", "echo"),
            Some(object)
        );
        assert!(cache.get_dependent(DependentKind::Endpoint, "useless", "echo").is_none());
    }

    #[test]
    fn test_from_meta_without_owner() {
        let meta = ObjectMeta {
            name: Some("foo".to_string()),
            namespace: Some("useless".to_string()),
            resource_version: Some("7".to_string()),
            ..Default::default()
        };
        let object = DependentObject::from_meta(DependentKind::Endpoint, &meta);
        assert_eq!(object.name, "foo");
        assert!(object.controller.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_sync() {
        let cache = MemoryCache::unsynced();
        assert!(!cache.has_synced());

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_for_sync().await })
        };
        cache.mark_synced();
        assert!(waiter.await.unwrap());
        assert!(cache.has_synced());
    }
}
