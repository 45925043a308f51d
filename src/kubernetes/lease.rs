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

//! [`LeaseStore`] backed by a `coordination.k8s.io/v1` Lease.
//!
//! Updates carry the observed `resourceVersion`, so the apiserver rejects a
//! write based on a stale read with 409 Conflict.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;

use super::FIELD_MANAGER;
use crate::leader_election::{LeaseError, LeaseRecord, LeaseStore, VersionedLease};

/// Lease object shared by all replicas.
#[derive(Clone)]
pub struct KubeLeaseStore {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl KubeLeaseStore {
    /// Uses the Lease `name` in `namespace`.
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord, version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(
                    i32::try_from(record.lease_duration.as_secs()).unwrap_or(i32::MAX),
                ),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.lease_transitions),
                ..Default::default()
            }),
        }
    }

    fn params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn from_lease(lease: Lease) -> Result<VersionedLease, LeaseError> {
    let version = lease
        .metadata
        .resource_version
        .ok_or_else(|| LeaseError::Backend("lease has no resourceVersion".to_string()))?;
    let spec = lease.spec.unwrap_or_default();

    Ok(VersionedLease {
        record: LeaseRecord {
            holder_identity: spec.holder_identity.filter(|holder| !holder.is_empty()),
            lease_duration: Duration::from_secs(
                u64::try_from(spec.lease_duration_seconds.unwrap_or(0)).unwrap_or(0),
            ),
            acquire_time: spec.acquire_time.map(|t| t.0),
            renew_time: spec.renew_time.map(|t| t.0),
            lease_transitions: spec.lease_transitions.unwrap_or(0),
        },
        version,
    })
}

fn map_error(err: kube::Error) -> LeaseError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => LeaseError::Conflict,
        other => LeaseError::Backend(other.to_string()),
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<VersionedLease>, LeaseError> {
        match self.api.get_opt(&self.name).await.map_err(map_error)? {
            Some(lease) => from_lease(lease).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<VersionedLease, LeaseError> {
        let lease = self
            .api
            .create(&Self::params(), &self.to_lease(record, None))
            .await
            .map_err(map_error)?;
        from_lease(lease)
    }

    async fn update(
        &self,
        record: &LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError> {
        let lease = self
            .api
            .replace(&self.name, &Self::params(), &self.to_lease(record, Some(version)))
            .await
            .map_err(map_error)?;
        from_lease(lease)
    }
}
