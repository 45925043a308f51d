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

//! [`ClusterClient`] backed by the Kubernetes API.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::FIELD_MANAGER;
use crate::client::{ApiError, ClusterClient};
use crate::resources::DependentResource;

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ApiError::NotFound(resp.message),
            kube::Error::Api(resp) if resp.code == 409 => ApiError::AlreadyExists(resp.message),
            kube::Error::Api(resp) if resp.code == 422 => ApiError::Invalid(resp.message),
            other => ApiError::Transient(other.to_string()),
        }
    }
}

/// Creates dependents through the apiserver.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wraps `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn create_in<K>(&self, namespace: &str, object: &K) -> Result<(), ApiError>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, object).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create(&self, resource: &DependentResource) -> Result<(), ApiError> {
        let namespace = resource.meta().namespace.as_str();
        match resource {
            DependentResource::Workload(spec) => {
                self.create_in::<Deployment>(namespace, &spec.to_deployment())
                    .await
            }
            DependentResource::Endpoint(spec) => {
                self.create_in::<Service>(namespace, &spec.to_service()).await
            }
            DependentResource::Autoscaler(spec) => {
                self.create_in::<HorizontalPodAutoscaler>(
                    namespace,
                    &spec.to_horizontal_pod_autoscaler(),
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("code {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_status_codes_map_to_api_errors() {
        assert_eq!(
            ApiError::from(api_error(404)),
            ApiError::NotFound("code 404".to_string())
        );
        assert_eq!(
            ApiError::from(api_error(409)),
            ApiError::AlreadyExists("code 409".to_string())
        );
        assert_eq!(
            ApiError::from(api_error(422)),
            ApiError::Invalid("code 422".to_string())
        );
        assert!(matches!(
            ApiError::from(api_error(429)),
            ApiError::Transient(_)
        ));
    }
}
