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

//! Mapping from a `Function` to the objects it owns.
//!
//! [`build`] is pure: the same function always yields the same desired
//! resources, so it serves both the reconciler and test oracles.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v1::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::function::{Function, OwnerLink};

/// Replica count used when a function does not set one.
pub const DEFAULT_REPLICAS: i32 = 1;

/// Port the endpoint exposes and the workload listens on.
pub const FUNCTION_PORT: i32 = 80;

/// Autoscaler lower bound.
pub const AUTOSCALER_MIN_REPLICAS: i32 = 1;

/// Autoscaler upper bound.
pub const AUTOSCALER_MAX_REPLICAS: i32 = 10;

/// Autoscaler CPU utilization target, in percent.
pub const AUTOSCALER_TARGET_CPU_PERCENT: i32 = 50;

/// Label carrying the owning `Function`'s object name.
pub const LABEL_CONTROLLER: &str = "controller";

/// Label marking objects managed on behalf of a function.
pub const LABEL_MANAGED: &str = "useless";

/// Label carrying the function name.
pub const LABEL_FUNCTION: &str = "function";

/// Kinds of objects a `Function` owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependentKind {
    /// Network endpoint (`Service`).
    Endpoint,
    /// Workload (`Deployment`).
    Workload,
    /// Autoscaling policy (`HorizontalPodAutoscaler`).
    Autoscaler,
}

impl DependentKind {
    /// Order in which dependents are reconciled.
    pub const RECONCILE_ORDER: [DependentKind; 3] = [
        DependentKind::Endpoint,
        DependentKind::Workload,
        DependentKind::Autoscaler,
    ];

    /// Kubernetes kind backing this dependent.
    pub fn api_kind(&self) -> &'static str {
        match self {
            DependentKind::Endpoint => "Service",
            DependentKind::Workload => "Deployment",
            DependentKind::Autoscaler => "HorizontalPodAutoscaler",
        }
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_kind())
    }
}

/// Metadata shared by every dependent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentMeta {
    /// Object name (the lowercased function name).
    pub name: String,
    /// Namespace of the owning function.
    pub namespace: String,
    /// Labels selecting the function's pods.
    pub labels: BTreeMap<String, String>,
    /// Controller link back to the function.
    pub owner: OwnerLink,
}

impl DependentMeta {
    fn object_meta(&self, labels: bool) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: labels.then(|| self.labels.clone()),
            owner_references: Some(vec![self.owner.to_owner_reference()]),
            ..Default::default()
        }
    }
}

/// Desired workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    /// Common metadata.
    pub meta: DependentMeta,
    /// Image serving the function.
    pub image: String,
    /// Replica count.
    pub replicas: i32,
    /// Port the container listens on.
    pub container_port: i32,
}

impl WorkloadSpec {
    /// Renders the workload as a `Deployment`.
    pub fn to_deployment(&self) -> Deployment {
        let labels = self.meta.labels.clone();
        Deployment {
            metadata: self.meta.object_meta(true),
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: self.meta.name.clone(),
                            image: Some(self.image.clone()),
                            ports: Some(vec![ContainerPort {
                                container_port: self.container_port,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Desired network endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    /// Common metadata.
    pub meta: DependentMeta,
    /// Port exposed by the endpoint.
    pub port: i32,
    /// Port traffic is routed to on the selected pods.
    pub target_port: i32,
    /// Pod labels the endpoint routes to.
    pub selector: BTreeMap<String, String>,
}

impl EndpointSpec {
    /// Renders the endpoint as a ClusterIP `Service`.
    pub fn to_service(&self) -> Service {
        Service {
            metadata: self.meta.object_meta(true),
            spec: Some(ServiceSpec {
                selector: Some(self.selector.clone()),
                ports: Some(vec![ServicePort {
                    name: Some(self.meta.name.clone()),
                    protocol: Some("TCP".to_string()),
                    port: self.port,
                    target_port: Some(IntOrString::Int(self.target_port)),
                    ..Default::default()
                }]),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Object an autoscaler scales.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTarget {
    /// API version of the target.
    pub api_version: String,
    /// Kind of the target.
    pub kind: String,
    /// Name of the target.
    pub name: String,
}

/// Desired autoscaling policy. Executed by the cluster's autoscaler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoscalerSpec {
    /// Common metadata.
    pub meta: DependentMeta,
    /// Workload being scaled.
    pub scale_target: ScaleTarget,
    /// Lower replica bound.
    pub min_replicas: i32,
    /// Upper replica bound.
    pub max_replicas: i32,
    /// CPU utilization target in percent.
    pub target_cpu_utilization: i32,
}

impl AutoscalerSpec {
    /// Renders the policy as an autoscaling/v1 `HorizontalPodAutoscaler`.
    pub fn to_horizontal_pod_autoscaler(&self) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            metadata: self.meta.object_meta(false),
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some(self.scale_target.api_version.clone()),
                    kind: self.scale_target.kind.clone(),
                    name: self.scale_target.name.clone(),
                },
                min_replicas: Some(self.min_replicas),
                max_replicas: self.max_replicas,
                target_cpu_utilization_percentage: Some(self.target_cpu_utilization),
            }),
            ..Default::default()
        }
    }
}

/// One object a `Function` owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependentResource {
    /// A workload.
    Workload(WorkloadSpec),
    /// A network endpoint.
    Endpoint(EndpointSpec),
    /// An autoscaling policy.
    Autoscaler(AutoscalerSpec),
}

impl DependentResource {
    /// Kind of this dependent.
    pub fn kind(&self) -> DependentKind {
        match self {
            DependentResource::Workload(_) => DependentKind::Workload,
            DependentResource::Endpoint(_) => DependentKind::Endpoint,
            DependentResource::Autoscaler(_) => DependentKind::Autoscaler,
        }
    }

    /// Metadata of this dependent.
    pub fn meta(&self) -> &DependentMeta {
        match self {
            DependentResource::Workload(w) => &w.meta,
            DependentResource::Endpoint(e) => &e.meta,
            DependentResource::Autoscaler(a) => &a.meta,
        }
    }
}

/// Everything a `Function` should own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredResources {
    /// The workload.
    pub workload: WorkloadSpec,
    /// The endpoint routing to the workload.
    pub endpoint: EndpointSpec,
    /// The autoscaler targeting the workload.
    pub autoscaler: AutoscalerSpec,
}

impl DesiredResources {
    /// Returns the dependent of the given kind.
    pub fn get(&self, kind: DependentKind) -> DependentResource {
        match kind {
            DependentKind::Workload => DependentResource::Workload(self.workload.clone()),
            DependentKind::Endpoint => DependentResource::Endpoint(self.endpoint.clone()),
            DependentKind::Autoscaler => DependentResource::Autoscaler(self.autoscaler.clone()),
        }
    }
}

/// Builds the desired dependents of `function`.
pub fn build(function: &Function) -> DesiredResources {
    let name = function.dependent_name();
    let namespace = function.namespace().unwrap_or_default();
    let labels = selector_labels(function);
    let meta = DependentMeta {
        name: name.clone(),
        namespace,
        labels: labels.clone(),
        owner: OwnerLink::for_function(function),
    };

    DesiredResources {
        workload: WorkloadSpec {
            meta: meta.clone(),
            image: function.spec.image.clone(),
            replicas: function.spec.replicas.unwrap_or(DEFAULT_REPLICAS),
            container_port: FUNCTION_PORT,
        },
        endpoint: EndpointSpec {
            meta: meta.clone(),
            port: FUNCTION_PORT,
            target_port: FUNCTION_PORT,
            selector: labels,
        },
        autoscaler: AutoscalerSpec {
            meta,
            scale_target: ScaleTarget {
                api_version: "apps/v1".to_string(),
                kind: DependentKind::Workload.api_kind().to_string(),
                name,
            },
            min_replicas: AUTOSCALER_MIN_REPLICAS,
            max_replicas: AUTOSCALER_MAX_REPLICAS,
            target_cpu_utilization: AUTOSCALER_TARGET_CPU_PERCENT,
        },
    }
}

fn selector_labels(function: &Function) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CONTROLLER.to_string(), function.name_any()),
        (LABEL_MANAGED.to_string(), "function".to_string()),
        (LABEL_FUNCTION.to_string(), function.dependent_name()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionSpec;

    fn echo(replicas: Option<i32>) -> Function {
        Function::new_in(
            "useless",
            "echo",
            FunctionSpec {
                func_name: "echo".to_string(),
                func_content: "func echo(ctx, in) (string, error) { return in, nil }".to_string(),
                image: "reg/echo:latest".to_string(),
                replicas,
            },
        )
    }

    #[test]
    fn test_build_is_deterministic() {
        let function = echo(Some(2));
        assert_eq!(build(&function), build(&function));
    }

    #[test]
    fn test_workload_defaults_to_one_replica() {
        let desired = build(&echo(None));
        assert_eq!(desired.workload.replicas, DEFAULT_REPLICAS);
    }

    #[test]
    fn test_workload_spec() {
        let desired = build(&echo(Some(2)));
        assert_eq!(desired.workload.meta.name, "echo");
        assert_eq!(desired.workload.meta.namespace, "useless");
        assert_eq!(desired.workload.image, "reg/echo:latest");
        assert_eq!(desired.workload.replicas, 2);
        assert_eq!(desired.workload.meta.labels.get(LABEL_FUNCTION).unwrap(), "echo");
    }

    #[test]
    fn test_endpoint_routes_to_workload_labels() {
        let desired = build(&echo(Some(2)));
        assert_eq!(desired.endpoint.port, 80);
        assert_eq!(desired.endpoint.selector, desired.workload.meta.labels);
    }

    #[test]
    fn test_autoscaler_targets_workload() {
        let desired = build(&echo(Some(2)));
        let hpa = &desired.autoscaler;
        assert_eq!(hpa.scale_target.name, "echo");
        assert_eq!(hpa.scale_target.kind, "Deployment");
        assert_eq!((hpa.min_replicas, hpa.max_replicas), (1, 10));
        assert_eq!(hpa.target_cpu_utilization, 50);
    }

    #[test]
    fn test_every_dependent_carries_controller_link() {
        let mut function = echo(None);
        function.metadata.uid = Some("uid-1".to_string());
        let desired = build(&function);
        for kind in DependentKind::RECONCILE_ORDER {
            let dependent = desired.get(kind);
            assert_eq!(dependent.kind(), kind);
            assert!(dependent.meta().owner.is_controlled_by(&function));
        }
    }

    #[test]
    fn test_dependent_name_is_case_normalized() {
        let mut function = echo(None);
        function.spec.func_name = "EchoFunc".to_string();
        assert_eq!(build(&function).workload.meta.name, "echofunc");
    }

    #[test]
    fn test_deployment_rendering() {
        let deployment = build(&echo(Some(3))).workload.to_deployment();
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.name, "echo");
        assert_eq!(container.image.as_deref(), Some("reg/echo:latest"));
        let owners = deployment.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "Function");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_service_rendering() {
        let service = build(&echo(None)).endpoint.to_service();
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(80)));
    }

    #[test]
    fn test_hpa_rendering() {
        let hpa = build(&echo(None)).autoscaler.to_horizontal_pod_autoscaler();
        let spec = hpa.spec.unwrap();
        assert_eq!(spec.scale_target_ref.name, "echo");
        assert_eq!(spec.scale_target_ref.api_version.as_deref(), Some("apps/v1"));
        assert_eq!(spec.min_replicas, Some(1));
        assert_eq!(spec.max_replicas, 10);
        assert_eq!(spec.target_cpu_utilization_percentage, Some(50));
    }
}
