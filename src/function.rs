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

//! The `Function` custom resource and the identifiers derived from it.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{CustomResource, CustomResourceExt, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API group of the `Function` resource.
pub const GROUP: &str = "useless.io";

/// API version of the `Function` resource.
pub const VERSION: &str = "v1";

/// Kind of the `Function` resource.
pub const KIND: &str = "Function";

/// Desired state of a user function.
///
/// `replicas` may be omitted, in which case one replica is deployed.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "useless.io",
    version = "v1",
    kind = "Function",
    namespaced,
    shortname = "fn"
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Name of the function; dependents are named after it.
    pub func_name: String,

    /// Source text of the function body.
    #[serde(default)]
    pub func_content: String,

    /// Container image that serves the function.
    pub image: String,

    /// Desired replica count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl Function {
    /// Creates a `Function` in the given namespace.
    pub fn new_in(namespace: &str, name: &str, spec: FunctionSpec) -> Self {
        let mut function = Function::new(name, spec);
        function.metadata.namespace = Some(namespace.to_string());
        function
    }

    /// Returns the name shared by every dependent of this function.
    pub fn dependent_name(&self) -> String {
        self.spec.func_name.to_lowercase()
    }
}

/// Renders the CustomResourceDefinition as YAML.
pub fn crd_yaml() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&Function::crd())
}

/// Error returned for keys that do not name a `Function`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid resource key: {0:?}")]
pub struct InvalidKey(pub String);

/// Identifies a `Function` to reconcile.
///
/// A key carries no payload: the reconciler always re-reads the object from
/// the cache, so several notifications for the same object collapse into a
/// single pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    /// Namespace of the function.
    pub namespace: String,
    /// Name of the function.
    pub name: String,
}

impl ReconcileKey {
    /// Creates a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derives the key of a `Function` object.
    pub fn for_function(function: &Function) -> Result<Self, InvalidKey> {
        match function.metadata.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(Self::new(
                function.metadata.namespace.clone().unwrap_or_default(),
                name,
            )),
            _ => Err(InvalidKey(String::new())),
        }
    }

    /// Checks the key still has the shape produced by [`ReconcileKey::for_function`].
    pub fn validate(&self) -> Result<(), InvalidKey> {
        if self.name.is_empty() || self.name.contains('/') || self.namespace.contains('/') {
            return Err(InvalidKey(self.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ReconcileKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let key = match parts.as_slice() {
            [name] => Self::new("", *name),
            [namespace, name] => Self::new(*namespace, *name),
            _ => return Err(InvalidKey(s.to_string())),
        };
        key.validate().map_err(|_| InvalidKey(s.to_string()))?;
        Ok(key)
    }
}

/// Back-reference from a dependent object to the object controlling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerLink {
    /// API version of the owner.
    pub api_version: String,
    /// Kind of the owner.
    pub kind: String,
    /// Name of the owner.
    pub name: String,
    /// Namespace of the owner (always the dependent's namespace).
    pub namespace: String,
    /// UID of the owner, when known.
    pub uid: Option<String>,
    /// Whether the owner is the managing controller.
    pub controller: bool,
}

impl OwnerLink {
    /// Builds the controller link a dependent of `function` carries.
    pub fn for_function(function: &Function) -> Self {
        Self {
            api_version: format!("{GROUP}/{VERSION}"),
            kind: KIND.to_string(),
            name: function.name_any(),
            namespace: function.namespace().unwrap_or_default(),
            uid: function.metadata.uid.clone(),
            controller: true,
        }
    }

    /// Extracts the controller owner from an object's metadata.
    pub fn controller_of(meta: &ObjectMeta) -> Option<Self> {
        let owner = meta
            .owner_references
            .as_ref()?
            .iter()
            .find(|owner| owner.controller == Some(true))?;

        Some(Self {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            uid: Some(owner.uid.clone()).filter(|uid| !uid.is_empty()),
            controller: true,
        })
    }

    /// Returns true if this link names a `Function`.
    pub fn is_function(&self) -> bool {
        self.controller && self.kind == KIND
    }

    /// Returns true if this link points at `function` as controller.
    pub fn is_controlled_by(&self, function: &Function) -> bool {
        if !self.is_function()
            || self.name != function.name_any()
            || self.namespace != function.namespace().unwrap_or_default()
        {
            return false;
        }
        match (&self.uid, &function.metadata.uid) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    /// Key of the owning function.
    pub fn owner_key(&self) -> ReconcileKey {
        ReconcileKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Converts the link into an API owner reference.
    pub fn to_owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone().unwrap_or_default(),
            controller: Some(self.controller),
            block_owner_deletion: Some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Function {
        let mut function = Function::new_in(
            "useless",
            "echo",
            FunctionSpec {
                func_name: "Echo".to_string(),
                image: "reg/echo:latest".to_string(),
                ..Default::default()
            },
        );
        function.metadata.uid = Some("uid-1".to_string());
        function
    }

    #[test]
    fn test_key_display_and_parse() {
        let key = ReconcileKey::new("useless", "echo");
        assert_eq!(key.to_string(), "useless/echo");
        assert_eq!("useless/echo".parse::<ReconcileKey>().unwrap(), key);
        assert_eq!("echo".parse::<ReconcileKey>().unwrap(), ReconcileKey::new("", "echo"));
    }

    #[test]
    fn test_malformed_keys_rejected() {
        assert!("a/b/c".parse::<ReconcileKey>().is_err());
        assert!("useless/".parse::<ReconcileKey>().is_err());
        assert!(ReconcileKey::new("ns", "").validate().is_err());
    }

    #[test]
    fn test_key_for_function() {
        let key = ReconcileKey::for_function(&echo()).unwrap();
        assert_eq!(key, ReconcileKey::new("useless", "echo"));

        let unnamed = Function {
            metadata: ObjectMeta::default(),
            spec: FunctionSpec::default(),
        };
        assert!(ReconcileKey::for_function(&unnamed).is_err());
    }

    #[test]
    fn test_dependent_name_is_lowercase() {
        assert_eq!(echo().dependent_name(), "echo");
    }

    #[test]
    fn test_owner_link_round_trip_through_metadata() {
        let function = echo();
        let link = OwnerLink::for_function(&function);
        let meta = ObjectMeta {
            name: Some("echo".to_string()),
            namespace: Some("useless".to_string()),
            owner_references: Some(vec![link.to_owner_reference()]),
            ..Default::default()
        };

        let parsed = OwnerLink::controller_of(&meta).unwrap();
        assert_eq!(parsed, link);
        assert!(parsed.is_controlled_by(&function));
    }

    #[test]
    fn test_owner_link_rejects_other_owner() {
        let function = echo();
        let mut link = OwnerLink::for_function(&function);
        link.uid = Some("uid-2".to_string());
        assert!(!link.is_controlled_by(&function));

        let mut link = OwnerLink::for_function(&function);
        link.kind = "Deployment".to_string();
        assert!(!link.is_controlled_by(&function));
    }

    #[test]
    fn test_non_controller_references_ignored() {
        let meta = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                api_version: "useless.io/v1".to_string(),
                kind: KIND.to_string(),
                name: "echo".to_string(),
                uid: "uid-1".to_string(),
                controller: None,
                block_owner_deletion: None,
            }]),
            ..Default::default()
        };
        assert!(OwnerLink::controller_of(&meta).is_none());
    }

    #[test]
    fn test_spec_deserializes_without_replicas() {
        let spec: FunctionSpec =
            serde_json::from_str(r#"{"funcName":"echo","funcContent":"","image":"reg/echo"}"#)
                .unwrap();
        assert_eq!(spec.replicas, None);
    }

    #[test]
    fn test_crd_yaml_names_kind() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("functions.useless.io"));
    }
}
