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

//! Bindings of the controller's boundaries to a live cluster.

pub mod client;
pub mod events;
pub mod informers;
pub mod lease;

pub use client::KubeClusterClient;
pub use events::KubeEventRecorder;
pub use informers::{KubeCache, KubeInformerFactory};
pub use lease::KubeLeaseStore;

/// Field manager recorded on objects this controller writes.
pub const FIELD_MANAGER: &str = "useless-controller";
