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

//! function-controller - a Kubernetes controller for `Function` resources
//!
//! This library provides the building blocks of the controller:
//! - The `Function` resource and the dependents derived from it
//! - A deduplicating, rate-limited work queue
//! - Routing of watch notifications into reconcile keys
//! - The reconciler and its worker pool
//! - Lease-based leader election
//! - Health checks
//! - Bindings to a live cluster, plus in-memory doubles for tests

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_manager;
pub mod event_router;
pub mod function;
pub mod health;
pub mod kubernetes;
pub mod leader_election;
pub mod reconciler;
pub mod resources;
pub mod workqueue;

// Re-export commonly used types
pub use config::FunctionControllerConfig;
pub use controller::{Controller, ControllerError, FunctionController};
pub use controller_context::ControllerContext;
pub use controller_manager::ControllerManager;
pub use function::{Function, FunctionSpec, ReconcileKey};
pub use reconciler::{ReconcileError, Reconciler, RetryPolicy};
pub use workqueue::WorkQueue;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
