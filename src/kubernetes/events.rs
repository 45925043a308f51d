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

//! [`EventRecorder`] publishing Kubernetes Events.
//!
//! Publishing is fire-and-forget: failures are logged and never reach the
//! reconciler.

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::client::{EventRecorder, EventType};
use crate::controller::CONTROLLER_NAME;
use crate::function::Function;

const ACTION: &str = "Reconcile";

/// Publishes events on `Function` objects.
#[derive(Clone)]
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    /// Creates a recorder reporting as this controller from `instance`.
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn kube_event_type(type_: EventType) -> KubeEventType {
    match type_ {
        EventType::Normal => KubeEventType::Normal,
        EventType::Warning => KubeEventType::Warning,
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, function: &Function, type_: EventType, reason: &str, message: String) {
        let reference = function.object_ref(&());
        let event = Event {
            type_: kube_event_type(type_),
            reason: reason.to_string(),
            note: Some(message),
            action: ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}
