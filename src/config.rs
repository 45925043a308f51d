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

//! Configuration structures for the function controller.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by [`FunctionControllerConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The worker pool would be empty.
    #[error("workers must be at least 1")]
    NoWorkers,

    /// A holder would lose the lease before its renew deadline.
    #[error("leaseDuration ({lease:?}) must be greater than renewDeadline ({renew:?})")]
    LeaseNotAboveRenew {
        /// Configured lease duration.
        lease: Duration,
        /// Configured renew deadline.
        renew: Duration,
    },

    /// The renew deadline leaves no room for a single retry.
    #[error("renewDeadline ({renew:?}) must be greater than retryPeriod ({retry:?})")]
    RenewNotAboveRetry {
        /// Configured renew deadline.
        renew: Duration,
        /// Configured retry period.
        retry: Duration,
    },

    /// Candidates would poll without pause.
    #[error("retryPeriod must be non-zero")]
    ZeroRetryPeriod,

    /// Backoff would start above its own ceiling.
    #[error("workqueue baseDelay ({base:?}) must not exceed maxDelay ({max:?})")]
    BackoffInverted {
        /// Initial requeue delay.
        base: Duration,
        /// Requeue delay ceiling.
        max: Duration,
    },
}

/// Main configuration for the function controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionControllerConfig {
    /// Process-wide settings.
    #[serde(default)]
    pub generic: GenericConfig,

    /// Retry behaviour of the work queue.
    #[serde(default)]
    pub workqueue: WorkQueueConfig,

    /// Leader election configuration.
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,
}

impl FunctionControllerConfig {
    /// Checks the relations between settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generic.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        if self.workqueue.base_delay > self.workqueue.max_delay {
            return Err(ConfigError::BackoffInverted {
                base: self.workqueue.base_delay,
                max: self.workqueue.max_delay,
            });
        }

        let le = &self.leader_election;
        if le.leader_elect {
            if le.retry_period.is_zero() {
                return Err(ConfigError::ZeroRetryPeriod);
            }
            if le.lease_duration <= le.renew_deadline {
                return Err(ConfigError::LeaseNotAboveRenew {
                    lease: le.lease_duration,
                    renew: le.renew_deadline,
                });
            }
            if le.renew_deadline <= le.retry_period {
                return Err(ConfigError::RenewNotAboveRetry {
                    renew: le.renew_deadline,
                    retry: le.retry_period,
                });
            }
        }

        Ok(())
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Namespace to watch. Unset watches all namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Number of concurrent reconcile workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// The address to serve health checks on.
    #[serde(default = "default_bind_address")]
    pub healthz_bind_address: String,

    /// The port to serve health checks on.
    #[serde(default = "default_healthz_port")]
    pub healthz_bind_port: u16,

    /// How long to wait for workers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            namespace: None,
            workers: default_workers(),
            healthz_bind_address: default_bind_address(),
            healthz_bind_port: default_healthz_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_workers() -> usize {
    5
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_port() -> u16 {
    8081
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Backoff applied to keys whose reconciliation failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkQueueConfig {
    /// Delay after the first failure.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound of the delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_base_delay() -> Duration {
    Duration::from_millis(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(1000)
}

/// Leader election configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    /// Enable leader election.
    #[serde(default = "default_leader_elect")]
    pub leader_elect: bool,

    /// Lease namespace.
    #[serde(default = "default_resource_namespace")]
    pub resource_namespace: String,

    /// Lease name.
    #[serde(default = "default_resource_name")]
    pub resource_name: String,

    /// Identity of this candidate. Derived from the host when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Lease duration.
    #[serde(default = "default_lease_duration", with = "humantime_serde")]
    pub lease_duration: Duration,

    /// Renew deadline.
    #[serde(default = "default_renew_deadline", with = "humantime_serde")]
    pub renew_deadline: Duration,

    /// Retry period.
    #[serde(default = "default_retry_period", with = "humantime_serde")]
    pub retry_period: Duration,

    /// Clear the lease holder on graceful shutdown.
    #[serde(default = "default_release_on_cancel")]
    pub release_on_cancel: bool,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            leader_elect: default_leader_elect(),
            resource_namespace: default_resource_namespace(),
            resource_name: default_resource_name(),
            identity: None,
            lease_duration: default_lease_duration(),
            renew_deadline: default_renew_deadline(),
            retry_period: default_retry_period(),
            release_on_cancel: default_release_on_cancel(),
        }
    }
}

fn default_leader_elect() -> bool {
    true
}

fn default_resource_namespace() -> String {
    "useless".to_string()
}

fn default_resource_name() -> String {
    "useless-controller".to_string()
}

fn default_lease_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_renew_deadline() -> Duration {
    Duration::from_secs(15)
}

fn default_retry_period() -> Duration {
    Duration::from_secs(5)
}

fn default_release_on_cancel() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FunctionControllerConfig::default();
        assert_eq!(config.generic.workers, 5);
        assert!(config.leader_election.leader_elect);
        assert_eq!(config.leader_election.lease_duration, Duration::from_secs(60));
        assert_eq!(config.leader_election.renew_deadline, Duration::from_secs(15));
        assert_eq!(config.leader_election.retry_period, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let yaml = r#"
generic:
  namespace: useless
  workers: 2
  shutdownTimeout: 10s
workqueue:
  baseDelay: 10ms
leaderElection:
  leaseDuration: 30s
  renewDeadline: 10s
  retryPeriod: 2s
"#;

        let config: FunctionControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.generic.namespace.as_deref(), Some("useless"));
        assert_eq!(config.generic.workers, 2);
        assert_eq!(config.generic.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.workqueue.base_delay, Duration::from_millis(10));
        assert_eq!(config.workqueue.max_delay, Duration::from_secs(1000));
        assert_eq!(config.leader_election.lease_duration, Duration::from_secs(30));
        assert_eq!(config.leader_election.resource_name, "useless-controller");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: FunctionControllerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.generic.healthz_bind_port, 8081);
        assert!(config.leader_election.release_on_cancel);
    }

    #[test]
    fn test_validate_lease_timings() {
        let mut config = FunctionControllerConfig::default();
        config.leader_election.renew_deadline = Duration::from_secs(60);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseNotAboveRenew { .. })
        ));

        let mut config = FunctionControllerConfig::default();
        config.leader_election.retry_period = Duration::from_secs(15);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RenewNotAboveRetry { .. })
        ));
    }

    #[test]
    fn test_validate_skips_lease_timings_when_disabled() {
        let mut config = FunctionControllerConfig::default();
        config.leader_election.leader_elect = false;
        config.leader_election.renew_deadline = Duration::from_secs(600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_workers_and_backoff() {
        let mut config = FunctionControllerConfig::default();
        config.generic.workers = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoWorkers));

        let mut config = FunctionControllerConfig::default();
        config.workqueue.base_delay = Duration::from_secs(2000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BackoffInverted { .. })
        ));
    }
}
