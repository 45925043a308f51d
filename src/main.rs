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

//! function-controller - reconciles `Function` resources into the
//! workloads, services and autoscalers that serve them.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use function_controller::config::FunctionControllerConfig;
use function_controller::controller_manager::ControllerManager;
use function_controller::function::crd_yaml;
use function_controller::health::HealthServer;
use function_controller::kubernetes::{
    KubeClusterClient, KubeEventRecorder, KubeInformerFactory, KubeLeaseStore,
};
use function_controller::leader_election::create_identity;

/// Function controller
///
/// Watches `Function` resources and creates a Deployment, a Service and a
/// HorizontalPodAutoscaler for each of them. Several replicas may run; a
/// lease makes sure only one of them reconciles at a time.
#[derive(Parser, Debug)]
#[command(name = "function-controller")]
#[command(version)]
#[command(about = "Controller for Function resources", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long)]
    namespace: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Enable leader election
    #[arg(long)]
    leader_elect: bool,

    /// Disable leader election
    #[arg(long, conflicts_with = "leader_elect")]
    leader_elect_disable: bool,

    /// Identity used in the lease (defaults to $ID, then hostname)
    #[arg(long)]
    leader_elect_identity: Option<String>,

    /// Lease duration
    #[arg(long, value_parser = parse_duration)]
    lease_duration: Option<Duration>,

    /// Renew deadline
    #[arg(long, value_parser = parse_duration)]
    renew_deadline: Option<Duration>,

    /// Retry period
    #[arg(long, value_parser = parse_duration)]
    retry_period: Option<Duration>,

    /// The address to serve health checks on
    #[arg(long)]
    healthz_bind_address: Option<String>,

    /// The port to serve health checks on
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Print the Function CustomResourceDefinition and exit
    #[arg(long)]
    print_crd: bool,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", crd_yaml().context("failed to render CRD")?);
        return Ok(());
    }

    init_logging(&args.log_level, args.log_json)?;

    let config = load_config(args).await?;
    config.validate().context("invalid configuration")?;

    let identity = match &config.leader_election.identity {
        Some(identity) => identity.clone(),
        None => create_identity()?,
    };

    info!(
        identity = %identity,
        namespace = config.generic.namespace.as_deref().unwrap_or("<all>"),
        workers = config.generic.workers,
        leader_election = config.leader_election.leader_elect,
        "starting function-controller"
    );

    let client = create_client(&config).await?;

    let mut manager = ControllerManager::new(
        config.clone(),
        identity.clone(),
        Arc::new(KubeInformerFactory::new(
            client.clone(),
            config.generic.namespace.clone(),
        )),
        Arc::new(KubeClusterClient::new(client.clone())),
        Arc::new(KubeEventRecorder::new(client.clone(), Some(identity))),
    );
    if config.leader_election.leader_elect {
        manager = manager.with_lease_store(Arc::new(KubeLeaseStore::new(
            client,
            &config.leader_election.resource_namespace,
            &config.leader_election.resource_name,
        )));
    }

    let shutdown_token = manager.shutdown_token();

    let health = HealthServer::new(
        manager.health(),
        config.generic.healthz_bind_address.clone(),
        config.generic.healthz_bind_port,
    )
    .spawn(shutdown_token.clone());

    tokio::spawn({
        let shutdown_token = shutdown_token.clone();
        async move {
            if let Err(e) = wait_for_shutdown().await {
                error!("failed to install signal handlers: {:#}", e);
            }
            shutdown_token.cancel();
        }
    });

    let result = manager.run().await;
    shutdown_token.cancel();
    match health.await {
        Ok(Err(e)) => error!("health server failed: {:#}", e),
        Err(e) => error!("health server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    if let Err(e) = result {
        error!("function-controller failed: {:#}", e);
        return Err(e.into());
    }

    info!("function-controller exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {}", level))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the configuration from file and applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<FunctionControllerConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<FunctionControllerConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        FunctionControllerConfig::default()
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.generic.master = Some(master);
    }
    if let Some(namespace) = args.namespace {
        config.generic.namespace = Some(namespace);
    }
    if let Some(workers) = args.workers {
        config.generic.workers = workers;
    }
    if let Some(address) = args.healthz_bind_address {
        config.generic.healthz_bind_address = address;
    }
    if let Some(port) = args.healthz_bind_port {
        config.generic.healthz_bind_port = port;
    }

    let election = &mut config.leader_election;
    if args.leader_elect {
        election.leader_elect = true;
    } else if args.leader_elect_disable {
        election.leader_elect = false;
    }
    if let Some(identity) = args.leader_elect_identity {
        election.identity = Some(identity);
    }
    if let Some(duration) = args.lease_duration {
        election.lease_duration = duration;
    }
    if let Some(deadline) = args.renew_deadline {
        election.renew_deadline = deadline;
    }
    if let Some(period) = args.retry_period {
        election.retry_period = period;
    }

    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &FunctionControllerConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.generic.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &config.generic.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    Ok(kube::Client::try_from(kube_config)?)
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        info!("received Ctrl+C, shutting down");
    }

    Ok(())
}
