//! The per-node connection agent binary.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::Client;
use tokio::sync::watch;
use tracing::{error, info};

use netattach_controller::agent::{ConnectionAgent, KubeInformerFactory};
use netattach_controller::cache::{RateLimiter, WorkQueue};
use netattach_controller::fabric;
use netattach_controller::observability::{AgentMetrics, REGISTRY};
use netattach_controller::server::{serve, ServerState};
use netattach_controller::store::KubeNetApi;

/// Maintains the network interfaces of the attachments relevant to this
/// node.
#[derive(Parser)]
#[command(name = "connection-agent")]
struct Options {
    /// Name of the node this agent runs on.
    #[arg(long)]
    nodename: String,

    /// IP address of this node, written into local attachments' status.
    #[arg(long)]
    hostip: Ipv4Addr,

    /// Network fabric implementation to use.
    #[arg(long, default_value = "logger")]
    netfabric: String,

    /// Comma-separated programs that post-create/post-delete commands may
    /// invoke.
    #[arg(long, default_value = "")]
    allowed_programs: String,

    /// Path to a kubeconfig for the object store; in-cluster config when
    /// omitted.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Number of worker tasks.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Sustained requeue rate allowed by the workqueue's token bucket.
    #[arg(long, default_value_t = 10.0)]
    qps: f64,

    /// Burst size of the workqueue's token bucket.
    #[arg(long, default_value_t = 100)]
    burst: usize,

    /// Address the metrics/probe server listens on. The port is unusual
    /// on purpose: the agent shares the host's network namespace.
    #[arg(long, default_value = "0.0.0.0:9294")]
    metrics_addr: String,
}

async fn make_client(kubeconfig: Option<&PathBuf>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?
        }
        None => kube::Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netattach_controller=info,connection_agent=info".into()),
        )
        .init();

    let options = Options::parse();
    info!(node = %options.nodename, host_ip = %options.hostip, "starting connection agent");

    let Some(net_fabric) = fabric::by_name(&options.netfabric) else {
        bail!("unknown network fabric {:?}", options.netfabric);
    };
    let allowed_programs: HashSet<String> = options
        .allowed_programs
        .split(',')
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect();

    let client = make_client(options.kubeconfig.as_ref()).await?;
    let api = Arc::new(KubeNetApi::new(
        client.clone(),
        "connection-agent",
        Some(options.nodename.clone()),
    ));

    let metrics = AgentMetrics::new(
        &REGISTRY,
        &options.nodename,
        net_fabric.name(),
        options.workers,
    )?;
    let server_state = ServerState::new(REGISTRY.clone());
    {
        let state = Arc::clone(&server_state);
        let addr = options.metrics_addr.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(&addr, state).await {
                error!(error = %err, "HTTP server failed");
            }
        });
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        let _ = stop_tx.send(true);
    });

    let factory = Arc::new(KubeInformerFactory::new(
        client,
        options.nodename.clone(),
        stop_rx.clone(),
    ));
    let queue = WorkQueue::new(RateLimiter::default().with_bucket(options.qps, options.burst));
    let agent = ConnectionAgent::new(
        options.nodename,
        options.hostip,
        api,
        factory,
        net_fabric,
        queue,
        options.workers,
        allowed_programs,
        metrics,
    );

    {
        let state = Arc::clone(&server_state);
        let local = agent.local_cache();
        tokio::spawn(async move {
            local.wait_synced().await;
            state.set_ready(true);
        });
    }

    agent.run(stop_rx).await?;
    info!("connection agent stopped");
    Ok(())
}
