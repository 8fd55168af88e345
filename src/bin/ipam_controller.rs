//! The IPAM controller binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kube::api::Api;
use kube::Client;
use kube_runtime::watcher;
use tokio::sync::watch;
use tracing::{error, info};

use netattach_controller::api::{IPLock, NetworkAttachment, Subnet};
use netattach_controller::cache::{spawn_watcher, CacheCore, RateLimiter, WorkQueue};
use netattach_controller::ipam::IpamController;
use netattach_controller::observability::{IpamMetrics, REGISTRY};
use netattach_controller::server::{serve, ServerState};
use netattach_controller::store::KubeNetApi;

/// Assigns IPv4 addresses to NetworkAttachments and records them as
/// IPLocks.
#[derive(Parser)]
#[command(name = "ipam-controller")]
struct Options {
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

    /// Address the metrics/probe server listens on.
    #[arg(long, default_value = "0.0.0.0:9295")]
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
                .unwrap_or_else(|_| "netattach_controller=info,ipam_controller=info".into()),
        )
        .init();

    let options = Options::parse();
    info!("starting IPAM controller");

    let client = make_client(options.kubeconfig.as_ref()).await?;
    let api = Arc::new(KubeNetApi::new(client.clone(), "ipam", None));

    let metrics = IpamMetrics::new(&REGISTRY, options.workers)?;
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

    let subnets: Arc<CacheCore<Subnet>> = CacheCore::new();
    let attachments: Arc<CacheCore<NetworkAttachment>> = CacheCore::new();
    let locks: Arc<CacheCore<IPLock>> = CacheCore::new();

    let queue = WorkQueue::new(RateLimiter::default().with_bucket(options.qps, options.burst));
    let controller = IpamController::new(
        api,
        Arc::clone(&subnets),
        Arc::clone(&attachments),
        Arc::clone(&locks),
        queue,
        options.workers,
        metrics,
    );
    // Indexes and handlers must exist before the watchers deliver.
    controller.register();

    let stop_for = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.changed().await;
    };
    spawn_watcher(
        Api::<Subnet>::all(client.clone()),
        watcher::Config::default(),
        Arc::clone(&subnets),
        stop_for(stop_rx.clone()),
    );
    spawn_watcher(
        Api::<NetworkAttachment>::all(client.clone()),
        watcher::Config::default(),
        Arc::clone(&attachments),
        stop_for(stop_rx.clone()),
    );
    spawn_watcher(
        Api::<IPLock>::all(client.clone()),
        watcher::Config::default(),
        Arc::clone(&locks),
        stop_for(stop_rx.clone()),
    );

    {
        let state = Arc::clone(&server_state);
        let (subnets, attachments, locks) =
            (Arc::clone(&subnets), Arc::clone(&attachments), Arc::clone(&locks));
        tokio::spawn(async move {
            subnets.wait_synced().await;
            attachments.wait_synced().await;
            locks.wait_synced().await;
            state.set_ready(true);
        });
    }

    controller.run(stop_rx).await;
    info!("IPAM controller stopped");
    Ok(())
}
