use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use tokio::sync::broadcast;
use tracing::{info, warn};

use trestle::node::{KubeClusterView, NodeIdentity, NodeProvider};
use trestle::queue::Queue;
use trestle::rate_limit::ExponentialBackoff;
use trestle::settings::AppConfig;
use trestle::trace;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Application CLI arguments
struct Args {
    /// log at debug level unless RUST_LOG overrides it
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.verbose && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }

    let cfg = AppConfig::load(args.config.as_deref())?;
    trace::init(cfg.log_format, &cfg.node.name)?;

    let upstream_client = kube::Client::try_default().await?;
    let downstream_client = match &cfg.node.downstream_kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            let config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?;
            kube::Client::try_from(config)?
        }
        None => upstream_client.clone(),
    };

    let identity = NodeIdentity {
        kubelet_version: cfg.node.kubelet_version.clone(),
        daemon_port: cfg.node.daemon_port,
        internal_ip: cfg
            .node
            .internal_ip
            .clone()
            .or_else(|| std::env::var("TRESTLE_POD_IP").ok()),
        external_ip: cfg
            .node
            .external_ip
            .clone()
            .or_else(|| std::env::var("TRESTLE_EXTERNAL_POD_IP").ok()),
        labels: cfg.node.labels.clone(),
    };
    let provider = Arc::new(NodeProvider::new(
        Arc::new(KubeClusterView::new(upstream_client.clone())),
        Arc::new(KubeClusterView::new(downstream_client)),
        identity,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Node updates produced by the sync handler get pushed upstream.
    let status_client = upstream_client.clone();
    provider.notify_node_status(shutdown_tx.subscribe(), move |node| {
        let api: Api<Node> = Api::all(status_client.clone());
        tokio::spawn(async move {
            let Some(name) = node.metadata.name.clone() else {
                return;
            };
            if let Err(err) = api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&node))
                .await
            {
                warn!(node = %name, error = %err, "failed to push node status upstream");
            }
        });
    });

    let limiter = Arc::new(ExponentialBackoff::new(
        Duration::from_millis(cfg.sync.backoff_base_ms),
        Duration::from_secs(cfg.sync.backoff_max_secs),
    ));
    let handler_provider = Arc::clone(&provider);
    let queue = Queue::new(
        limiter,
        "node-status",
        Arc::new(move |key: String| {
            let provider = Arc::clone(&handler_provider);
            async move {
                provider.ping().await?;
                let mut node = Node::default();
                node.metadata.name = Some(key);
                provider.configure_node(&mut node).await?;
                provider.push_status(node);
                anyhow::Ok(())
            }
        }),
    );

    // Periodic full resync of the synthetic node.
    let resync_queue = Arc::clone(&queue);
    let node_name = cfg.node.name.clone();
    let mut resync_shutdown = shutdown_tx.subscribe();
    let resync_interval = Duration::from_secs(cfg.sync.resync_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(resync_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => resync_queue.enqueue_without_rate_limit(&node_name),
                _ = resync_shutdown.recv() => return,
            }
        }
    });

    let runner = {
        let queue = Arc::clone(&queue);
        let shutdown = shutdown_tx.subscribe();
        let workers = cfg.sync.workers;
        tokio::spawn(async move { queue.run(workers, shutdown).await })
    };

    info!(node = %cfg.node.name, "bridge started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(());
    let _ = runner.await;
    trace::shutdown();
    Ok(())
}
