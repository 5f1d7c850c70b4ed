use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ruori::apis::{admission, status};
use ruori::config::{LoadBalancer, Settings};
use ruori::index::ClusterIndex;
use ruori::proxy::backend::BackendResolver;
use ruori::proxy::portforward::ForwardCache;
use ruori::proxy::server::{serve_http, serve_https, Dispatcher};
use ruori::proxy::tls::IngressCertResolver;
use ruori::proxy::{forward, metrics};

/// Kubernetes ingress controller: one process reconciles Ingress status and
/// terminates HTTP/HTTPS for the matching rules.
#[derive(Parser, Debug)]
#[command(name = "ruori", version, about)]
struct Cli {
    /// Ingress server http bind address
    #[arg(long, default_value = ":8080")]
    http_addr: String,

    /// Ingress server https bind address
    #[arg(long, default_value = ":8443")]
    https_addr: String,

    /// Metrics server bind address
    #[arg(long, default_value = "127.0.0.1:8081")]
    metrics_addr: String,

    /// Probe server bind address
    #[arg(long, default_value = "127.0.0.1:8082")]
    probe_addr: String,

    /// Enable leader election for the status controller
    #[arg(long)]
    leader_elect: bool,

    /// IngressClass name
    #[arg(long, default_value = "go-ingress")]
    ingress_class_name: String,

    /// Portforward to Pods
    #[arg(long)]
    port_forward: bool,

    /// LoadBalancer address
    #[arg(long, required = true)]
    load_balancer: String,

    /// Path to a kubeconfig file; in-cluster or environment config if unset
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Admission webhook bind address
    #[arg(long, default_value = ":9443")]
    webhook_addr: String,

    /// Directory with the webhook serving certificate
    #[arg(long, default_value = "/tmp/k8s-webhook-server/serving-certs")]
    webhook_cert_dir: String,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let cli = Cli::parse();
    let load_balancer =
        LoadBalancer::parse(&cli.load_balancer).context("invalid --load-balancer")?;

    let settings = Arc::new(Settings {
        http_addr: cli.http_addr,
        https_addr: cli.https_addr,
        metrics_addr: cli.metrics_addr,
        probe_addr: cli.probe_addr,
        webhook_addr: cli.webhook_addr,
        webhook_cert_dir: cli.webhook_cert_dir,
        ingress_class_name: cli.ingress_class_name,
        port_forward: cli.port_forward,
        leader_elect: cli.leader_elect,
    });

    let client = build_client(cli.kubeconfig.as_deref()).await?;
    info!(class = %settings.ingress_class_name, "starting ingress controller");

    let index = ClusterIndex::spawn(&client);
    index.wait_ready().await;
    info!("watch caches synced");

    let forwards = settings.port_forward.then(|| {
        Arc::new(ForwardCache::new(
            client.clone(),
            index.services.clone(),
            index.pods.clone(),
        ))
    });

    let resolver = BackendResolver::new(index.clone(), forward::client(), forwards.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        index.clone(),
        resolver,
        settings.ingress_class_name.clone(),
    ));
    let cert_resolver = Arc::new(IngressCertResolver::new(&index));

    let is_leader = Arc::new(AtomicBool::new(!settings.leader_elect));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = tokio::task::JoinSet::<Result<(), ruori::Error>>::new();

    tasks.spawn(serve_and_log(
        "http",
        serve_http(
            settings.http_addr.clone(),
            dispatcher.clone(),
            shutdown_rx.clone(),
        ),
    ));
    tasks.spawn(serve_and_log(
        "https",
        serve_https(
            settings.https_addr.clone(),
            dispatcher.clone(),
            cert_resolver,
            shutdown_rx.clone(),
        ),
    ));
    tasks.spawn(serve_and_log(
        "metrics",
        metrics::serve_metrics(settings.metrics_addr.clone(), shutdown_rx.clone()),
    ));
    tasks.spawn(serve_and_log(
        "probes",
        metrics::serve_probes(settings.probe_addr.clone(), shutdown_rx.clone()),
    ));
    tasks.spawn(serve_and_log(
        "webhooks",
        admission::serve(
            settings.webhook_addr.clone(),
            settings.webhook_cert_dir.clone(),
            settings.ingress_class_name.clone(),
            shutdown_rx.clone(),
        ),
    ));

    if settings.leader_elect {
        let lease_client = client.clone();
        let lease_flag = is_leader.clone();
        let lease_shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            status::leadership_loop(lease_client, lease_flag, lease_shutdown).await;
            Ok(())
        });
    }

    let reconciler = status::StatusReconciler::new(
        client.clone(),
        &index,
        settings.clone(),
        load_balancer,
        is_leader.clone(),
    );
    tasks.spawn(async move {
        reconciler.run().await;
        Ok(())
    });

    wait_for_shutdown(&mut tasks).await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Some(forwards) = &forwards {
        forwards.shutdown();
    }

    // Give in-flight connections a moment to drain.
    let drain = tokio::time::sleep(std::time::Duration::from_secs(5));
    tokio::select! {
        _ = drain => {}
        _ = async { while tasks.join_next().await.is_some() {} } => {}
    }

    Ok(())
}

async fn serve_and_log(
    what: &'static str,
    future: impl std::future::Future<Output = Result<(), ruori::Error>>,
) -> Result<(), ruori::Error> {
    if let Err(err) = future.await {
        error!(error = %err, "{what} server failed");
        return Err(err);
    }
    Ok(())
}

async fn build_client(kubeconfig: Option<&std::path::Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).context("reading kubeconfig")?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?
        }
        None => kube::Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

async fn wait_for_shutdown(
    tasks: &mut tokio::task::JoinSet<Result<(), ruori::Error>>,
) -> Result<()> {
    let mut sigterm = unix_signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("interrupt received");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("terminate received");
            Ok(())
        }
        joined = tasks.join_next() => match joined {
            Some(Ok(Ok(()))) => anyhow::bail!("a server stopped unexpectedly"),
            Some(Ok(Err(err))) => Err(err).context("a server failed"),
            Some(Err(err)) => Err(err).context("a server panicked"),
            None => anyhow::bail!("no servers were started"),
        },
    }
}
