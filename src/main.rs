mod config;
mod engine;
mod handlers;
mod health;
mod kube_api;
mod lifecycle;
mod merge;
mod metrics;
mod pki;
mod policy;
mod registrar;
mod schema;
mod secret_store;
mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use clap::Parser;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::kube_api::{ClusterApi, KubeClusterApi};
use crate::pki::{CertificateAuthority, CertificateBundle};

const MAX_REVIEW_BYTES: usize = 2 * 1024 * 1024;

#[derive(Parser)]
#[command(
    name = "tfo-plugin-manager",
    about = "Admission webhook that injects plugins into terraform-operator resources"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        long,
        default_value = "/etc/plugin-manager/config.yaml",
        env = "PLUGIN_MANAGER_CONFIG"
    )]
    config: String,
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

fn acceptor_for(bundle: &CertificateBundle) -> Result<TlsAcceptor, tls::TlsError> {
    tls::server_config_from_pem(&bundle.tls_cert, &bundle.tls_key).map(TlsAcceptor::from)
}

/// Serves the webhook over TLS. A certificate published on `bundle_rx` is
/// picked up for new connections; established ones keep the old one.
async fn run_https_server(
    addr: SocketAddr,
    mut bundle_rx: watch::Receiver<Option<CertificateBundle>>,
    router: Router,
    serving: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let initial = bundle_rx.borrow_and_update().clone();
    let Some(bundle) = initial else {
        error!("no verified certificate available, not starting HTTPS server");
        return;
    };
    let mut tls_acceptor = match acceptor_for(&bundle) {
        Ok(acceptor) => acceptor,
        Err(e) => {
            error!("failed to build TLS config from verified certificate: {e}");
            return;
        }
    };

    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind HTTPS on {addr}: {e}"));

    info!(%addr, "HTTPS webhook server listening");
    serving.store(true, Ordering::Relaxed);

    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept TCP connection: {e}");
                        continue;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("HTTPS server shutting down");
                break;
            }
        };

        if bundle_rx.has_changed().unwrap_or(false) {
            let latest = bundle_rx.borrow_and_update().clone();
            if let Some(bundle) = latest {
                match acceptor_for(&bundle) {
                    Ok(acceptor) => {
                        info!("reloaded TLS certificate");
                        tls_acceptor = acceptor;
                    }
                    Err(e) => warn!("keeping previous TLS certificate: {e}"),
                }
            }
        }

        let tls_acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%remote_addr, "TLS handshake failed: {e}");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router.into_service());

            if let Err(e) = HttpBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!(%remote_addr, "error serving connection: {e}");
            }
        });
    }

    serving.store(false, Ordering::Relaxed);
}

async fn run_http_server(addr: SocketAddr, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind HTTP on {addr}: {e}"));

    info!(%addr, "HTTP metrics/health server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("HTTP server shutting down");
        })
        .await
        .unwrap_or_else(|e| error!("HTTP server error: {e}"));
}

fn parse_addr(name: &str, value: &str) -> SocketAddr {
    value.parse().unwrap_or_else(|e| {
        eprintln!("Invalid {name} '{value}': {e}");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let cli = Cli::parse();

    let config = config::PluginManagerConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load config from {}: {e}", cli.config);
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        namespace = %config.namespace,
        secret = %config.secret_name,
        policy_dir = %config.policy_dir.display(),
        resource.group = %config.resource.group,
        resource.resource = %config.resource.resource,
        resource.versions = ?config.resource.versions,
        deny_on_decode_error = config.mutation.deny_on_decode_error,
        "tfo-plugin-manager starting"
    );

    let listen_addr = parse_addr("listen_addr", &config.listen_addr);
    let metrics_addr = parse_addr("metrics_addr", &config.metrics_addr);

    let client = kube::Client::try_default().await.unwrap_or_else(|e| {
        eprintln!("Failed to create Kubernetes client: {e}");
        std::process::exit(1);
    });
    let api: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client));

    let mut registry = Registry::default();
    let metrics = Arc::new(metrics::PluginManagerMetrics::new(&mut registry));
    let registry = Arc::new(registry);

    let (ready_tx, ready_rx) = oneshot::channel();
    let (bundle_tx, bundle_rx) = watch::channel(None);

    let manager = lifecycle::CertLifecycleManager::new(
        secret_store::SecretStore::new(
            api.clone(),
            config.namespace.clone(),
            config.secret_name.clone(),
        ),
        registrar::WebhookRegistrar::new(api, registrar::RegistrationTarget::from_config(&config)),
        CertificateAuthority::new(
            time::Duration::days(config.lifecycle.ca_validity_days),
            time::Duration::days(config.lifecycle.leaf_validity_days),
        ),
        config.certs.clone(),
        config.dns_names(),
        config.lifecycle.clone(),
        metrics.clone(),
        ready_tx,
        bundle_tx,
    );
    let lifecycle_task = tokio::spawn(manager.run());

    let app_state = Arc::new(handlers::AppState {
        engine: engine::MutationEngine::new(
            schema::SchemaRegistry::from_versions(&config.resource.versions),
            config.policy_dir.clone(),
        ),
        resource: config.resource.clone(),
        deny_on_decode_error: config.mutation.deny_on_decode_error,
        metrics,
    });

    let webhook_router = Router::new()
        .route("/mutate", post(handlers::handle_mutate))
        .layer(DefaultBodyLimit::max(MAX_REVIEW_BYTES))
        .with_state(app_state);

    let serving = Arc::new(AtomicBool::new(false));
    let health_state = Arc::new(health::HealthState {
        registry,
        serving: serving.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(shutdown_signal(shutdown_tx));

    let health_task = tokio::spawn(run_http_server(
        metrics_addr,
        health::router(health_state),
        shutdown_rx.clone(),
    ));

    let mut startup_shutdown_rx = shutdown_rx.clone();
    let ready = tokio::select! {
        ready = ready_rx => {
            if ready.is_err() {
                error!("certificate lifecycle stopped before signalling readiness");
                std::process::exit(1);
            }
            true
        }
        _ = startup_shutdown_rx.changed() => {
            info!("shutdown requested before certificates were ready");
            false
        }
    };

    if ready {
        info!("certificates verified, starting webhook server");
        run_https_server(listen_addr, bundle_rx, webhook_router, serving, shutdown_rx).await;
    }

    lifecycle_task.abort();
    if let Err(e) = health_task.await {
        error!("health server task failed: {e}");
    }

    info!("tfo-plugin-manager shut down gracefully");
}
