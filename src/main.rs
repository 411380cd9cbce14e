mod config;
mod coordinator;
mod error;
mod helpers;
mod logs;
mod models;
mod provision;
mod registry;
mod routes;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use coordinator::Coordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_console=info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::args()
        .skip(1)
        .zip(std::env::args().skip(2))
        .find_map(|(k, v)| (k == "-config" || k == "--config").then_some(v))
        .or_else(|| std::env::args().nth(1).filter(|a| !a.starts_with('-')))
        .unwrap_or_else(|| "/etc/cluster-console/config.yaml".to_string());

    let cfg = config::Config::load(&PathBuf::from(&config_path)).unwrap_or_else(|e| {
        eprintln!("error loading config: {}", e);
        std::process::exit(1);
    });

    let coordinator = Coordinator::new(cfg).await.unwrap_or_else(|e| {
        eprintln!("failed to open cluster registry: {}", e);
        std::process::exit(1);
    });
    let coordinator = Arc::new(coordinator);

    match coordinator.registry.get_active().await {
        Some(tag) => info!("active cluster: {}", tag),
        None => info!("no active cluster"),
    }

    let state = AppState {
        coordinator: coordinator.clone(),
    };

    let router = routes::build_router(state);

    let listen_addr = coordinator.config().listen_addr();
    let listener = TcpListener::bind(&listen_addr).await.unwrap_or_else(|e| {
        eprintln!("failed to bind {}: {}", listen_addr, e);
        std::process::exit(1);
    });

    info!("cluster-console listening on {}", listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            eprintln!("server error: {}", e);
            std::process::exit(1);
        });

    coordinator.logs.shutdown();
    info!("shut down");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
