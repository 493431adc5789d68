use std::sync::Arc;

use poem::endpoint::PrometheusExporter;
use poem::listener::{Acceptor, Listener, TcpListener};
use poem::middleware::{CookieJarManager, Cors};
use poem::{EndpointExt, Route};
use tokio::task::JoinSet;
use tracing::info;

use validation_common::config::make_config_loader;
use validation_common::safe_display::SafeDisplay;

use validation_service::api::make_open_api_service;
use validation_service::bootstrap::bootstrap;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = make_config_loader().load()?;
    config.tracing.init();

    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap(),
    );

    runtime.block_on(run(config))
}

async fn run(config: validation_common::config::ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("starting with config:\n{}", config.to_safe_string());

    let bootstrapped = bootstrap(&config).await?;
    let api_service = make_open_api_service(bootstrapped.state.clone());
    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();
    let metrics = PrometheusExporter::new(bootstrapped.registry.clone());

    let cors = Cors::new().allow_credentials(true);

    let app = Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/specs", spec)
        .nest("/metrics", metrics)
        .with(CookieJarManager::new())
        .with(cors);

    let poem_listener = TcpListener::bind(format!("0.0.0.0:{}", config.http_port));
    let acceptor = poem_listener.into_acceptor().await?;
    let port = acceptor.local_addr()[0]
        .as_socket_addr()
        .expect("socket address")
        .port();
    info!("listening on port {port}");

    let mut join_set = JoinSet::new();
    join_set.spawn(async move {
        poem::Server::new_with_acceptor(acceptor)
            .run_with_graceful_shutdown(app, shutdown_signal(), None)
            .await
            .map_err(anyhow::Error::from)
    });

    while let Some(result) = join_set.join_next().await {
        result??;
    }

    Ok(())
}

/// Waits for SIGTERM or SIGINT; returning lets `run_with_graceful_shutdown`
/// stop accepting new connections while jobs already in flight finish
/// (§4.1 "in-flight jobs are allowed to reach a terminal state").
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
