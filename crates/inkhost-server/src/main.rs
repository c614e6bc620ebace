use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json, Router, middleware,
    response::Html,
    routing::get,
};
use inkhost_server::{admin, catalog_store::JsonCatalog, ssr_proxy, state::AppState};
use inkhost_ssr::{ActivationCoordinator, ProcessSupervisor, SupervisorConfig};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    running_themes: Vec<String>,
}

async fn healthz(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        running_themes: state.supervisor.list_running(),
    })
}

/// Served for front-end paths whenever no SSR theme is active.
async fn builtin_page() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>inkhost</title></head>
<body>
    <h1>inkhost</h1>
    <p>No theme is active. <a href="/admin">Open the admin interface</a> to activate one.</p>
</body>
</html>"#,
    )
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn default_ssr_port() -> u16 {
    std::env::var("INKHOST_SSR_DEFAULT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|&p| p >= 1024)
        .unwrap_or(3000)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let themes_dir = env_path("INKHOST_THEMES_DIR", "themes");
    let data_dir = env_path("INKHOST_DATA_DIR", "data");
    std::fs::create_dir_all(&data_dir)?;

    let config = SupervisorConfig::from_env(&themes_dir);
    let catalog = Arc::new(JsonCatalog::open(
        &themes_dir,
        config.entry_point.clone(),
        &data_dir,
    )?);

    let supervisor = ProcessSupervisor::new(config);
    let coordinator = ActivationCoordinator::new(supervisor.clone(), catalog.clone());
    let state = AppState {
        supervisor: supervisor.clone(),
        coordinator,
        catalog,
        http: reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()?,
        default_ssr_port: default_ssr_port(),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/admin/ssr", admin::router())
        .fallback(get(builtin_page))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ssr_proxy::ssr_proxy,
        ))
        .with_state(state);

    let addr: SocketAddr = std::env::var("INKHOST_HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8091".to_string())
        .parse()?;
    tracing::info!(%addr, themes_dir = %themes_dir.display(), "inkhost HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Runtimes hold their ports until told otherwise; sweep them on the way out.
    if let Err(e) = supervisor.stop_all().await {
        tracing::warn!(error = %e, "stopping runtimes during shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "installing SIGTERM handler");
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
    tracing::info!("shutdown signal received");
}
