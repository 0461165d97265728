use axum::http::StatusCode;
use axum::routing::get;

mod admin_ui;

/// `0` success, `1` startup failure, `2` config invalid, `3` bind failure —
/// spec'd CLI exit codes.
const EXIT_STARTUP_FAILURE: i32 = 1;
const EXIT_CONFIG_INVALID: i32 = 2;
const EXIT_BIND_FAILURE: i32 = 3;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(code) = run().await {
        std::process::exit(code);
    }
}

async fn run() -> Result<(), i32> {
    let boot = gproxy_core::bootstrap::bootstrap_from_env()
        .await
        .map_err(|err| match err {
            gproxy_core::bootstrap::BootstrapError::Config(source) => {
                tracing::error!(error = %source, "invalid configuration");
                EXIT_CONFIG_INVALID
            }
            gproxy_core::bootstrap::BootstrapError::Other(source) => {
                tracing::error!(error = %source, "startup failed");
                EXIT_STARTUP_FAILURE
            }
        })?;
    let global = boot.state.global.load();
    let state_for_proxy = boot.state.clone();

    let upstream_cfg = gproxy_core::upstream_client::UpstreamClientConfig::from_global(&global);
    let upstream_client: std::sync::Arc<dyn gproxy_core::upstream_client::UpstreamClient> =
        std::sync::Arc::new(
            gproxy_core::upstream_client::WreqUpstreamClient::new_with_proxy_resolver(
                upstream_cfg,
                move || state_for_proxy.global.load().proxy.clone(),
            )
            .map_err(|err| {
                tracing::error!(error = %err, "startup failed");
                EXIT_STARTUP_FAILURE
            })?,
        );
    let engine = std::sync::Arc::new(gproxy_core::proxy_engine::ProxyEngine::new(
        boot.state.clone(),
        boot.registry.clone(),
        upstream_client,
        boot.storage.clone(),
    ));

    let app = axum::Router::new()
        .merge(gproxy_router::proxy_router(engine))
        .nest(
            "/admin",
            gproxy_router::admin_router(boot.state.clone(), boot.storage.clone())
                .merge(gproxy_admin::admin_router(boot.state.clone(), boot.storage.clone())),
        )
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .route("/", get(admin_ui::index))
        .route("/assets/{*path}", get(admin_ui::asset));

    let bind = format!("{}:{}", global.host, global.port);
    let listener = tokio::net::TcpListener::bind(&bind).await.map_err(|err| {
        tracing::error!(error = %err, bind = %bind, "bind failed");
        EXIT_BIND_FAILURE
    })?;
    println!("listening on {bind}");
    axum::serve(listener, app).await.map_err(|err| {
        tracing::error!(error = %err, "server error");
        EXIT_STARTUP_FAILURE
    })?;
    Ok(())
}
