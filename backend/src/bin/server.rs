//! HTTP entry point: wires up `Config`, a Postgres pool and the signed-token
//! verifier, then serves the router from `handlers.rs` behind a
//! `ServiceBuilder` layer stack with graceful shutdown on Ctrl-C.

use eidastats_backend::auth::GpgSignedTokenVerifier;
use eidastats_backend::config::Config;
use eidastats_backend::handlers::{router, AppState};
use eidastats_backend::store;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter.clone())
        .json()
        .init();
    info!(prefix = %config.route_prefix, "eidastats server starting");

    let pool = store::connect(&config.db_uri, config.db_pool_size).await?;
    info!("connected to database");

    let gnupg_home = std::env::var("EIDASTATS_GNUPG_HOME")
        .unwrap_or_else(|_| "./gnupghome".to_string())
        .into();
    let state = AppState {
        pool,
        verifier: Arc::new(GpgSignedTokenVerifier { gnupg_home }),
    };

    let app = router(&config.route_prefix, state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive()),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
