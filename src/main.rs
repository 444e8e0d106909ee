use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{Router, routing::get};
use gatekeeper::{
    config::Config,
    keeper::Keeper,
    middleware::{Gatekeeper, check_quota, log_errors},
    routes,
    store::{self, SqlStore},
};
use tower::ServiceBuilder;
#[cfg(debug_assertions)]
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("Failed to load configuration");

    let pool = store::connect(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    let mut sql_store =
        SqlStore::new(pool, config.quota_table.clone()).expect("Invalid quota table name");
    if let Some(timeout) = config.keeper_timeout() {
        sql_store = sql_store.with_timeout(timeout);
    }
    sql_store
        .check()
        .await
        .expect("Quota database is not ready");

    let keeper: Arc<dyn Keeper> = Arc::new(sql_store);
    let gate = Arc::new(
        Gatekeeper::from_config(keeper, &config).expect("Invalid key header or header prefix"),
    );

    let router = Router::new()
        .route("/quota", get(routes::quota::current_quota))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(log_errors))
                .layer(axum::middleware::from_fn_with_state(gate, check_quota)),
        );

    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(CorsLayer::permissive())
    };

    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        router,
    )
    .await
    .expect("Failed to start server");
}
