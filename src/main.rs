mod auth;
mod balancer;
mod config;
mod constants;
mod error;
mod limits;
mod pricing;
mod proxy;
mod routes;
mod transforms;
mod usage;
mod wildcard;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router, ServiceExt,
    routing::{get, post},
};
use balancer::LoadBalancer;
use clap::Parser;
use config::{Config, ConfigStore};
use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::normalize_path::NormalizePath;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usage::UsageStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AppState {
    pub config: ConfigStore,
    pub balancer: Arc<LoadBalancer>,
    pub usage: Arc<UsageStore>,
    pub http_client: Client,
    pub started_at: Instant,
}

#[derive(Parser)]
#[command(name = "ccgate")]
#[command(about = "Multi-tenant reverse proxy for Anthropic-compatible LLM endpoints")]
struct Args {
    /// Directory holding server.json, upstreams.json, tenants.json, pricing.json
    #[arg(short, long, env = "CCGATE_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Host to bind to (overrides server.json)
    #[arg(short = 'H', long, env = "CCGATE_HOST")]
    host: Option<String>,

    /// Port to bind to (overrides server.json and PORT)
    #[arg(short, long, env = "CCGATE_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let loaded = match Config::load(&args.config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ccgate: {e}");
            std::process::exit(1);
        }
    };

    let console_layer = loaded
        .logging
        .enable_console
        .then(tracing_subscriber::fmt::layer);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(console_layer)
        .init();

    let host = args.host.unwrap_or_else(|| loaded.server.host.clone());
    let port = args.port.unwrap_or(loaded.server.port);
    let admin = loaded.admin.clone();

    // Shared HTTP client with connection pooling; per-request timeouts come
    // from server.proxy.timeout at dispatch time.
    let http_client = Client::builder()
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");

    let balancer = Arc::new(LoadBalancer::new(
        http_client.clone(),
        loaded.upstreams.clone(),
        &loaded.load_balancer,
    ));

    let state = Arc::new(AppState {
        config: ConfigStore::new(args.config_dir.clone(), loaded),
        balancer: balancer.clone(),
        usage: Arc::new(UsageStore::new(constants::USAGE_DATA_DIR)),
        http_client,
        started_at: Instant::now(),
    });

    balancer.start_probes().await;

    let mut router = Router::new()
        .route("/health", get(routes::health::health))
        .route("/version", get(routes::health::version))
        .route(
            "/openai/v1/chat/completions",
            post(routes::openai::chat_completions),
        );

    if admin.enabled {
        router = router.nest(&admin.path, routes::admin::router(state.clone()));
        info!("Admin API enabled at {}", admin.path);
    }

    let app = NormalizePath::trim_trailing_slash(
        router
            .fallback(routes::anthropic::proxy)
            .layer(CorsLayer::permissive())
            .with_state(state),
    );

    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid listen address {host}:{port}: {e}");
            std::process::exit(1);
        }
    };

    info!("Starting ccgate v{VERSION}-{GIT_HASH} (built {BUILD_TIME})");
    info!("Listening on http://{addr}");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service_with_connect_info::<SocketAddr>(
            app,
        ),
    )
    .await
    {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
