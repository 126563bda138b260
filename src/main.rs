//! Application entry point.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use reqwest::Url;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use rpc_balancer::api::{RateLimitConfig, create_router, create_router_with_rate_limit};
use rpc_balancer::app::{
    AccessCacheConfig, AccessControlCache, AffinityConfig, AppState, HealthCheckConfig,
    HealthChecker, MethodPolicy, Node, NodeRegistry, RetryPolicy, spawn_access_maintenance,
    spawn_affinity_sweeper, spawn_health_checker,
};
use rpc_balancer::domain::{AuthorizationService, NodeConfig, TelemetrySink};
use rpc_balancer::infra::authorization::DEFAULT_AUTH_TIMEOUT;
use rpc_balancer::infra::{
    HttpAuthorizationService, HttpTelemetrySink, NodeProxy, NoopTelemetrySink, RpcTipProbe,
    load_node_configs, parse_node_configs,
};

/// Application configuration
struct Config {
    host: String,
    port: u16,
    nodes: Vec<NodeConfig>,
    auth_service_url: String,
    auth_service_token: SecretString,
    auth_service_timeout: Duration,
    /// Crash and system report endpoint (optional - reports are dropped if not set)
    telemetry_url: Option<String>,
    enable_rate_limiting: bool,
    rate_limit_config: RateLimitConfig,
    health_config: HealthCheckConfig,
    retry_policy: RetryPolicy,
    affinity_config: AffinityConfig,
    access_config: AccessCacheConfig,
    method_policy: MethodPolicy,
}

impl Config {
    fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let nodes = Self::load_nodes()?;

        let auth_service_url =
            env::var("AUTH_SERVICE_URL").context("AUTH_SERVICE_URL not set")?;
        let auth_service_token = env::var("AUTH_SERVICE_TOKEN")
            .map(SecretString::from)
            .context("AUTH_SERVICE_TOKEN not set")?;
        let auth_service_timeout = env::var("AUTH_SERVICE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_AUTH_TIMEOUT);

        let telemetry_url = env::var("TELEMETRY_URL").ok().filter(|u| !u.is_empty());

        let enable_rate_limiting = env::var("ENABLE_RATE_LIMITING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            host,
            port,
            nodes,
            auth_service_url,
            auth_service_token,
            auth_service_timeout,
            telemetry_url,
            enable_rate_limiting,
            rate_limit_config: RateLimitConfig::from_env(),
            health_config: HealthCheckConfig::from_env(),
            retry_policy: RetryPolicy::from_env(),
            affinity_config: AffinityConfig::from_env(),
            access_config: AccessCacheConfig::from_env(),
            method_policy: MethodPolicy::from_env(),
        })
    }

    /// `NODES_CONFIG` (file path) wins over `NODES` (inline JSON)
    fn load_nodes() -> Result<Vec<NodeConfig>> {
        if let Ok(path) = env::var("NODES_CONFIG") {
            let nodes = load_node_configs(&PathBuf::from(&path))
                .with_context(|| format!("Failed to load node list from {}", path))?;
            return Ok(nodes);
        }

        let inline = env::var("NODES").map_err(|_| {
            anyhow::anyhow!(
                "No node list configured.\n\
                 Set NODES_CONFIG to a JSON file or NODES to an inline JSON array of\n\
                 {{\"chain\": \"...\", \"url\": \"...\"}} objects."
            )
        })?;
        parse_node_configs(&inline).context("Invalid NODES")
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn build_registry(nodes: &[NodeConfig], proxy_timeout: Duration) -> Result<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    for node in nodes {
        let endpoint = Url::parse(&node.url)
            .with_context(|| format!("Invalid node URL {}", node.url))?;
        let proxy = NodeProxy::new(endpoint, proxy_timeout)?;
        registry.add_node(Node::new(node.chain.clone(), proxy));
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("🏗️  RPC Balancer v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    info!("📦 Initializing infrastructure...");

    let registry = build_registry(&config.nodes, config.retry_policy.proxy_timeout)?;
    for chain in registry.chains() {
        let count = registry.pool(chain).map_or(0, |p| p.len());
        info!("   ✓ Chain {} with {} node(s)", chain, count);
    }

    let authorization: Arc<dyn AuthorizationService> = Arc::new(HttpAuthorizationService::new(
        &config.auth_service_url,
        config.auth_service_token.clone(),
        config.auth_service_timeout,
    )?);
    info!("   ✓ Authorization service at {}", config.auth_service_url);
    if config.access_config.controller_access_id.is_some() {
        info!("   ✓ Controller access id configured");
    }

    let telemetry: Arc<dyn TelemetrySink> = match &config.telemetry_url {
        Some(url) => {
            info!("   ✓ Telemetry reporting to {}", url);
            Arc::new(HttpTelemetrySink::new(url.clone()))
        }
        None => {
            info!("   ○ Telemetry disabled");
            Arc::new(NoopTelemetrySink)
        }
    };

    let access = Arc::new(AccessControlCache::new(
        Arc::clone(&authorization),
        &config.access_config,
    ));

    let app_state = AppState::new(registry, authorization)
        .with_access_cache(Arc::clone(&access))
        .with_affinity_keep_alive(config.affinity_config.keep_alive)
        .with_retry_policy(config.retry_policy.clone())
        .with_method_policy(config.method_policy.clone())
        .with_telemetry(Arc::clone(&telemetry));
    let app_state = Arc::new(app_state);

    // Health checks: one synchronous round so the first requests see real heights
    let probe = Arc::new(RpcTipProbe::new(config.health_config.timeout)?);
    let checker = Arc::new(HealthChecker::new(Arc::clone(&app_state.registry), probe));
    let round = checker.run_once().await;
    if round.alive == 0 {
        warn!("No node passed the initial health check");
    }
    info!(
        "   ✓ Initial health check: {} alive, {} dead",
        round.alive, round.dead
    );

    let (_health_handle, health_shutdown_tx) =
        spawn_health_checker(checker, config.health_config.clone());
    info!(
        "   ✓ Health checker started (interval: {}s)",
        config.health_config.interval.as_secs()
    );

    let (_affinity_handle, affinity_shutdown_tx) = spawn_affinity_sweeper(
        Arc::clone(&app_state.affinity),
        config.affinity_config.sweep_interval,
    );
    info!(
        "   ✓ Affinity sweeper started (keep-alive: {}s)",
        config.affinity_config.keep_alive.as_secs()
    );

    let (access_handle, access_shutdown_tx) = spawn_access_maintenance(
        Arc::clone(&app_state.access),
        Arc::clone(&app_state.registry),
        Arc::clone(&app_state.affinity),
        Arc::clone(&app_state.telemetry),
        config.access_config.sweep_interval,
    );
    info!(
        "   ✓ Access cache maintenance started (lifetime: {}s)",
        config.access_config.lifetime.as_secs()
    );

    let router = if config.enable_rate_limiting {
        info!("   ✓ Rate limiting enabled");
        create_router_with_rate_limit(Arc::clone(&app_state), config.rate_limit_config.clone())
    } else {
        info!("   ○ Rate limiting disabled");
        create_router(Arc::clone(&app_state))
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("🚀 Server starting on http://{}", addr);
    info!("📖 Swagger UI available at http://{}/swagger-ui", addr);
    info!("📄 OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Signal background loops to shutdown
    let _ = health_shutdown_tx.send(true);
    let _ = affinity_shutdown_tx.send(true);
    let _ = access_shutdown_tx.send(true);

    // The access loop flushes pending usage on its way out
    if let Err(e) = access_handle.await {
        warn!(error = %e, "Access cache maintenance did not stop cleanly");
    }

    info!("Server shutdown complete");
    Ok(())
}
