mod config;

use clap::Parser as _;
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use switchyard::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    client::{HttpNodeClient, NodeClient},
    dispatch::Dispatcher,
    nodes_file::WatchedFile,
    probe::HealthProber,
    registry::NodeRegistry,
    selector::Selector,
    stats::Stats,
};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting switchyard with config: {:?}", config);

    let registry = NodeRegistry::from_config_file(&config.nodes)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load nodes: {}", e))?;

    if config.watch {
        registry
            .receive_updates(WatchedFile(config.nodes.clone()))
            .await?;
    }

    let client: Arc<dyn NodeClient> = Arc::new(HttpNodeClient::new(
        Duration::from_secs(config.pool_idle_timeout_secs),
        config.pool_max_idle_per_host,
    ));
    let prober = HealthProber::new(registry.clone(), client.clone(), config.probe_config());
    let dispatcher = Dispatcher::new(
        registry,
        Selector::new(config.priority_order),
        client,
        Stats::new(),
        config.dispatch_config(),
    );

    let _probe_loop = prober.clone().spawn();

    let mut serves = JoinSet::new();

    let prometheus_layer = if config.metrics {
        let (prometheus_layer, prometheus_handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        let metrics_router = build_metrics_router(prometheus_handle);
        let bind_addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&bind_addr).await?;
        serves.spawn(axum::serve(listener, metrics_router).into_future());
        info!("Metrics endpoint enabled on {}", bind_addr);
        Some(prometheus_layer)
    } else {
        info!("Metrics endpoint disabled");
        None
    };

    let mut router = build_router(AppState::new(dispatcher, prober));
    if let Some(prometheus_layer) = prometheus_layer {
        router = router.layer(prometheus_layer);
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    serves.spawn(axum::serve(listener, router).into_future());
    info!("Switchyard listening on {}", bind_addr);

    if let Some(result) = serves.join_next().await {
        result?.map_err(anyhow::Error::from)
    } else {
        error!("No server tasks were spawned");
        Err(anyhow::anyhow!("No server tasks were spawned"))
    }
}
