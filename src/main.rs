use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;

use rustraptor_engine::{
    config::settings::Settings,
    db::{redis::RedisPool, PgTradeStore, TradeStore},
    services::{
        bootstrap::{CachedHistory, HistorySource, KrakenHistory},
        coordinator::Coordinator,
        kraken::KrakenClient,
        market_data::{KrakenFeed, MarketBus},
        trading_engine::OrderClient,
    },
};

fn init_logging() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    log::info!("Starting RustRaptor engine…");

    let settings = Settings::new().map_err(|e| anyhow::anyhow!("failed to load settings: {e}"))?;
    let configs = settings.strategy_configs()?;
    for c in &configs {
        c.validate()?;
    }
    if configs.iter().any(|c| c.live) && !settings.has_kraken_credentials() {
        anyhow::bail!("a live configuration is active but KRAKEN_API_KEY / KRAKEN_API_SECRET are not set");
    }

    if let Some(port) = settings.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("prometheus exporter")?;
        log::info!("metrics on :{port}/metrics");
    }

    let pg_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pg_pool)
        .await
        .context("migrations")?;
    let store: Arc<dyn TradeStore> = Arc::new(PgTradeStore::new(pg_pool.clone()));

    let history: Arc<dyn HistorySource> = match &settings.redis_url {
        Some(url) => match RedisPool::new(url).await {
            Ok(redis) => Arc::new(CachedHistory::new(KrakenHistory::new(), redis)),
            Err(e) => {
                log::warn!("redis unavailable ({e}), history cache disabled");
                Arc::new(KrakenHistory::new())
            }
        },
        None => Arc::new(KrakenHistory::new()),
    };

    let orders: Option<Arc<dyn OrderClient>> =
        match (&settings.kraken_api_key, &settings.kraken_api_secret) {
            (Some(key), Some(secret)) => Some(Arc::new(KrakenClient::new(key.clone(), secret.clone()))),
            _ => None,
        };

    // --- market data -------------------------------------------------------
    let bus = MarketBus::new();
    let intervals: BTreeSet<u32> = configs.iter().map(|c| c.interval_minutes).collect();
    let coordinator = Coordinator::new(bus.clone(), settings.symbols.clone(), history, store, orders);
    let feed = KrakenFeed::new(settings.symbols.clone(), intervals);
    let feed_task = tokio::spawn(feed.run(bus, coordinator.shutdown_signal()));

    // --- pipelines ---------------------------------------------------------
    for cfg in configs {
        let id = cfg.id.clone();
        if let Err(e) = coordinator.spawn(cfg) {
            log::error!("[{id}] not started: {e}");
        }
    }
    log::info!("running: {}", coordinator.running().join(", "));

    tokio::signal::ctrl_c().await.context("ctrl_c")?;
    log::info!("shutdown requested, liquidating open positions…");
    coordinator.shutdown();

    for (id, res) in coordinator.join().await {
        match res {
            Ok(p) => log::info!(
                "[{id}] final balance {:.2} ({} positions still open)",
                p.balance,
                p.open_positions
            ),
            Err(e) => log::error!("[{id}] {e}"),
        }
    }
    if let Err(e) = feed_task.await {
        log::error!("[ws] market data task failed: {e}");
    }
    pg_pool.close().await;
    Ok(())
}
