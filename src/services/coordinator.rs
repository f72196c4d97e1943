use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::strategies::StrategyConfig;
use crate::db::store::TradeStore;
use crate::services::bootstrap::HistorySource;
use crate::services::ledger::Portfolio;
use crate::services::market_data::MarketBus;
use crate::services::pipeline::Pipeline;
use crate::services::trading_engine::OrderClient;
use crate::utils::errors::EngineError;

type TaskMap = DashMap<String, JoinHandle<Result<Portfolio, EngineError>>>;

/// Runs one pipeline per strategy configuration. Pipelines share only the
/// read side of the market bus and the collaborators; a fatal error in one
/// never stops its siblings.
pub struct Coordinator {
    bus: MarketBus,
    symbols: Vec<String>,
    history: Arc<dyn HistorySource>,
    store: Arc<dyn TradeStore>,
    orders: Option<Arc<dyn OrderClient>>,
    tasks: TaskMap,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(
        bus: MarketBus,
        symbols: Vec<String>,
        history: Arc<dyn HistorySource>,
        store: Arc<dyn TradeStore>,
        orders: Option<Arc<dyn OrderClient>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bus,
            symbols,
            history,
            store,
            orders,
            tasks: TaskMap::default(),
            shutdown_tx,
        }
    }

    /// Receiver that flips to `true` once `shutdown` is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Start a pipeline for `cfg`. Ids must be unique among running pipelines.
    pub fn spawn(&self, cfg: StrategyConfig) -> Result<(), EngineError> {
        if cfg.live && self.orders.is_none() {
            return Err(EngineError::Bootstrap {
                config_id: cfg.id.clone(),
                reason: "live configuration without exchange credentials".into(),
            });
        }
        let id = cfg.id.clone();
        let entry = match self.tasks.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(EngineError::DuplicateConfig(id)),
            dashmap::mapref::entry::Entry::Vacant(v) => v,
        };

        // subscribe before bootstrap so nothing published meanwhile is missed
        let rx = self.bus.subscribe();
        let shutdown = self.shutdown_tx.subscribe();
        let symbols = self.symbols.clone();
        let history = self.history.clone();
        let store = self.store.clone();
        let orders = if cfg.live { self.orders.clone() } else { None };
        let config = Arc::new(cfg);

        let handle = tokio::spawn(async move {
            let id = config.id.clone();
            match Pipeline::start(config, symbols, history.as_ref(), store, orders).await {
                Ok(pipeline) => Ok(pipeline.run(rx, shutdown).await),
                Err(e) => {
                    log::error!("[{id}] pipeline not started: {e}");
                    Err(e)
                }
            }
        });
        entry.insert(handle);
        log::info!("[{id}] pipeline spawned");
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every pipeline to finish (after `shutdown`, or after a
    /// fatal start error). Results are sorted by configuration id.
    pub async fn join(&self) -> Vec<(String, Result<Portfolio, EngineError>)> {
        let ids = self.running();
        let handles: Vec<(String, JoinHandle<_>)> = ids
            .into_iter()
            .filter_map(|id| self.tasks.remove(&id))
            .collect();

        let (ids, futs): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(futs).await;

        ids.into_iter()
            .zip(results)
            .map(|(id, joined)| {
                let res = joined.unwrap_or_else(|e| {
                    Err(EngineError::Bootstrap {
                        config_id: id.clone(),
                        reason: format!("pipeline task failed: {e}"),
                    })
                });
                (id, res)
            })
            .collect()
    }
}
