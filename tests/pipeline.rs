use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use rustraptor_engine::{
    config::strategies::{self, StrategyConfig},
    db::{models::TradeUpdate, MemoryTradeStore, TradeStore},
    services::{
        bootstrap::HistorySource,
        candles::Candle,
        coordinator::Coordinator,
        market_data::{BarEvent, MarketBus, MarketEvent, TickEvent},
        pipeline::Pipeline,
        trading_engine::{RecordingOrderClient, Side},
    },
    utils::errors::{ApiError, EngineError},
};

const SYMBOL: &str = "BTC/USD";

fn t(min: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
}

fn cfg() -> StrategyConfig {
    StrategyConfig {
        macd_cross_needed: false,
        require_volume_spike: false,
        ..strategies::mean_reversion()
    }
}

/// 40 falling 5-minute bars, 200 → 161. RSI is pinned at 0.
fn falling_history() -> Vec<Candle> {
    (0..40)
        .map(|i| {
            let close = 200.0 - i as f64;
            Candle {
                ts: t(5 * i),
                open: close + 0.5,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 10.0,
            }
        })
        .collect()
}

fn bar(min: i64, close: f64) -> BarEvent {
    BarEvent {
        symbol: SYMBOL.into(),
        interval_minutes: 5,
        ts: t(min),
        open: close,
        high: close + 0.5,
        low: close - 0.5,
        close,
        volume: 10.0,
    }
}

fn tick(price: f64, min: i64) -> TickEvent {
    TickEvent {
        symbol: SYMBOL.into(),
        price,
        quantity: 0.1,
        ts: t(min),
    }
}

fn pipeline(store: Arc<MemoryTradeStore>) -> Pipeline {
    let mut p = Pipeline::new(Arc::new(cfg()), vec![SYMBOL.to_string()], 10_000.0, store, None);
    p.seed(SYMBOL, falling_history());
    p
}

#[tokio::test]
async fn seeded_history_makes_indicators_ready() {
    let p = pipeline(Arc::new(MemoryTradeStore::new()));
    assert_eq!(p.history(SYMBOL).len(), 39);
    let ind = p.indicators(SYMBOL).expect("indicators ready");
    assert_eq!(ind.rsi.current, 0.0);
}

#[tokio::test]
async fn bar_close_opens_and_take_profit_closes() {
    let store = Arc::new(MemoryTradeStore::new());
    let mut p = pipeline(store.clone());

    // forming bar (161) closes, the new bar trades at 160
    p.on_bar_event(&bar(200, 160.0), t(200)).await;
    let pos = p.ledger().position(SYMBOL).cloned().expect("position opened");
    assert_eq!(pos.entry_price, 160.0);
    assert_eq!(store.open_count(), 1);

    // in-progress update below entry, still inside the min hold window
    p.on_bar_event(&bar(200, 150.0), t(201)).await;
    assert!(p.ledger().position(SYMBOL).is_some());

    p.on_tick_event(&tick(172.0, 210), t(210)).await;
    assert!(p.ledger().position(SYMBOL).is_none());
    assert!(p.portfolio().balance > 10_000.0);

    let stored = store.get(pos.trade_id).unwrap();
    assert!(stored.closed);
    match stored.last_update {
        Some(TradeUpdate::Close { reason, exit_price, .. }) => {
            assert_eq!(reason, "takeProfit");
            assert_eq!(exit_price, 172.0);
        }
        other => panic!("unexpected update {other:?}"),
    }
}

#[tokio::test]
async fn redelivered_bars_change_nothing() {
    let store = Arc::new(MemoryTradeStore::new());
    let mut p = pipeline(store.clone());

    p.on_bar_event(&bar(200, 160.0), t(200)).await;
    let len = p.history(SYMBOL).len();
    let snapshot = *p.indicators(SYMBOL).unwrap();

    p.on_bar_event(&bar(200, 160.0), t(201)).await;
    p.on_bar_event(&bar(195, 161.0), t(201)).await;
    assert_eq!(p.history(SYMBOL).len(), len);
    assert_eq!(*p.indicators(SYMBOL).unwrap(), snapshot);
    assert_eq!(store.all().len(), 1);
}

#[tokio::test]
async fn other_intervals_and_symbols_are_ignored() {
    let store = Arc::new(MemoryTradeStore::new());
    let mut p = pipeline(store.clone());

    let mut wrong_interval = bar(200, 160.0);
    wrong_interval.interval_minutes = 15;
    p.on_bar_event(&wrong_interval, t(200)).await;

    let mut wrong_symbol = bar(200, 160.0);
    wrong_symbol.symbol = "DOGE/USD".into();
    p.on_bar_event(&wrong_symbol, t(200)).await;

    assert_eq!(p.history(SYMBOL).len(), 39);
    assert!(store.all().is_empty());
}

#[tokio::test]
async fn failed_open_persistence_installs_nothing() {
    let store = Arc::new(MemoryTradeStore::new());
    let mut p = pipeline(store.clone());
    store.set_fail_inserts(true);

    let before = p.portfolio();
    p.on_bar_event(&bar(200, 160.0), t(200)).await;
    assert!(p.ledger().position(SYMBOL).is_none());
    assert_eq!(p.portfolio(), before);

    // store back: the next closed bar may enter
    store.set_fail_inserts(false);
    p.on_bar_event(&bar(205, 159.0), t(205)).await;
    assert!(p.ledger().position(SYMBOL).is_some());
    assert_eq!(store.open_count(), 1);
}

#[tokio::test]
async fn shutdown_liquidates_at_last_price() {
    let store = Arc::new(MemoryTradeStore::new());
    let mut p = pipeline(store.clone());
    p.on_bar_event(&bar(200, 160.0), t(200)).await;
    p.on_tick_event(&tick(160.5, 201), t(201)).await;

    let portfolio = p.shutdown(t(202)).await;
    assert_eq!(portfolio.open_positions, 0);
    let closed = store.all().pop().unwrap();
    assert!(closed.closed);
    match closed.last_update {
        Some(TradeUpdate::Close { reason, exit_price, .. }) => {
            assert_eq!(reason, "shutdown");
            assert_eq!(exit_price, 160.5);
        }
        other => panic!("unexpected update {other:?}"),
    }
}

#[tokio::test]
async fn bar_closing_event_price_reaches_the_ledger() {
    let store = Arc::new(MemoryTradeStore::new());
    let mut p = pipeline(store.clone());

    // entry books the price of the bar that closed the forming one
    p.on_bar_event(&bar(200, 150.0), t(200)).await;
    assert_eq!(p.ledger().position(SYMBOL).unwrap().entry_price, 150.0);

    p.on_bar_event(&bar(200, 158.0), t(201)).await;
    p.on_bar_event(&bar(205, 170.0), t(202)).await;
    let pos = p.ledger().position(SYMBOL).cloned().expect("still inside min hold");
    assert_eq!(pos.peak_price, 170.0);
    assert_eq!(pos.last_price, 170.0);
    assert_eq!(store.get(pos.trade_id).unwrap().peak_price, 170.0);

    p.shutdown(t(203)).await;
    match store.get(pos.trade_id).unwrap().last_update {
        Some(TradeUpdate::Close { exit_price, .. }) => assert_eq!(exit_price, 170.0),
        other => panic!("unexpected update {other:?}"),
    }
}

#[tokio::test]
async fn failed_recovery_query_is_fatal_for_the_config() {
    let store = Arc::new(MemoryTradeStore::new());
    store.set_fail_queries(true);
    let res = Pipeline::start(
        Arc::new(cfg()),
        vec![SYMBOL.to_string()],
        &FixedHistory,
        store.clone(),
        None,
    )
    .await;
    assert!(matches!(res, Err(EngineError::Recovery { ref config_id, .. }) if config_id == "mean-reversion"));
}

#[tokio::test]
async fn restart_restores_open_trade_with_peak() {
    let store = Arc::new(MemoryTradeStore::new());
    {
        let mut p = pipeline(store.clone());
        p.on_bar_event(&bar(200, 160.0), t(200)).await;
        p.on_tick_event(&tick(165.0, 202), t(202)).await;
    }

    let restarted = Pipeline::start(
        Arc::new(cfg()),
        vec![SYMBOL.to_string()],
        &FixedHistory,
        store.clone(),
        None,
    )
    .await
    .unwrap();
    let pos = restarted.ledger().position(SYMBOL).expect("restored");
    assert_eq!(pos.entry_price, 160.0);
    assert!(pos.peak_price >= 165.0);
}

struct FixedHistory;

#[async_trait]
impl HistorySource for FixedHistory {
    async fn candles(&self, _symbol: &str, _interval: u32) -> Result<Vec<Candle>, ApiError> {
        Ok(falling_history())
    }
}

#[tokio::test]
async fn run_loop_processes_events_then_liquidates_on_shutdown() {
    let store = Arc::new(MemoryTradeStore::new());
    let p = pipeline(store.clone());
    let bus = MarketBus::new();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(p.run(bus.subscribe(), rx));

    bus.publish(MarketEvent::Bar(bar(200, 160.0)));
    for _ in 0..100 {
        if store.open_count() == 1 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(store.open_count(), 1);

    tx.send(true).unwrap();
    let portfolio = handle.await.unwrap();
    assert_eq!(portfolio.open_positions, 0);
    assert_eq!(store.open_count(), 0);
}

#[tokio::test]
async fn coordinator_runs_configs_side_by_side() {
    let store = Arc::new(MemoryTradeStore::new());
    let bus = MarketBus::new();
    let coordinator = Coordinator::new(
        bus.clone(),
        vec![SYMBOL.to_string()],
        Arc::new(FixedHistory),
        store.clone(),
        None,
    );

    let a = StrategyConfig { id: "a".into(), ..cfg() };
    let b = StrategyConfig { id: "b".into(), ..cfg() };
    coordinator.spawn(a.clone()).unwrap();
    coordinator.spawn(b).unwrap();
    assert!(matches!(coordinator.spawn(a), Err(EngineError::DuplicateConfig(id)) if id == "a"));
    assert_eq!(coordinator.running(), vec!["a", "b"]);

    // both pipelines enter independently on the same closed bar
    let mut entered = false;
    for _ in 0..100 {
        bus.publish(MarketEvent::Bar(bar(200, 160.0)));
        let ids: Vec<String> = store.all().into_iter().map(|t| t.record.config_id).collect();
        if ids.contains(&"a".to_string()) && ids.contains(&"b".to_string()) {
            entered = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(entered);
    assert!(store.query_open_trade_id(SYMBOL, "a").await.unwrap().is_some());

    coordinator.shutdown();
    let results = coordinator.join().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| matches!(r, Ok(p) if p.open_positions == 0)));
    assert_eq!(store.open_count(), 0);
}

#[tokio::test]
async fn live_config_needs_an_order_client() {
    let store = Arc::new(MemoryTradeStore::new());
    let live = StrategyConfig { live: true, ..cfg() };

    let paper_only = Coordinator::new(
        MarketBus::new(),
        vec![SYMBOL.to_string()],
        Arc::new(FixedHistory),
        store.clone(),
        None,
    );
    assert!(matches!(
        paper_only.spawn(live.clone()),
        Err(EngineError::Bootstrap { ref config_id, .. }) if config_id == "mean-reversion"
    ));
    assert!(paper_only.running().is_empty());

    let bus = MarketBus::new();
    let orders = Arc::new(RecordingOrderClient::new());
    let with_orders = Coordinator::new(
        bus.clone(),
        vec![SYMBOL.to_string()],
        Arc::new(FixedHistory),
        store.clone(),
        Some(orders.clone()),
    );
    with_orders.spawn(live).unwrap();
    assert_eq!(with_orders.running(), vec!["mean-reversion"]);

    for _ in 0..100 {
        bus.publish(MarketEvent::Bar(bar(200, 160.0)));
        if !orders.orders().is_empty() {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(orders.orders()[0].1, Side::Buy);

    with_orders.shutdown();
    let results = with_orders.join().await;
    assert!(matches!(&results[0].1, Ok(p) if p.open_positions == 0));
    assert_eq!(orders.orders().last().map(|o| o.1), Some(Side::Sell));
}
