pub mod config;
pub mod db;
pub mod services {
    pub mod bootstrap;
    pub mod candles;
    pub mod coordinator;
    pub mod indicators;
    pub mod ledger;
    pub mod market_data;
    pub mod pipeline;
    pub mod trading_engine;

    pub mod kraken;
    pub mod strategies {
        pub mod common;
        pub use common::{for_kind, EntryDecision, ExitDecision, ExitReason, Strategy};
        pub mod exits;
        pub mod mean_reversion;
        pub mod scalping;
        pub mod trend_follow;
        pub mod volatility_breakout;
    }
}

pub mod utils;
