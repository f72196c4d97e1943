pub mod models;
pub mod queries;
pub mod redis;
pub mod store;

pub use queries::PgTradeStore;
pub use store::{MemoryTradeStore, TradeStore};
