use dotenv::dotenv;
use std::env;

use crate::config::strategies::{self, StrategyConfig};

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub kraken_api_key: Option<String>,
    pub kraken_api_secret: Option<String>,
    pub symbols: Vec<String>,
    pub active_strategies: Vec<String>,
    pub strategy_config_path: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Settings {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv().ok(); // loads `.env` file automatically

        let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL missing")?;
        let redis_url = env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        let kraken_api_key = env::var("KRAKEN_API_KEY").ok().filter(|s| !s.is_empty());
        let kraken_api_secret = env::var("KRAKEN_API_SECRET").ok().filter(|s| !s.is_empty());

        let symbols = split_list(&env::var("SYMBOLS").map_err(|_| "SYMBOLS missing")?);
        if symbols.is_empty() {
            return Err("SYMBOLS must list at least one pair".into());
        }
        let active_strategies = env::var("ACTIVE_STRATEGIES")
            .map(|s| split_list(&s))
            .unwrap_or_default();
        let strategy_config_path = env::var("STRATEGY_CONFIG_PATH").ok().filter(|s| !s.is_empty());

        let metrics_port = match env::var("METRICS_PORT") {
            Ok(p) => Some(
                p.parse::<u16>()
                    .map_err(|_| "METRICS_PORT must be a valid u16")?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            redis_url,
            kraken_api_key,
            kraken_api_secret,
            symbols,
            active_strategies,
            strategy_config_path,
            metrics_port,
        })
    }

    /// Configs to run: the JSON file when given, else the named presets
    /// (all presets when `ACTIVE_STRATEGIES` is empty).
    pub fn strategy_configs(&self) -> Result<Vec<StrategyConfig>, strategies::ConfigError> {
        let all = match &self.strategy_config_path {
            Some(path) => strategies::load_from_file(path)?,
            None if self.active_strategies.is_empty() => strategies::presets(),
            None => self
                .active_strategies
                .iter()
                .map(|name| strategies::preset(name))
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(all)
    }

    pub fn has_kraken_credentials(&self) -> bool {
        self.kraken_api_key.is_some() && self.kraken_api_secret.is_some()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
