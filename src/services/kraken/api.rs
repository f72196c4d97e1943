// src/services/kraken/api.rs

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::services::candles::Candle;
use crate::services::kraken::auth;
use crate::utils::errors::ApiError;

pub const BASE_URL: &str = "https://api.kraken.com";

/// Envelope shared by every Kraken REST answer.
#[derive(Debug, Deserialize)]
pub struct KrakenResponse {
    #[serde(default)]
    pub error: Vec<String>,
    #[serde(default)]
    pub result: Value,
}

impl KrakenResponse {
    pub fn into_result(self) -> Result<Value, ApiError> {
        if self.error.is_empty() {
            Ok(self.result)
        } else {
            Err(ApiError::Exchange(self.error))
        }
    }
}

/// `GET /0/public/OHLC`, oldest row first. The newest row is the bar that is
/// still forming.
pub async fn fetch_ohlc(
    http: &Client,
    base: &str,
    pair: &str,
    interval_minutes: u32,
) -> Result<Vec<Candle>, ApiError> {
    let url = format!("{base}/0/public/OHLC");
    let interval = interval_minutes.to_string();
    let resp = http
        .get(&url)
        .query(&[("pair", pair), ("interval", interval.as_str())])
        .send()
        .await?
        .json::<KrakenResponse>()
        .await?;
    parse_ohlc_result(&resp.into_result()?)
}

/// `result` maps the pair name to its rows plus a `last` cursor; rows are
/// `[time, open, high, low, close, vwap, volume, count]` with string prices.
pub fn parse_ohlc_result(result: &Value) -> Result<Vec<Candle>, ApiError> {
    let obj = result
        .as_object()
        .ok_or_else(|| ApiError::Other("OHLC result is not an object".into()))?;
    let rows = obj
        .iter()
        .find(|(k, _)| k.as_str() != "last")
        .and_then(|(_, v)| v.as_array())
        .ok_or_else(|| ApiError::Other("OHLC result carries no rows".into()))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(parse_row(row)?);
    }
    out.sort_by_key(|c| c.ts);
    Ok(out)
}

fn parse_row(row: &Value) -> Result<Candle, ApiError> {
    let field = |i: usize| -> Result<f64, ApiError> {
        let v = row
            .get(i)
            .ok_or_else(|| ApiError::Other(format!("OHLC row too short: {row}")))?;
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| ApiError::Other(format!("OHLC field {i} not numeric: {v}")))
    };
    let secs = row
        .get(0)
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::Other(format!("OHLC row without timestamp: {row}")))?;
    let ts = DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| ApiError::Other(format!("OHLC timestamp out of range: {secs}")))?;
    Ok(Candle {
        ts,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(6)?,
    })
}

/// Kraken wants `buy`/`sell`, a market order type and the volume as text.
pub fn add_order_form(nonce: &str, pair: &str, side: &str, volume: f64) -> Result<String, ApiError> {
    let volume = format!("{volume:.8}");
    let url = reqwest::Url::parse_with_params(
        "http://form.invalid/",
        &[
            ("nonce", nonce),
            ("ordertype", "market"),
            ("pair", pair),
            ("type", side),
            ("volume", volume.as_str()),
        ],
    )
    .map_err(|e| ApiError::Other(format!("cannot encode order form: {e}")))?;
    Ok(url.query().unwrap_or_default().to_string())
}

/// `POST /0/private/AddOrder` (market). Returns the exchange's `result`.
pub async fn add_order(
    http: &Client,
    base: &str,
    api_key: &str,
    api_secret: &str,
    pair: &str,
    side: &str,
    volume: f64,
) -> Result<Value, ApiError> {
    let path = "/0/private/AddOrder";
    let nonce = auth::generate_nonce();
    let body = add_order_form(&nonce, pair, side, volume)?;
    let sign = auth::sign_rest(api_secret, path, &nonce, &body)?;

    let resp = http
        .post(format!("{base}{path}"))
        .header("API-Key", api_key)
        .header("API-Sign", sign)
        .header("Content-Type", "application/x-www-form-urlencoded; charset=utf-8")
        .body(body)
        .send()
        .await?
        .json::<KrakenResponse>()
        .await?;
    resp.into_result()
}
