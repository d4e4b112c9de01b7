// src/oracle.rs
use crate::models::Quote;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("provider throttled the request: {0}")]
    Throttled(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("price lookup unavailable")]
    Unavailable,
}

/// Source of current stock prices. `Ok(None)` means the symbol is unknown.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, OracleError>;
}

#[derive(Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote")]
    global_quote: Option<GlobalQuote>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct GlobalQuote {
    #[serde(rename = "01. symbol")]
    symbol: Option<String>,
    #[serde(rename = "05. price")]
    price: Option<String>,
}

#[derive(Deserialize)]
struct SymbolSearchResponse {
    #[serde(rename = "bestMatches", default)]
    best_matches: Vec<SymbolMatch>,
}

#[derive(Deserialize)]
struct SymbolMatch {
    #[serde(rename = "1. symbol")]
    symbol: String,
    #[serde(rename = "2. name")]
    name: String,
}

/// Price lookups against the AlphaVantage query API. Company names are
/// remembered per symbol so repeat quotes cost one provider call.
pub struct AlphaVantageOracle {
    client: Client,
    base_url: String,
    api_key: String,
    names: RwLock<HashMap<String, String>>,
}

impl AlphaVantageOracle {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, OracleError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(AlphaVantageOracle {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            names: RwLock::new(HashMap::new()),
        })
    }

    async fn query(&self, function: &str, param: &str, value: &str) -> Result<String, OracleError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("function", function),
                (param, value),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OracleError::Status(response.status()));
        }
        Ok(response.text().await?)
    }

    /// Company name for `symbol`, if the provider knows one. Only found
    /// names are cached; a failed search is retried on the next quote.
    async fn company_name(&self, symbol: &str) -> Option<String> {
        if let Some(name) = self.cached_name(symbol) {
            return Some(name);
        }
        let name = match self.query("SYMBOL_SEARCH", "keywords", symbol).await {
            Ok(body) => parse_company_name(&body, symbol)?,
            Err(e) => {
                debug!("Name lookup for {} failed: {}", symbol, e);
                return None;
            }
        };
        self.remember_name(symbol, &name);
        Some(name)
    }

    fn cached_name(&self, symbol: &str) -> Option<String> {
        let names = self.names.read().ok()?;
        names.get(&symbol.to_uppercase()).cloned()
    }

    fn remember_name(&self, symbol: &str, name: &str) {
        if let Ok(mut names) = self.names.write() {
            names.insert(symbol.to_uppercase(), name.to_string());
        }
    }
}

#[async_trait]
impl PriceOracle for AlphaVantageOracle {
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, OracleError> {
        let body = self.query("GLOBAL_QUOTE", "symbol", symbol).await?;
        let Some((symbol, price)) = parse_global_quote(&body)? else {
            return Ok(None);
        };
        let name = self
            .company_name(&symbol)
            .await
            .unwrap_or_else(|| symbol.clone());
        Ok(Some(Quote {
            symbol,
            name,
            price,
        }))
    }
}

fn parse_global_quote(body: &str) -> Result<Option<(String, Decimal)>, OracleError> {
    let response: GlobalQuoteResponse =
        serde_json::from_str(body).map_err(|e| OracleError::Malformed(e.to_string()))?;

    if let Some(note) = response.note.or(response.information) {
        warn!("AlphaVantage throttled: {}", note);
        return Err(OracleError::Throttled(note));
    }
    if response.error_message.is_some() {
        return Ok(None);
    }

    let quote = match response.global_quote {
        Some(quote) => quote,
        None => return Err(OracleError::Malformed("missing Global Quote".to_string())),
    };
    let (symbol, price) = match (quote.symbol, quote.price) {
        (Some(symbol), Some(price)) => (symbol, price),
        // An empty object is how the provider answers an unknown symbol.
        _ => return Ok(None),
    };
    let price = Decimal::from_str(price.trim())
        .map_err(|e| OracleError::Malformed(format!("price {:?}: {}", price, e)))?;
    if price <= Decimal::ZERO {
        return Ok(None);
    }
    Ok(Some((symbol.to_uppercase(), price)))
}

fn parse_company_name(body: &str, symbol: &str) -> Option<String> {
    let response: SymbolSearchResponse = serde_json::from_str(body).ok()?;
    response
        .best_matches
        .into_iter()
        .find(|m| m.symbol.eq_ignore_ascii_case(symbol))
        .map(|m| m.name)
}

/// In-memory oracle with a fixed price table. Backs the offline `fixed`
/// provider and the tests.
#[derive(Default)]
pub struct FixedPriceOracle {
    quotes: RwLock<HashMap<String, Quote>>,
    delay: Option<Duration>,
    failing: AtomicBool,
}

impl FixedPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, symbol: &str, name: &str, price: Decimal) -> Self {
        self.set_price(symbol, name, price);
        self
    }

    /// Delays every lookup, for exercising timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_price(&self, symbol: &str, name: &str, price: Decimal) {
        let symbol = symbol.to_uppercase();
        let quote = Quote {
            symbol: symbol.clone(),
            name: name.to_string(),
            price,
        };
        if let Ok(mut quotes) = self.quotes.write() {
            quotes.insert(symbol, quote);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>, OracleError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable);
        }
        let quotes = self.quotes.read().map_err(|_| OracleError::Unavailable)?;
        Ok(quotes.get(&symbol.to_uppercase()).cloned())
    }
}
