// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type UserId = i64;

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub hash: String,
    pub cash: Decimal,
}

/// One row of the append-only ledger. `shares` is positive for a buy and
/// negative for a sell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub symbol: String,
    pub price: Decimal,
    pub shares: i64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub name: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingRow {
    pub symbol: String,
    pub name: String,
    pub shares: i64,
    pub price: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioView {
    pub holdings: Vec<HoldingRow>,
    pub cash: Decimal,
    pub grand_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeReceipt {
    pub symbol: String,
    pub name: String,
    pub shares: i64,
    pub price: Decimal,
    pub total: Decimal,
    pub cash: Decimal,
}

// Form bodies. Every field is optional so a missing field surfaces as a
// validation error from the service instead of a body rejection.

#[derive(Debug, Default, Deserialize)]
pub struct TradeForm {
    pub symbol: Option<String>,
    pub shares: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuoteForm {
    pub symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegisterForm {
    pub username: Option<String>,
    pub password: Option<String>,
    pub confirm: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FundingForm {
    pub deposit: Option<String>,
    #[serde(rename = "deposit-submit")]
    pub deposit_submit: Option<String>,
    pub withdrawal: Option<String>,
    #[serde(rename = "withdrawal-submit")]
    pub withdrawal_submit: Option<String>,
}
