// src/broker.rs
use crate::db::Ledger;
use crate::error::{AppError, Result};
use crate::models::{HoldingRow, PortfolioView, Quote, TradeReceipt, Transaction};
use crate::money::parse_amount;
use crate::oracle::PriceOracle;
use crate::session::Context;
use futures::future::try_join_all;
use log::{error, info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// The portfolio operations behind the HTTP routes. Every call takes the
/// caller's [`Context`]; nothing here reads ambient session state.
pub struct Broker {
    ledger: Arc<Ledger>,
    oracle: Arc<dyn PriceOracle>,
    oracle_timeout: Duration,
}

impl Broker {
    pub fn new(ledger: Arc<Ledger>, oracle: Arc<dyn PriceOracle>, oracle_timeout: Duration) -> Self {
        Broker {
            ledger,
            oracle,
            oracle_timeout,
        }
    }

    /// Single entry point to the oracle, so every lookup shares the timeout
    /// and the error mapping.
    async fn lookup(&self, symbol: &str) -> Result<Option<Quote>> {
        match timeout(self.oracle_timeout, self.oracle.lookup(symbol)).await {
            Ok(Ok(quote)) => Ok(quote),
            Ok(Err(e)) => {
                error!("Price lookup for {} failed: {}", symbol, e);
                Err(AppError::OracleUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "Price lookup for {} timed out after {:?}",
                    symbol, self.oracle_timeout
                );
                Err(AppError::OracleUnavailable("price lookup timed out".to_string()))
            }
        }
    }

    pub async fn quote(&self, symbol: Option<&str>) -> Result<Quote> {
        let symbol = parse_symbol(symbol)?;
        self.lookup(&symbol)
            .await?
            .ok_or_else(|| AppError::NotFound("Invalid stock symbol".to_string()))
    }

    pub async fn buy(
        &self,
        ctx: &Context,
        symbol: Option<&str>,
        shares: Option<&str>,
    ) -> Result<TradeReceipt> {
        let (symbol, shares) = parse_order(symbol, shares)?;
        let quote = self.tradable_quote(&symbol).await?;
        self.execute(ctx, quote, shares).await
    }

    pub async fn sell(
        &self,
        ctx: &Context,
        symbol: Option<&str>,
        shares: Option<&str>,
    ) -> Result<TradeReceipt> {
        let (symbol, shares) = parse_order(symbol, shares)?;
        let quote = self.tradable_quote(&symbol).await?;
        self.execute(ctx, quote, -shares).await
    }

    async fn tradable_quote(&self, symbol: &str) -> Result<Quote> {
        self.lookup(symbol)
            .await?
            .ok_or_else(|| AppError::Validation("Invalid symbol".to_string()))
    }

    async fn execute(&self, ctx: &Context, quote: Quote, signed_shares: i64) -> Result<TradeReceipt> {
        let cash = self
            .ledger
            .apply_trade(ctx.user_id, &quote.symbol, quote.price, signed_shares)
            .await?;
        // apply_trade already proved this product fits
        let total = quote.price * Decimal::from(signed_shares.unsigned_abs());
        info!(
            "User {} traded {} {} at {} (cash now {})",
            ctx.user_id, signed_shares, quote.symbol, quote.price, cash
        );
        Ok(TradeReceipt {
            symbol: quote.symbol,
            name: quote.name,
            shares: signed_shares,
            price: quote.price,
            total,
            cash,
        })
    }

    /// Current positions valued at live prices. Closed positions are left out.
    pub async fn portfolio(&self, ctx: &Context) -> Result<PortfolioView> {
        let (positions, cash) = self.ledger.positions(ctx.user_id).await?;
        let quotes = try_join_all(positions.iter().map(|(symbol, _)| self.lookup(symbol))).await?;

        let mut holdings = Vec::with_capacity(positions.len());
        for ((symbol, shares), quote) in positions.into_iter().zip(quotes) {
            let quote = quote.ok_or_else(|| {
                AppError::OracleUnavailable(format!("no price for held symbol {}", symbol))
            })?;
            let total = quote
                .price
                .checked_mul(Decimal::from(shares))
                .ok_or_else(|| AppError::Internal(format!("valuation of {} overflowed", symbol)))?;
            holdings.push(HoldingRow {
                symbol,
                name: quote.name,
                shares,
                price: quote.price,
                total,
            });
        }

        let grand_total = holdings
            .iter()
            .try_fold(cash, |acc, row| acc.checked_add(row.total))
            .ok_or_else(|| AppError::Internal("portfolio total overflowed".to_string()))?;
        Ok(PortfolioView {
            holdings,
            cash,
            grand_total,
        })
    }

    pub async fn owned_symbols(&self, ctx: &Context) -> Result<Vec<String>> {
        let holdings = self.ledger.holdings(ctx.user_id).await?;
        Ok(holdings.into_iter().map(|(symbol, _)| symbol).collect())
    }

    pub async fn history(&self, ctx: &Context) -> Result<Vec<Transaction>> {
        self.ledger.history(ctx.user_id).await
    }

    pub async fn cash(&self, ctx: &Context) -> Result<Decimal> {
        self.ledger.cash(ctx.user_id).await
    }

    /// Returns the deposited amount and the new balance.
    pub async fn deposit(&self, ctx: &Context, amount: Option<&str>) -> Result<(Decimal, Decimal)> {
        let amount = parse_amount(amount.unwrap_or_default(), "Deposit")?;
        let cash = self.ledger.adjust_cash(ctx.user_id, amount).await?;
        info!("User {} deposited {} (cash now {})", ctx.user_id, amount, cash);
        Ok((amount, cash))
    }

    /// Returns the withdrawn amount and the new balance.
    pub async fn withdraw(&self, ctx: &Context, amount: Option<&str>) -> Result<(Decimal, Decimal)> {
        let amount = parse_amount(amount.unwrap_or_default(), "Withdrawal")?;
        let cash = self.ledger.adjust_cash(ctx.user_id, -amount).await?;
        info!("User {} withdrew {} (cash now {})", ctx.user_id, amount, cash);
        Ok((amount, cash))
    }
}

fn parse_symbol(symbol: Option<&str>) -> Result<String> {
    let symbol = symbol.unwrap_or_default().trim().to_uppercase();
    if symbol.is_empty() {
        return Err(AppError::Validation("Missing stock symbol".to_string()));
    }
    Ok(symbol)
}

fn parse_order(symbol: Option<&str>, shares: Option<&str>) -> Result<(String, i64)> {
    let shares: i64 = shares
        .unwrap_or_default()
        .trim()
        .parse()
        .map_err(|_| AppError::Validation("Invalid shares".to_string()))?;
    let symbol = parse_symbol(symbol)?;
    if shares <= 0 {
        return Err(AppError::Validation("Invalid shares amount".to_string()));
    }
    Ok((symbol, shares))
}
