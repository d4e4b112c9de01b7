// src/db.rs
use crate::error::{AppError, Result};
use crate::models::{Transaction, User, UserId};
use chrono::Utc;
use log::{info, warn};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    hash     TEXT NOT NULL,
    cash     TEXT NOT NULL              -- exact decimal, never REAL
);

CREATE TABLE IF NOT EXISTS transactions (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    symbol  TEXT NOT NULL CHECK (symbol <> ''),
    price   TEXT NOT NULL,
    shares  INTEGER NOT NULL CHECK (shares <> 0),
    time    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_user_symbol
    ON transactions (user_id, symbol);
"#;

/// The ledger store: users with their cash balance plus the append-only
/// transactions table.
///
/// A single connection sits behind an async mutex, so ledger mutations are
/// serialized. Each mutation also runs inside an immediate SQLite transaction
/// and re-reads the balance it validates against, so a check and its write can
/// never be split by another request.
pub struct Ledger {
    connection: Mutex<Connection>,
}

impl Ledger {
    pub async fn init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let ledger = Self::with_connection(conn)?;
        info!("Ledger opened at {}", path.display());
        Ok(ledger)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Ledger {
            connection: Mutex::new(conn),
        })
    }

    async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self.connection.lock().await;
        f(&*conn)
    }

    /// Runs `f` in an immediate transaction. An `Err` from `f` drops the
    /// transaction, which rolls it back.
    async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let mut conn = self.connection.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub async fn create_user(&self, username: &str, hash: &str, cash: Decimal) -> Result<UserId> {
        self.write(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (username, hash, cash) VALUES (?1, ?2, ?3)",
                params![username, hash, cash.to_string()],
            );
            match inserted {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(AppError::Conflict("username taken".to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn find_user(&self, username: &str) -> Result<Option<User>> {
        self.read(|conn| {
            let user = conn
                .query_row(
                    "SELECT id, username, hash, cash FROM users WHERE username = ?1",
                    [username],
                    |row| {
                        Ok(User {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            hash: row.get(2)?,
                            cash: decimal_column(row, 3)?,
                        })
                    },
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    pub async fn cash(&self, user_id: UserId) -> Result<Decimal> {
        self.read(|conn| load_cash(conn, user_id)).await
    }

    /// Net shares of `symbol` held by the user. Zero when never traded.
    pub async fn holding(&self, user_id: UserId, symbol: &str) -> Result<i64> {
        self.read(|conn| load_holding(conn, user_id, symbol)).await
    }

    /// Net position per symbol, fully sold symbols excluded.
    pub async fn holdings(&self, user_id: UserId) -> Result<Vec<(String, i64)>> {
        self.read(|conn| load_holdings(conn, user_id)).await
    }

    /// Open positions and cash read under one lock, so both come from the
    /// same ledger state.
    pub async fn positions(&self, user_id: UserId) -> Result<(Vec<(String, i64)>, Decimal)> {
        self.read(|conn| Ok((load_holdings(conn, user_id)?, load_cash(conn, user_id)?)))
            .await
    }

    /// Every transaction of the user, oldest first.
    pub async fn history(&self, user_id: UserId) -> Result<Vec<Transaction>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, symbol, price, shares, time FROM transactions
                 WHERE user_id = ?1
                 ORDER BY time, id",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(Transaction {
                        id: row.get(0)?,
                        symbol: row.get(1)?,
                        price: decimal_column(row, 2)?,
                        shares: row.get(3)?,
                        time: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Appends a trade and moves the matching cash in one transaction.
    ///
    /// A buy (`signed_shares > 0`) must be covered by the current balance; a
    /// sell must not exceed the current holding. Returns the new balance.
    pub async fn apply_trade(
        &self,
        user_id: UserId,
        symbol: &str,
        price: Decimal,
        signed_shares: i64,
    ) -> Result<Decimal> {
        if symbol.is_empty() {
            return Err(AppError::Validation("Missing stock symbol".to_string()));
        }
        if price <= Decimal::ZERO {
            return Err(AppError::Validation(format!("Invalid price {}", price)));
        }
        if signed_shares == 0 {
            return Err(AppError::Validation("Invalid shares amount".to_string()));
        }
        let count = signed_shares.unsigned_abs();
        let notional = price
            .checked_mul(Decimal::from(count))
            .ok_or_else(|| AppError::Validation("Invalid shares amount".to_string()))?;

        self.write(|conn| {
            let cash = load_cash(conn, user_id)?;
            let new_cash = if signed_shares > 0 {
                if cash < notional {
                    return Err(AppError::InsufficientFunds {
                        needed: notional,
                        available: cash,
                    });
                }
                cash - notional
            } else {
                let held = load_holding(conn, user_id, symbol)?;
                if held <= 0 {
                    return Err(AppError::NotOwned(symbol.to_string()));
                }
                if count > held.unsigned_abs() {
                    return Err(AppError::InsufficientShares {
                        symbol: symbol.to_string(),
                        requested: -signed_shares,
                        held,
                    });
                }
                cash.checked_add(notional)
                    .ok_or_else(|| AppError::Internal("cash balance overflow".to_string()))?
            };

            conn.execute(
                "INSERT INTO transactions (user_id, symbol, price, shares, time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, symbol, price.to_string(), signed_shares, Utc::now()],
            )?;
            store_cash(conn, user_id, new_cash)?;
            Ok(new_cash)
        })
        .await
    }

    /// Adds `delta` to the user's cash (negative for a withdrawal) unless the
    /// balance would drop below zero. Returns the new balance.
    pub async fn adjust_cash(&self, user_id: UserId, delta: Decimal) -> Result<Decimal> {
        self.write(|conn| {
            let cash = load_cash(conn, user_id)?;
            let new_cash = cash
                .checked_add(delta)
                .ok_or_else(|| AppError::Validation("amount too large".to_string()))?;
            if new_cash < Decimal::ZERO {
                return Err(AppError::InsufficientFunds {
                    needed: -delta,
                    available: cash,
                });
            }
            store_cash(conn, user_id, new_cash)?;
            Ok(new_cash)
        })
        .await
    }
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn load_cash(conn: &Connection, user_id: UserId) -> Result<Decimal> {
    conn.query_row("SELECT cash FROM users WHERE id = ?1", [user_id], |row| {
        decimal_column(row, 0)
    })
    .optional()?
    .ok_or_else(|| AppError::Internal(format!("user {} not found", user_id)))
}

fn load_holdings(conn: &Connection, user_id: UserId) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT symbol, SUM(shares) AS net FROM transactions
         WHERE user_id = ?1
         GROUP BY symbol
         HAVING net <> 0
         ORDER BY symbol",
    )?;
    let rows = stmt
        .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
    Ok(rows)
}

fn load_holding(conn: &Connection, user_id: UserId, symbol: &str) -> Result<i64> {
    let held = conn.query_row(
        "SELECT COALESCE(SUM(shares), 0) FROM transactions WHERE user_id = ?1 AND symbol = ?2",
        params![user_id, symbol],
        |row| row.get(0),
    )?;
    Ok(held)
}

fn store_cash(conn: &Connection, user_id: UserId, cash: Decimal) -> Result<()> {
    let updated = conn.execute(
        "UPDATE users SET cash = ?1 WHERE id = ?2",
        params![cash.to_string(), user_id],
    )?;
    if updated != 1 {
        warn!("Cash update for user {} touched {} rows", user_id, updated);
        return Err(AppError::Internal(format!(
            "cash update for user {} failed",
            user_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn ledger_with_user(cash: Decimal) -> (Ledger, UserId) {
        let ledger = Ledger::in_memory().await.expect("in-memory ledger");
        let id = ledger
            .create_user("alice", "hash", cash)
            .await
            .expect("create user");
        (ledger, id)
    }

    #[tokio::test]
    async fn duplicate_username_is_a_conflict() {
        let (ledger, _) = ledger_with_user(dec!(100)).await;
        let err = ledger
            .create_user("alice", "other", dec!(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let user = ledger.find_user("alice").await.unwrap().unwrap();
        assert_eq!(user.hash, "hash");
        assert_eq!(user.cash, dec!(100));
    }

    #[tokio::test]
    async fn buy_debits_cash_and_records_row() {
        let (ledger, id) = ledger_with_user(dec!(1000.00)).await;
        let cash = ledger.apply_trade(id, "AAPL", dec!(123.45), 3).await.unwrap();
        assert_eq!(cash, dec!(629.65));
        assert_eq!(ledger.cash(id).await.unwrap(), dec!(629.65));
        assert_eq!(ledger.holding(id, "AAPL").await.unwrap(), 3);

        let history = ledger.history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].price, dec!(123.45));
        assert_eq!(history[0].shares, 3);
    }

    #[tokio::test]
    async fn rejected_buy_leaves_ledger_untouched() {
        let (ledger, id) = ledger_with_user(dec!(100)).await;
        let err = ledger.apply_trade(id, "AAPL", dec!(50.01), 2).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { .. }));
        assert_eq!(ledger.cash(id).await.unwrap(), dec!(100));
        assert!(ledger.history(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sell_checks_holding() {
        let (ledger, id) = ledger_with_user(dec!(100)).await;
        let err = ledger.apply_trade(id, "MSFT", dec!(10), -1).await.unwrap_err();
        assert!(matches!(err, AppError::NotOwned(ref s) if s == "MSFT"));

        ledger.apply_trade(id, "MSFT", dec!(10), 4).await.unwrap();
        let err = ledger.apply_trade(id, "MSFT", dec!(10), -5).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InsufficientShares { requested: 5, held: 4, .. }
        ));
        assert_eq!(ledger.cash(id).await.unwrap(), dec!(60));

        let cash = ledger.apply_trade(id, "MSFT", dec!(12.5), -4).await.unwrap();
        assert_eq!(cash, dec!(110.0));
        assert_eq!(ledger.holding(id, "MSFT").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn holdings_skip_closed_positions() {
        let (ledger, id) = ledger_with_user(dec!(1000)).await;
        ledger.apply_trade(id, "AAPL", dec!(10), 2).await.unwrap();
        ledger.apply_trade(id, "GOOG", dec!(20), 1).await.unwrap();
        ledger.apply_trade(id, "GOOG", dec!(20), -1).await.unwrap();

        let holdings = ledger.holdings(id).await.unwrap();
        assert_eq!(holdings, vec![("AAPL".to_string(), 2)]);
        assert_eq!(ledger.history(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn positions_pair_holdings_with_cash() {
        let (ledger, id) = ledger_with_user(dec!(100)).await;
        ledger.apply_trade(id, "AAPL", dec!(10), 3).await.unwrap();
        ledger.adjust_cash(id, dec!(5.5)).await.unwrap();

        let (holdings, cash) = ledger.positions(id).await.unwrap();
        assert_eq!(holdings, vec![("AAPL".to_string(), 3)]);
        assert_eq!(cash, dec!(75.5));
        assert_eq!(holdings, ledger.holdings(id).await.unwrap());
        assert_eq!(cash, ledger.cash(id).await.unwrap());
    }

    #[tokio::test]
    async fn history_is_in_insertion_order() {
        let (ledger, id) = ledger_with_user(dec!(1000)).await;
        for symbol in ["C", "A", "B"] {
            ledger.apply_trade(id, symbol, dec!(1), 1).await.unwrap();
        }
        let symbols: Vec<_> = ledger
            .history(id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.symbol)
            .collect();
        assert_eq!(symbols, ["C", "A", "B"]);
    }

    #[tokio::test]
    async fn trade_rows_must_be_well_formed() {
        let (ledger, id) = ledger_with_user(dec!(1000)).await;
        for (symbol, price, shares) in [("", dec!(1), 1), ("X", dec!(0), 1), ("X", dec!(1), 0)] {
            let err = ledger.apply_trade(id, symbol, price, shares).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
        assert!(ledger.history(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn withdrawal_cannot_overdraw() {
        let (ledger, id) = ledger_with_user(dec!(10.00)).await;
        let err = ledger.adjust_cash(id, dec!(-10.01)).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { .. }));
        assert_eq!(ledger.adjust_cash(id, dec!(-10.00)).await.unwrap(), dec!(0));
        assert_eq!(ledger.adjust_cash(id, dec!(0.10)).await.unwrap(), dec!(0.10));
    }

    #[tokio::test]
    async fn unknown_user_is_internal() {
        let ledger = Ledger::in_memory().await.unwrap();
        let err = ledger.adjust_cash(42, dec!(1)).await.unwrap_err();
        assert!(err.is_internal());
    }
}
