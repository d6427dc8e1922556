//! SQLite persistence for the paper account.
//!
//! Stores everything needed to resume after restart:
//! - The account's starting cash
//! - The append-only trade event log (replayed into a ledger on start)
//! - Snapshot history (the equity curve the risk engine reads)
//! - Emitted alerts and whether they are resolved
//!
//! Decimals are stored as text so a replayed ledger matches the original exactly.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use uuid::Uuid;

use crate::ledger::Ledger;
use crate::models::{Alert, PortfolioSnapshot, Severity, TradeEvent, TradeSide};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored trade event record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredTrade {
    id: String,
    timestamp: String,
    ticker: String,
    side: String,
    quantity: String,
    price: String,
    realized_pnl: Option<String>,
}

/// Stored alert record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredAlert {
    ticker: String,
    timestamp: String,
    movement_pct: String,
    severity: String,
    reference_price: String,
    price: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database (one connection, so every query sees the same data).
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                initial_cash TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only: rows are never updated or deleted outside a reset.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                ticker TEXT NOT NULL,
                side TEXT NOT NULL CHECK (side IN ('buy', 'sell')),
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                realized_pnl TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                total_value TEXT NOT NULL,
                cash TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                movement_pct TEXT NOT NULL,
                severity TEXT NOT NULL,
                reference_price TEXT NOT NULL,
                price TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_ticker ON alerts(ticker, resolved)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Account ====================

    /// Create the account if missing; returns the stored starting cash.
    pub async fn init_account(&self, initial_cash: Decimal) -> Result<Decimal> {
        sqlx::query("INSERT OR IGNORE INTO account (id, initial_cash) VALUES (1, ?)")
            .bind(initial_cash.to_string())
            .execute(&self.pool)
            .await?;

        self.get_initial_cash()
            .await?
            .context("Account missing after initialization")
    }

    pub async fn get_initial_cash(&self) -> Result<Option<Decimal>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT initial_cash FROM account WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(raw,)| parse_decimal(&raw)).transpose()
    }

    /// Drop all account data.
    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["account", "trade_events", "snapshots", "alerts"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Rebuild the ledger from the stored log, or `None` before `init_account`.
    pub async fn load_ledger(&self) -> Result<Option<Ledger>> {
        let Some(initial_cash) = self.get_initial_cash().await? else {
            return Ok(None);
        };
        let events = self.get_trade_events().await?;
        let ledger = Ledger::replay(initial_cash, &events).context("Stored trade log is inconsistent")?;
        Ok(Some(ledger))
    }

    // ==================== Trade Events ====================

    /// Append events in one transaction.
    pub async fn append_trades<'a>(&self, events: impl IntoIterator<Item = &'a TradeEvent>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut count = 0;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO trade_events (id, timestamp, ticker, side, quantity, price, realized_pnl)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.id.to_string())
            .bind(event.timestamp.to_rfc3339())
            .bind(&event.ticker)
            .bind(event.side.as_str())
            .bind(event.quantity.to_string())
            .bind(event.price.to_string())
            .bind(event.realized_pnl.map(|p| p.to_string()))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to append trade {}", event.id))?;
            count += 1;
        }

        tx.commit().await?;
        Ok(count)
    }

    /// Full log in append order.
    pub async fn get_trade_events(&self) -> Result<Vec<TradeEvent>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            "SELECT id, timestamp, ticker, side, quantity, price, realized_pnl FROM trade_events ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TradeEvent::try_from).collect()
    }

    // ==================== Snapshots ====================

    pub async fn save_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot).context("Failed to encode snapshot")?;

        sqlx::query("INSERT INTO snapshots (timestamp, total_value, cash, payload) VALUES (?, ?, ?, ?)")
            .bind(snapshot.timestamp.to_rfc3339())
            .bind(snapshot.total_value.to_string())
            .bind(snapshot.cash.to_string())
            .bind(payload)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Most recent `limit` snapshots, oldest first.
    pub async fn get_snapshot_history(&self, limit: i64) -> Result<Vec<PortfolioSnapshot>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT payload FROM (SELECT id, payload FROM snapshots ORDER BY id DESC LIMIT ?) ORDER BY id",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(payload,)| serde_json::from_str(&payload).context("Corrupt snapshot payload"))
            .collect()
    }

    // ==================== Alerts ====================

    /// Store an alert, resolving any earlier alert for the same ticker.
    pub async fn save_alert(&self, alert: &Alert) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE alerts SET resolved = 1 WHERE ticker = ? AND resolved = 0")
            .bind(&alert.ticker)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO alerts (ticker, timestamp, movement_pct, severity, reference_price, price)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.ticker)
        .bind(alert.timestamp.to_rfc3339())
        .bind(alert.movement_pct.to_string())
        .bind(alert.severity.as_str())
        .bind(alert.reference_price.to_string())
        .bind(alert.price.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn resolve_alert(&self, ticker: &str) -> Result<()> {
        sqlx::query("UPDATE alerts SET resolved = 1 WHERE ticker = ? AND resolved = 0")
            .bind(ticker)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unresolved alerts, one per ticker at most.
    pub async fn get_active_alerts(&self) -> Result<Vec<Alert>> {
        let rows = sqlx::query_as::<_, StoredAlert>(
            r#"
            SELECT ticker, timestamp, movement_pct, severity, reference_price, price
            FROM alerts WHERE resolved = 0 ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }

    /// Most recent alerts, newest first.
    pub async fn get_recent_alerts(&self, limit: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query_as::<_, StoredAlert>(
            r#"
            SELECT ticker, timestamp, movement_pct, severity, reference_price, price
            FROM alerts ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }
}

impl TryFrom<StoredTrade> for TradeEvent {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrade) -> Result<Self> {
        Ok(TradeEvent {
            id: Uuid::parse_str(&row.id).with_context(|| format!("Bad trade id {}", row.id))?,
            timestamp: parse_timestamp(&row.timestamp)?,
            side: TradeSide::parse(&row.side)
                .with_context(|| format!("Bad trade side {}", row.side))?,
            quantity: parse_decimal(&row.quantity)?,
            price: parse_decimal(&row.price)?,
            realized_pnl: row.realized_pnl.as_deref().map(parse_decimal).transpose()?,
            ticker: row.ticker,
        })
    }
}

impl TryFrom<StoredAlert> for Alert {
    type Error = anyhow::Error;

    fn try_from(row: StoredAlert) -> Result<Self> {
        Ok(Alert {
            timestamp: parse_timestamp(&row.timestamp)?,
            movement_pct: parse_decimal(&row.movement_pct)?,
            severity: Severity::parse(&row.severity)
                .with_context(|| format!("Bad severity {}", row.severity))?,
            reference_price: parse_decimal(&row.reference_price)?,
            price: parse_decimal(&row.price)?,
            ticker: row.ticker,
        })
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Bad decimal {}", raw))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Bad timestamp {}", raw))?
        .with_timezone(&Utc))
}
