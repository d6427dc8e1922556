//! Position and ledger store.
//!
//! The [`Ledger`] is the single writer of cash and positions. Every mutation
//! goes through [`Ledger::apply_trade`], which checks the whole trade before
//! touching any state, so a rejected trade leaves cash, positions and the
//! trade log exactly as they were.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PortfolioError, PortfolioResult};
use crate::models::{PortfolioSnapshot, Position, PositionValuation, TradeEvent, TradeSide};

/// Tolerance when comparing a buy's cost against available cash.
pub const CASH_EPSILON: Decimal = dec!(0.00000001);

/// Cash, open positions and the append-only trade log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    initial_cash: Decimal,
    cash: Decimal,
    positions: BTreeMap<String, Position>,
    trades: Vec<TradeEvent>,
    realized_pnl: Decimal,
}

impl Ledger {
    pub fn new(initial_cash: Decimal) -> PortfolioResult<Self> {
        if initial_cash < Decimal::ZERO {
            return Err(PortfolioError::Configuration(format!(
                "initial cash must not be negative, got {}",
                initial_cash
            )));
        }

        Ok(Self {
            initial_cash,
            cash: initial_cash,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            realized_pnl: Decimal::ZERO,
        })
    }

    /// Rebuild a ledger by re-applying a persisted trade log in order.
    ///
    /// Event ids, timestamps and prices are preserved. Fails on the first
    /// event the rebuilt state cannot accept.
    pub fn replay(initial_cash: Decimal, events: &[TradeEvent]) -> PortfolioResult<Self> {
        let mut ledger = Self::new(initial_cash)?;
        for event in events {
            ledger.apply(
                event.id,
                event.timestamp,
                &event.ticker,
                event.side,
                event.quantity,
                event.price,
            )?;
        }
        debug!(events = events.len(), cash = %ledger.cash, "Replayed trade log");
        Ok(ledger)
    }

    /// Apply a trade now.
    pub fn apply_trade(
        &mut self,
        ticker: &str,
        side: TradeSide,
        quantity: Decimal,
        price: Decimal,
    ) -> PortfolioResult<TradeEvent> {
        self.apply_trade_at(ticker, side, quantity, price, Utc::now())
    }

    /// Apply a trade stamped with the given time (backtests use market dates).
    pub fn apply_trade_at(
        &mut self,
        ticker: &str,
        side: TradeSide,
        quantity: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> PortfolioResult<TradeEvent> {
        self.apply(Uuid::new_v4(), timestamp, ticker, side, quantity, price)
    }

    fn apply(
        &mut self,
        id: Uuid,
        timestamp: DateTime<Utc>,
        ticker: &str,
        side: TradeSide,
        quantity: Decimal,
        price: Decimal,
    ) -> PortfolioResult<TradeEvent> {
        let ticker = ticker.trim().to_uppercase();
        if ticker.is_empty() {
            return Err(PortfolioError::InvalidTrade("empty ticker".to_string()));
        }
        if quantity <= Decimal::ZERO {
            return Err(PortfolioError::InvalidTrade(format!(
                "quantity must be positive, got {}",
                quantity
            )));
        }
        if price <= Decimal::ZERO {
            return Err(PortfolioError::InvalidTrade(format!(
                "price must be positive, got {}",
                price
            )));
        }

        let notional = quantity.checked_mul(price).ok_or_else(|| {
            PortfolioError::InvalidTrade(format!(
                "{} shares at {} is out of range",
                quantity, price
            ))
        })?;

        // Checks above, mutation below.
        let realized_pnl = match side {
            TradeSide::Buy => {
                if notional > self.cash + CASH_EPSILON {
                    return Err(PortfolioError::InsufficientCash {
                        required: notional,
                        available: self.cash,
                    });
                }

                self.cash = (self.cash - notional).max(Decimal::ZERO);
                self.positions
                    .entry(ticker.clone())
                    .and_modify(|p| p.add(quantity, price))
                    .or_insert_with(|| Position::new(ticker.clone(), quantity, price));
                None
            }
            TradeSide::Sell => {
                let held = self
                    .positions
                    .get(&ticker)
                    .map(|p| p.quantity)
                    .unwrap_or(Decimal::ZERO);
                if quantity > held {
                    return Err(PortfolioError::InsufficientShares {
                        ticker,
                        requested: quantity,
                        held,
                    });
                }
                let cash_after = self.cash.checked_add(notional).ok_or_else(|| {
                    PortfolioError::InvalidTrade(format!("sale proceeds {} overflow cash", notional))
                })?;

                let mut closed = false;
                let mut pnl = Decimal::ZERO;
                if let Some(position) = self.positions.get_mut(&ticker) {
                    pnl = position.reduce(quantity, price);
                    closed = position.is_closed();
                }
                if closed {
                    self.positions.remove(&ticker);
                }

                self.cash = cash_after;
                self.realized_pnl += pnl;
                Some(pnl)
            }
        };

        let event = TradeEvent {
            id,
            timestamp,
            ticker,
            side,
            quantity,
            price,
            realized_pnl,
        };

        debug!(
            ticker = %event.ticker,
            side = %event.side,
            quantity = %event.quantity,
            price = %event.price,
            cash = %self.cash,
            "Trade applied"
        );

        self.trades.push(event.clone());
        Ok(event)
    }

    /// Mark the ledger to market.
    ///
    /// Positions without a price are valued at average cost and flagged stale.
    pub fn get_snapshot(&self, prices: &HashMap<String, Decimal>) -> PortfolioSnapshot {
        self.get_snapshot_at(prices, Utc::now())
    }

    pub fn get_snapshot_at(
        &self,
        prices: &HashMap<String, Decimal>,
        timestamp: DateTime<Utc>,
    ) -> PortfolioSnapshot {
        let mut positions = Vec::with_capacity(self.positions.len());
        let mut unrealized_pnl_by_ticker = BTreeMap::new();

        for (ticker, position) in &self.positions {
            let (price, stale) = match prices.get(ticker) {
                Some(p) if *p > Decimal::ZERO => (*p, false),
                _ => (position.average_cost, true),
            };

            let unrealized = position.unrealized_pnl(price);
            unrealized_pnl_by_ticker.insert(ticker.clone(), unrealized);

            positions.push(PositionValuation {
                ticker: ticker.clone(),
                quantity: position.quantity,
                average_cost: position.average_cost,
                price,
                market_value: position.market_value(price),
                unrealized_pnl: unrealized,
                unrealized_return: position.unrealized_return(price),
                stale,
            });
        }

        let positions_value: Decimal = positions.iter().map(|p| p.market_value).sum();

        PortfolioSnapshot {
            timestamp,
            total_value: self.cash + positions_value,
            cash: self.cash,
            positions,
            unrealized_pnl_by_ticker,
            realized_pnl_cumulative: self.realized_pnl,
        }
    }

    pub fn get_trade_log(&self) -> &[TradeEvent] {
        &self.trades
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn initial_cash(&self) -> Decimal {
        self.initial_cash
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn position(&self, ticker: &str) -> Option<&Position> {
        self.positions.get(&ticker.trim().to_uppercase())
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn tickers(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }
}
