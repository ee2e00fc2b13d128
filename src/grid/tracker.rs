//! Position tracking for the grid symbol

use log::{debug, info, warn};
use serde::Serialize;

use super::config::GridConfig;
use super::errors::GridResult;
use super::executor::EngineContext;
use super::types::{ExchangePosition, GridLevel, OrderSide, Position, PositionSide};

const FLAT_EPSILON: f64 = 1e-12;

/// Apply a fill to a position, returning the pnl it realized
///
/// Adding to the position moves the entry to the weighted average. Reducing
/// realizes pnl against the entry; a fill larger than the position flips it
/// and the remainder opens at the fill price.
pub fn apply_fill(position: &mut Position, side: OrderSide, price: f64, qty: f64) -> f64 {
    let current = position.signed_size();
    let delta = side.sign() * qty;
    let next = current + delta;

    let realized = if current.abs() < FLAT_EPSILON || current.signum() == delta.signum() {
        let size = current.abs() + qty;
        position.entry_price = (position.entry_price * current.abs() + price * qty) / size;
        0.0
    } else {
        let closed = qty.min(current.abs());
        let pnl = (price - position.entry_price) * closed * current.signum();
        if next.abs() > FLAT_EPSILON && next.signum() != current.signum() {
            position.entry_price = price;
        }
        pnl
    };

    if next.abs() < FLAT_EPSILON {
        position.side = PositionSide::Flat;
        position.size = 0.0;
        position.entry_price = 0.0;
    } else {
        position.side = if next > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        position.size = next.abs();
    }
    position.realized_pnl += realized;
    realized
}

/// Pnl and fee totals for the running cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CycleTotals {
    pub realized_pnl: f64,
    pub fees: f64,
    pub fills: u64,
}

/// Owns the engine's view of the net position
#[derive(Debug, Clone)]
pub struct PositionTracker {
    symbol: String,
    position: Position,
    cycle: CycleTotals,
    fee_rate: f64,
    size_tolerance: f64,
}

impl PositionTracker {
    pub fn new(config: &GridConfig) -> Self {
        Self {
            symbol: config.symbol.clone(),
            position: Position::default(),
            cycle: CycleTotals::default(),
            fee_rate: config.fee_rate,
            size_tolerance: config.precision.amount_epsilon(),
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn cycle(&self) -> CycleTotals {
        self.cycle
    }

    /// Account a confirmed fill of `level`
    ///
    /// A zero fee is replaced by the configured fee-rate estimate.
    pub fn on_fill(&mut self, level: &GridLevel, price: f64, qty: f64, fee: f64) -> f64 {
        let fee = if fee > 0.0 {
            fee
        } else {
            price * qty * self.fee_rate
        };
        let realized = apply_fill(&mut self.position, level.side, price, qty);
        self.cycle.realized_pnl += realized;
        self.cycle.fees += fee;
        self.cycle.fills += 1;
        debug!(
            "{} {} {} @ {} -> position {:+} @ {:.4}, realized {:.4}",
            self.symbol,
            level.side,
            qty,
            price,
            self.position.signed_size(),
            self.position.entry_price,
            realized
        );
        realized
    }

    /// Overwrite local state with the exchange's position
    ///
    /// Returns true when the local view had drifted.
    pub fn reconcile(&mut self, external: Option<&ExchangePosition>) -> bool {
        let (side, size, entry) = match external {
            Some(p) if p.size > FLAT_EPSILON => (p.side, p.size, p.entry_price),
            _ => (PositionSide::Flat, 0.0, 0.0),
        };
        let signed = match side {
            PositionSide::Long => size,
            PositionSide::Short => -size,
            PositionSide::Flat => 0.0,
        };
        let drift = (self.position.signed_size() - signed).abs();
        let drifted = drift > self.size_tolerance;
        if drifted {
            warn!(
                "Position drift on {}: local {:+} @ {:.4}, exchange {:+} @ {:.4}",
                self.symbol,
                self.position.signed_size(),
                self.position.entry_price,
                signed,
                entry
            );
        }
        self.position.side = side;
        self.position.size = size;
        self.position.entry_price = entry;
        if let Some(p) = external {
            self.position.unrealized_pnl = p.unrealized_pnl;
        }
        drifted
    }

    /// Fetch the exchange position and reconcile against it
    pub async fn refresh(&mut self, ctx: &EngineContext) -> GridResult<bool> {
        let exchange = ctx.exchange.clone();
        let symbols = vec![ctx.symbol().to_string()];
        let positions = ctx
            .retry
            .run("get_positions", || {
                let exchange = exchange.clone();
                let symbols = symbols.clone();
                async move { exchange.get_positions(Some(&symbols)).await }
            })
            .await?;
        let external = positions.iter().find(|p| p.symbol == self.symbol);
        Ok(self.reconcile(external))
    }

    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        if self.position.is_flat() {
            return 0.0;
        }
        (mark_price - self.position.entry_price) * self.position.signed_size()
    }

    /// Cycle pnl net of fees, marked at `mark_price`
    pub fn capital_delta(&self, mark_price: f64) -> f64 {
        self.cycle.realized_pnl - self.cycle.fees + self.unrealized_pnl(mark_price)
    }

    /// Price at which closing the position makes the cycle flat
    pub fn break_even_price(&self) -> Option<f64> {
        if self.position.is_flat() {
            return None;
        }
        let offset = self.cycle.realized_pnl / self.position.size;
        match self.position.side {
            PositionSide::Long => Some(self.position.entry_price - offset),
            PositionSide::Short => Some(self.position.entry_price + offset),
            PositionSide::Flat => None,
        }
    }

    /// Start a new cycle after a reset
    pub fn reset_cycle(&mut self) {
        info!(
            "Cycle closed on {}: realized {:.4}, fees {:.4}, {} fills",
            self.symbol, self.cycle.realized_pnl, self.cycle.fees, self.cycle.fills
        );
        self.cycle = CycleTotals::default();
        self.position.realized_pnl = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::types::LevelRole;

    fn tracker() -> PositionTracker {
        let mut config = GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0);
        config.fee_rate = 0.0;
        PositionTracker::new(&config)
    }

    fn level(side: OrderSide) -> GridLevel {
        GridLevel::new(1, 100.0, side, 1.0, LevelRole::Entry)
    }

    #[test]
    fn test_weighted_average_entry() {
        let mut t = tracker();
        t.on_fill(&level(OrderSide::Buy), 100.0, 1.0, 0.0);
        t.on_fill(&level(OrderSide::Buy), 90.0, 3.0, 0.0);
        assert_eq!(t.position().side, PositionSide::Long);
        assert_eq!(t.position().size, 4.0);
        assert!((t.position().entry_price - 92.5).abs() < 1e-9);
    }

    #[test]
    fn test_reducing_fill_realizes_pnl() {
        let mut t = tracker();
        t.on_fill(&level(OrderSide::Buy), 100.0, 2.0, 0.0);
        let realized = t.on_fill(&level(OrderSide::Sell), 110.0, 1.0, 0.0);
        assert!((realized - 10.0).abs() < 1e-9);
        assert_eq!(t.position().size, 1.0);
        assert_eq!(t.position().entry_price, 100.0);
        assert!((t.capital_delta(100.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_flip_opens_at_fill_price() {
        let mut position = Position::default();
        apply_fill(&mut position, OrderSide::Sell, 50.0, 1.0);
        let realized = apply_fill(&mut position, OrderSide::Buy, 40.0, 3.0);
        assert!((realized - 10.0).abs() < 1e-9);
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.size, 2.0);
        assert_eq!(position.entry_price, 40.0);
    }

    #[test]
    fn test_break_even_includes_cycle_profit() {
        let mut t = tracker();
        t.on_fill(&level(OrderSide::Buy), 100.0, 1.0, 0.0);
        t.on_fill(&level(OrderSide::Sell), 110.0, 1.0, 0.0);
        t.on_fill(&level(OrderSide::Buy), 100.0, 2.0, 0.0);
        // 10 of realized profit spread over 2 units
        assert_eq!(t.break_even_price(), Some(95.0));
    }

    #[test]
    fn test_fee_estimate_when_missing() {
        let mut config = GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0);
        config.fee_rate = 0.001;
        let mut t = PositionTracker::new(&config);
        t.on_fill(&level(OrderSide::Buy), 100.0, 2.0, 0.0);
        assert!((t.cycle().fees - 0.2).abs() < 1e-9);
        t.on_fill(&level(OrderSide::Buy), 100.0, 1.0, 0.05);
        assert!((t.cycle().fees - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_reconcile_overwrites_and_reports_drift() {
        let mut t = tracker();
        t.on_fill(&level(OrderSide::Buy), 100.0, 1.0, 0.0);
        let external = ExchangePosition {
            symbol: "BTC".into(),
            side: PositionSide::Long,
            size: 1.0,
            entry_price: 100.0,
            unrealized_pnl: 0.0,
        };
        assert!(!t.reconcile(Some(&external)));

        let external = ExchangePosition {
            size: 3.0,
            entry_price: 95.0,
            ..external
        };
        assert!(t.reconcile(Some(&external)));
        assert_eq!(t.position().size, 3.0);
        assert_eq!(t.position().entry_price, 95.0);

        assert!(t.reconcile(None));
        assert!(t.position().is_flat());
    }
}
