//! Grid reset: the only path that replaces the grid state wholesale

use log::{info, warn};
use serde::Serialize;

use super::errors::{GridError, GridResult};
use super::executor::EngineContext;
use super::order_ops::OrderOperations;
use super::state::{GridMode, GridState};
use super::strategy::GridStrategyEngine;
use super::tracker::PositionTracker;

/// Why a reset was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResetReason {
    ScalpingTakeProfit,
    CapitalRecovered,
    TakeProfit,
    /// Stop-loss fired on a cycle earning at least the APR threshold
    StopLoss,
    /// Scalping exited on a rebound; the position is kept
    ScalpingRebound,
}

impl ResetReason {
    /// Whether the reset flattens the position and closes the cycle
    pub fn closes_position(&self) -> bool {
        !matches!(self, ResetReason::ScalpingRebound)
    }
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResetReason::ScalpingTakeProfit => "scalping take-profit filled",
            ResetReason::CapitalRecovered => "capital protection recovered",
            ResetReason::TakeProfit => "take-profit target reached",
            ResetReason::StopLoss => "stop-loss with the cycle above the APR threshold",
            ResetReason::ScalpingRebound => "price rebounded above the scalping trigger",
        };
        f.write_str(s)
    }
}

/// Result of a completed reset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResetOutcome {
    /// Collateral the new cycle starts from; None when the cycle carries on
    pub initial_capital: Option<f64>,
    pub price: f64,
}

pub struct GridResetManager {
    ctx: EngineContext,
    in_flight: bool,
    completed: u32,
}

impl GridResetManager {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            in_flight: false,
            completed: 0,
        }
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Cancel everything, flatten, and start a fresh cycle at the current price
    ///
    /// A reason that keeps the position only cancels and re-places the
    /// ladder, carrying the cycle totals over. On failure the state keeps its triggering mode (or Resetting, if the
    /// flattening already succeeded) so the caller can retry.
    pub async fn reset(
        &mut self,
        reason: ResetReason,
        state: &mut GridState,
        ops: &OrderOperations,
        tracker: &mut PositionTracker,
        strategy: &GridStrategyEngine,
    ) -> GridResult<ResetOutcome> {
        if self.in_flight {
            return Err(GridError::ProtectionInvariantViolation(
                "reset requested while another reset is in flight".into(),
            ));
        }
        let mode = state.mode();
        if !mode.is_protective() && mode != GridMode::Resetting {
            return Err(GridError::ProtectionInvariantViolation(format!(
                "reset requested from {} mode",
                mode
            )));
        }

        self.in_flight = true;
        let result = self.run(reason, state, ops, tracker, strategy).await;
        self.in_flight = false;
        if result.is_ok() {
            self.completed += 1;
        }
        result
    }

    async fn run(
        &mut self,
        reason: ResetReason,
        state: &mut GridState,
        ops: &OrderOperations,
        tracker: &mut PositionTracker,
        strategy: &GridStrategyEngine,
    ) -> GridResult<ResetOutcome> {
        warn!("Resetting grid on {}: {}", self.ctx.symbol(), reason);

        let closes = reason.closes_position();
        if state.mode() != GridMode::Resetting {
            if closes {
                self.close_out(state, ops, tracker).await?;
            } else {
                ops.cancel_all(state).await?;
            }
            state.mode.transition(GridMode::Resetting)?;
        }

        let initial_capital = if closes {
            Some(self.ctx.fetch_collateral().await?)
        } else {
            None
        };
        let price = self.ctx.fetch_price().await?;
        let (layout, ladder) = strategy.compute(price)?;
        let mut next = state.next_cycle(layout, Vec::new());
        next.last_price = Some(price);
        next.mode.transition(GridMode::Normal)?;
        if closes {
            tracker.reset_cycle();
        } else {
            next.cycle_started_at = state.cycle_started_at;
        }
        *state = next;

        let report = ops.sync(state, ladder).await?;
        info!(
            "Grid on {} restarted at {} with [{}, {}]: {} orders placed, position {:+}",
            self.ctx.symbol(),
            price,
            state.layout.lower,
            state.layout.upper,
            report.placed,
            tracker.position().signed_size()
        );
        Ok(ResetOutcome {
            initial_capital,
            price,
        })
    }

    /// Cancel every grid order and market-close the position, verifying it is flat
    pub async fn close_out(
        &self,
        state: &mut GridState,
        ops: &OrderOperations,
        tracker: &mut PositionTracker,
    ) -> GridResult<()> {
        ops.cancel_all(state).await?;
        tracker.refresh(&self.ctx).await?;
        ops.close_position(tracker.position()).await?;
        tracker.refresh(&self.ctx).await?;
        if !tracker.position().is_flat() {
            return Err(GridError::ReconciliationMismatch(format!(
                "position on {} still open after close: {:+}",
                self.ctx.symbol(),
                tracker.position().signed_size()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::grid::config::GridConfig;
    use crate::grid::executor::GridExchange;
    use crate::grid::paper::{PaperExchange, PaperSettings};
    use crate::grid::retry::RetryPolicy;
    use crate::grid::types::{LevelState, OrderRequest, OrderSide};

    struct Fixture {
        exchange: Arc<PaperExchange>,
        ctx: EngineContext,
        ops: OrderOperations,
        tracker: PositionTracker,
        strategy: GridStrategyEngine,
        state: GridState,
    }

    async fn fixture() -> Fixture {
        let config = GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0);
        let exchange = Arc::new(PaperExchange::new("BTC", 195.0, PaperSettings::default()));
        let ctx = EngineContext::new(exchange.clone(), config, RetryPolicy::immediate(2));
        let strategy = GridStrategyEngine::new(ctx.config.clone());
        let ops = OrderOperations::new(ctx.clone(), 4);
        let tracker = PositionTracker::new(&ctx.config);
        let (layout, ladder) = strategy.compute(195.0).unwrap();
        let mut state = GridState::new(layout, Vec::new());
        ops.sync(&mut state, ladder).await.unwrap();
        Fixture {
            exchange,
            ctx,
            ops,
            tracker,
            strategy,
            state,
        }
    }

    #[tokio::test]
    async fn test_reset_flattens_and_rebuilds() {
        let mut f = fixture().await;
        f.exchange
            .create_order(&OrderRequest::market("BTC", OrderSide::Buy, 3.0))
            .await
            .unwrap();
        f.state.mode.transition(GridMode::TakeProfit).unwrap();

        let mut manager = GridResetManager::new(f.ctx.clone());
        let outcome = manager
            .reset(ResetReason::TakeProfit, &mut f.state, &f.ops, &mut f.tracker, &f.strategy)
            .await
            .unwrap();

        assert_eq!(outcome.price, 195.0);
        assert!(f.exchange.position().await.is_flat());
        assert_eq!(f.state.mode(), GridMode::Normal);
        let modes: Vec<(GridMode, GridMode)> =
            f.state.mode.history().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            modes,
            vec![
                (GridMode::Normal, GridMode::TakeProfit),
                (GridMode::TakeProfit, GridMode::Resetting),
                (GridMode::Resetting, GridMode::Normal)
            ]
        );
        assert!(f.state.levels.iter().all(|l| l.state == LevelState::Placed));
        assert_eq!(manager.completed(), 1);
    }

    #[tokio::test]
    async fn test_failed_reset_keeps_triggering_mode() {
        let mut f = fixture().await;
        f.state.mode.transition(GridMode::Scalping).unwrap();
        f.exchange.fail_next_calls(2).await;

        let mut manager = GridResetManager::new(f.ctx.clone());
        let err = manager
            .reset(
                ResetReason::ScalpingTakeProfit,
                &mut f.state,
                &f.ops,
                &mut f.tracker,
                &f.strategy,
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.state.mode(), GridMode::Scalping);

        manager
            .reset(
                ResetReason::ScalpingTakeProfit,
                &mut f.state,
                &f.ops,
                &mut f.tracker,
                &f.strategy,
            )
            .await
            .unwrap();
        assert_eq!(f.state.mode(), GridMode::Normal);
    }

    #[tokio::test]
    async fn test_reset_guards() {
        let mut f = fixture().await;
        let mut manager = GridResetManager::new(f.ctx.clone());
        let err = manager
            .reset(ResetReason::TakeProfit, &mut f.state, &f.ops, &mut f.tracker, &f.strategy)
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::ProtectionInvariantViolation(_)));

        f.state.mode.transition(GridMode::TakeProfit).unwrap();
        manager.in_flight = true;
        let err = manager
            .reset(ResetReason::TakeProfit, &mut f.state, &f.ops, &mut f.tracker, &f.strategy)
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::ProtectionInvariantViolation(_)));
        assert_eq!(f.state.mode(), GridMode::TakeProfit);
    }

    #[tokio::test]
    async fn test_rebound_reset_keeps_position_and_cycle() {
        let mut f = fixture().await;
        f.exchange
            .create_order(&OrderRequest::market("BTC", OrderSide::Buy, 3.0))
            .await
            .unwrap();
        f.tracker.refresh(&f.ctx).await.unwrap();
        let started = f.state.cycle_started_at;
        f.state.mode.transition(GridMode::Scalping).unwrap();

        let mut manager = GridResetManager::new(f.ctx.clone());
        let outcome = manager
            .reset(
                ResetReason::ScalpingRebound,
                &mut f.state,
                &f.ops,
                &mut f.tracker,
                &f.strategy,
            )
            .await
            .unwrap();

        assert_eq!(outcome.initial_capital, None);
        assert_eq!(f.state.mode(), GridMode::Normal);
        assert_eq!(f.state.cycle_started_at, started);
        assert!((f.exchange.position().await.signed_size() - 3.0).abs() < 1e-9);
        assert!((f.tracker.position().signed_size() - 3.0).abs() < 1e-9);
        assert_eq!(f.exchange.open_order_count().await, 10);
    }

    #[tokio::test]
    async fn test_close_out_flattens() {
        let mut f = fixture().await;
        f.exchange
            .create_order(&OrderRequest::market("BTC", OrderSide::Sell, 2.0))
            .await
            .unwrap();
        let manager = GridResetManager::new(f.ctx.clone());
        manager
            .close_out(&mut f.state, &f.ops, &mut f.tracker)
            .await
            .unwrap();
        assert!(f.exchange.position().await.is_flat());
        assert_eq!(f.exchange.open_order_count().await, 0);
    }
}
