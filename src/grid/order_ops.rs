//! Order operations: keeps the exchange's resting orders in line with the level set
//!
//! Every adapter call goes through the shared [`RetryPolicy`](super::retry::RetryPolicy).
//! Placement and cancellation run with bounded concurrency; results are
//! applied to the level set only after all calls of a batch returned.

use std::collections::{HashMap, HashSet};

use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;

use super::errors::{GridError, GridResult};
use super::executor::EngineContext;
use super::state::GridState;
use super::tracker::PositionTracker;
use super::types::{
    Fill, GridLevel, LevelKey, LevelState, Order, OrderRequest, OrderSide, Position, PositionSide,
};

const CANCEL_ALL_ATTEMPTS: u32 = 3;

/// Outcome counters of one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub placed: usize,
    pub canceled: usize,
    pub rejected: usize,
    /// Placements that exhausted retries and stay Pending
    pub deferred: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        *self == SyncReport::default()
    }
}

/// What a fill did to the level set
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// No level holds the order id
    Untracked,
    Partial(GridLevel),
    Completed(GridLevel),
}

/// Creates, cancels and accounts orders on behalf of the coordinator
#[derive(Clone)]
pub struct OrderOperations {
    ctx: EngineContext,
    max_concurrent: usize,
}

impl OrderOperations {
    pub fn new(ctx: EngineContext, max_concurrent: usize) -> Self {
        Self {
            ctx,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Bring the level set to `target`
    ///
    /// Live levels missing from the target are cancelled, target levels
    /// without a live counterpart are inserted as Pending, and every Pending
    /// level gets a create-order call.
    pub async fn sync(&self, state: &mut GridState, target: Vec<GridLevel>) -> GridResult<SyncReport> {
        let decimals = state.layout.price_decimals;
        let wanted: HashSet<LevelKey> = target.iter().map(|l| l.key(decimals)).collect();

        let stale: Vec<usize> = state
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_live() && !wanted.contains(&l.key(decimals)))
            .map(|(i, _)| i)
            .collect();
        let mut report = SyncReport {
            canceled: self.cancel_indices(state, stale).await?,
            ..SyncReport::default()
        };

        for level in target {
            if state.live_level_by_key(&level.key(decimals)).is_none() {
                state.insert_level(level);
            }
        }

        let placement = self.place_pending(state).await?;
        report.placed = placement.placed;
        report.rejected = placement.rejected;
        report.deferred = placement.deferred;
        if !report.is_noop() {
            debug!(
                "sync {}: placed {}, canceled {}, rejected {}, deferred {}",
                self.ctx.symbol(),
                report.placed,
                report.canceled,
                report.rejected,
                report.deferred
            );
        }
        Ok(report)
    }

    /// Create orders for every Pending level
    pub async fn place_pending(&self, state: &mut GridState) -> GridResult<SyncReport> {
        let symbol = self.ctx.symbol().to_string();
        let requests: Vec<(usize, OrderRequest)> = state
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.state == LevelState::Pending)
            .map(|(i, l)| {
                (
                    i,
                    OrderRequest::limit(&symbol, l.side, l.remaining(), l.price),
                )
            })
            .collect();
        if requests.is_empty() {
            return Ok(SyncReport::default());
        }

        let results: Vec<(usize, GridResult<Order>)> = stream::iter(requests)
            .map(|(i, request)| {
                let ctx = self.ctx.clone();
                async move {
                    let result = ctx
                        .retry
                        .run("create_order", || {
                            let exchange = ctx.exchange.clone();
                            let request = request.clone();
                            async move { exchange.create_order(&request).await }
                        })
                        .await;
                    (i, result)
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut report = SyncReport::default();
        let mut fatal = None;
        for (i, result) in results {
            let level = &mut state.levels[i];
            match result {
                Ok(order) => {
                    debug!("placed {} {} @ {} as {}", level.side, level.amount, level.price, order.id);
                    level.mark_placed(order.id);
                    report.placed += 1;
                }
                Err(GridError::Rejection(reason)) => {
                    warn!(
                        "{} {} @ {} rejected, dropping level: {}",
                        level.side, level.amount, level.price, reason
                    );
                    level.mark_canceled();
                    report.rejected += 1;
                }
                Err(e) if e.is_fatal() => fatal = Some(e),
                Err(e) => {
                    error!(
                        "{} {} @ {} not placed, will retry on next sync: {}",
                        level.side, level.amount, level.price, e
                    );
                    report.deferred += 1;
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Cancel the levels at `indices`; Pending ones are dropped without a call
    async fn cancel_indices(&self, state: &mut GridState, indices: Vec<usize>) -> GridResult<usize> {
        let mut calls = Vec::new();
        for i in indices {
            let level = &mut state.levels[i];
            match (level.state, level.order_id.clone()) {
                (LevelState::Placed, Some(id)) => calls.push((i, id)),
                _ => level.mark_canceled(),
            }
        }
        if calls.is_empty() {
            return Ok(0);
        }

        let results: Vec<(usize, GridResult<()>)> = stream::iter(calls)
            .map(|(i, id)| {
                let ops = self.clone();
                async move { (i, ops.cancel_order_id(&id).await) }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut canceled = 0;
        for (i, result) in results {
            match result {
                Ok(()) => {
                    state.levels[i].mark_canceled();
                    canceled += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!("cancel of {:?} failed, level kept live: {}", state.levels[i].order_id, e),
            }
        }
        Ok(canceled)
    }

    /// Cancel one order by id; an order that is already gone counts as cancelled
    pub async fn cancel_order_id(&self, order_id: &str) -> GridResult<()> {
        let symbol = self.ctx.symbol().to_string();
        let result = self
            .ctx
            .retry
            .run("cancel_order", || {
                let exchange = self.ctx.exchange.clone();
                let symbol = symbol.clone();
                async move { exchange.cancel_order(order_id, &symbol).await }
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(GridError::OrderNotFound(_)) => {
                debug!("order {} already gone", order_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel every live level matching `predicate`
    pub async fn cancel_where<P>(&self, state: &mut GridState, predicate: P) -> GridResult<usize>
    where
        P: Fn(&GridLevel) -> bool,
    {
        let indices: Vec<usize> = state
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_live() && predicate(l))
            .map(|(i, _)| i)
            .collect();
        self.cancel_indices(state, indices).await
    }

    /// Open orders for the grid symbol
    pub async fn open_orders(&self) -> GridResult<Vec<Order>> {
        let symbol = self.ctx.symbol().to_string();
        let orders = self
            .ctx
            .retry
            .run("get_open_orders", || {
                let exchange = self.ctx.exchange.clone();
                let symbol = symbol.clone();
                async move { exchange.get_open_orders(Some(&symbol)).await }
            })
            .await?;
        Ok(orders.into_iter().filter(|o| o.symbol == symbol).collect())
    }

    /// Cancel all orders for the symbol and verify none survived
    pub async fn cancel_all(&self, state: &mut GridState) -> GridResult<()> {
        let symbol = self.ctx.symbol().to_string();
        for attempt in 1..=CANCEL_ALL_ATTEMPTS {
            self.ctx
                .retry
                .run("cancel_all_orders", || {
                    let exchange = self.ctx.exchange.clone();
                    let symbol = symbol.clone();
                    async move { exchange.cancel_all_orders(Some(&symbol)).await }
                })
                .await?;

            let survivors = self.open_orders().await?;
            if survivors.is_empty() {
                for level in state.levels.iter_mut().filter(|l| l.is_live()) {
                    level.mark_canceled();
                }
                info!("All orders on {} cancelled", symbol);
                return Ok(());
            }
            warn!(
                "{} orders survived cancel-all on {} (attempt {}/{})",
                survivors.len(),
                symbol,
                attempt,
                CANCEL_ALL_ATTEMPTS
            );
        }
        Err(GridError::ReconciliationMismatch(format!(
            "orders on {} survived {} cancel-all attempts",
            symbol, CANCEL_ALL_ATTEMPTS
        )))
    }

    /// Close `position` with a reduce-only market order
    pub async fn close_position(&self, position: &Position) -> GridResult<Option<Order>> {
        let side = match position.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
            PositionSide::Flat => return Ok(None),
        };
        let amount = self.ctx.config.precision.round_amount(position.size);
        if amount <= 0.0 {
            return Ok(None);
        }
        warn!("Closing {} {} with a market {}", amount, self.ctx.symbol(), side);
        let request = OrderRequest::market(self.ctx.symbol(), side, amount).reduce_only();
        let order = self
            .ctx
            .retry
            .run("close_position", || {
                let exchange = self.ctx.exchange.clone();
                let request = request.clone();
                async move { exchange.create_order(&request).await }
            })
            .await?;
        Ok(Some(order))
    }

    /// Adopt resting orders that match Pending levels by (price, side, amount)
    pub async fn adopt_open_orders(&self, state: &mut GridState) -> GridResult<usize> {
        let decimals = state.layout.price_decimals;
        let epsilon = self.ctx.config.precision.amount_epsilon();
        let mut pending: HashMap<LevelKey, usize> = state
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.state == LevelState::Pending)
            .map(|(i, l)| (l.key(decimals), i))
            .collect();

        let mut adopted = 0;
        for order in self.open_orders().await? {
            let Some(price) = order.price else { continue };
            let key = LevelKey::new(price, order.side, decimals);
            if let Some(i) = pending.remove(&key) {
                let level = &mut state.levels[i];
                if (level.amount - (order.amount - order.filled)).abs() <= epsilon {
                    level.mark_placed(order.id);
                    adopted += 1;
                } else {
                    pending.insert(key, i);
                }
            }
        }
        if adopted > 0 {
            info!("Adopted {} resting orders on {}", adopted, self.ctx.symbol());
        }
        Ok(adopted)
    }

    /// Record a fill against its level and the position tracker
    pub fn apply_fill(&self, state: &mut GridState, tracker: &mut PositionTracker, fill: &Fill) -> FillOutcome {
        let Some(i) = state.level_by_order_id(&fill.order_id) else {
            debug!("ignoring fill for untracked order {}", fill.order_id);
            return FillOutcome::Untracked;
        };
        let epsilon = self.ctx.config.precision.amount_epsilon();
        let level = &mut state.levels[i];
        tracker.on_fill(level, fill.price, fill.amount, fill.fee);
        let late = level.order_id.as_deref() != Some(fill.order_id.as_str());
        if level.state.is_terminal() {
            warn!(
                "fill for {:?} level {} @ {} (order {})",
                level.state,
                level.side,
                level.price,
                fill.order_id
            );
            return FillOutcome::Partial(level.clone());
        }
        if late {
            warn!(
                "late fill of replaced order {} for {} @ {}",
                fill.order_id, level.side, level.price
            );
        }
        if level.record_fill(fill.amount, epsilon) {
            info!(
                "Level {} {} {} @ {} filled",
                level.index, level.side, level.amount, level.price
            );
            FillOutcome::Completed(level.clone())
        } else {
            FillOutcome::Partial(level.clone())
        }
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
    use crate::grid::strategy::GridStrategyEngine;
    use crate::grid::types::LevelRole;

    async fn setup(price: f64) -> (Arc<PaperExchange>, OrderOperations, GridState, GridStrategyEngine) {
        let config = GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0);
        let exchange = Arc::new(PaperExchange::new("BTC", price, PaperSettings::default()));
        let ctx = EngineContext::new(exchange.clone(), config, RetryPolicy::immediate(3));
        let strategy = GridStrategyEngine::new(ctx.config.clone());
        let (layout, _) = strategy.compute(price).unwrap();
        let state = GridState::new(layout, Vec::new());
        (exchange, OrderOperations::new(ctx, 4), state, strategy)
    }

    #[tokio::test]
    async fn test_sync_places_ladder_and_is_stable() {
        let (exchange, ops, mut state, strategy) = setup(195.0).await;
        let target = strategy.ladder(&state.layout);
        let report = ops.sync(&mut state, target.clone()).await.unwrap();
        assert_eq!(report.placed, 10);
        assert_eq!(exchange.open_order_count().await, 10);
        assert!(state.levels.iter().all(|l| l.state == LevelState::Placed));

        let again = ops.sync(&mut state, target).await.unwrap();
        assert!(again.is_noop());
        assert_eq!(exchange.call_counts().await, (10, 0));
    }

    #[tokio::test]
    async fn test_sync_cancels_levels_leaving_target() {
        let (exchange, ops, mut state, strategy) = setup(195.0).await;
        let mut target = strategy.ladder(&state.layout);
        ops.sync(&mut state, target.clone()).await.unwrap();

        target.truncate(7);
        let report = ops.sync(&mut state, target).await.unwrap();
        assert_eq!(report.canceled, 3);
        state.prune_terminal();
        assert_eq!(state.levels.len(), 7);
        assert_eq!(exchange.open_order_count().await, 7);
    }

    #[tokio::test]
    async fn test_rejection_cancels_level() {
        let (exchange, ops, mut state, _) = setup(195.0).await;
        exchange.set_min_amount(5.0).await;
        state.insert_level(GridLevel::new(3, 120.0, OrderSide::Buy, 1.0, LevelRole::Entry));
        let report = ops.place_pending(&mut state).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(state.levels[0].state, LevelState::Canceled);
    }

    #[tokio::test]
    async fn test_exhausted_connectivity_leaves_level_pending() {
        let (exchange, ops, mut state, _) = setup(195.0).await;
        exchange.fail_next_calls(3).await;
        state.insert_level(GridLevel::new(3, 120.0, OrderSide::Buy, 1.0, LevelRole::Entry));
        let report = ops.place_pending(&mut state).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(state.levels[0].state, LevelState::Pending);

        let report = ops.place_pending(&mut state).await.unwrap();
        assert_eq!(report.placed, 1);
    }

    #[tokio::test]
    async fn test_cancel_all_is_verified() {
        let (exchange, ops, mut state, strategy) = setup(195.0).await;
        let ladder = strategy.ladder(&state.layout);
        ops.sync(&mut state, ladder).await.unwrap();
        exchange.insert_stray_order(OrderSide::Sell, 250.0, 1.0).await;

        ops.cancel_all(&mut state).await.unwrap();
        assert_eq!(exchange.open_order_count().await, 0);
        assert!(state.levels.iter().all(|l| l.state == LevelState::Canceled));
    }

    #[tokio::test]
    async fn test_fill_accounting_and_partial_fills() {
        let (_, ops, mut state, _) = setup(195.0).await;
        let mut tracker = PositionTracker::new(&GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0));
        let mut level = GridLevel::new(3, 120.0, OrderSide::Buy, 1.0, LevelRole::Entry);
        level.mark_placed("42".into());
        state.insert_level(level);

        let fill = |amount: f64| Fill {
            order_id: "42".into(),
            symbol: "BTC".into(),
            side: OrderSide::Buy,
            price: 120.0,
            amount,
            fee: 0.0,
            timestamp: chrono::Utc::now(),
        };
        assert!(matches!(ops.apply_fill(&mut state, &mut tracker, &fill(0.4)), FillOutcome::Partial(_)));
        assert!((tracker.position().size - 0.4).abs() < 1e-9);
        assert!(matches!(ops.apply_fill(&mut state, &mut tracker, &fill(0.6)), FillOutcome::Completed(_)));
        assert_eq!(state.levels[0].state, LevelState::Filled);

        let stray = Fill {
            order_id: "nope".into(),
            ..fill(1.0)
        };
        assert_eq!(ops.apply_fill(&mut state, &mut tracker, &stray), FillOutcome::Untracked);
        assert!((tracker.position().size - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_late_fill_of_replaced_order_is_attributed() {
        let (_, ops, mut state, _) = setup(195.0).await;
        let mut tracker = PositionTracker::new(&GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0));
        let mut level = GridLevel::new(9, 180.0, OrderSide::Buy, 1.0, LevelRole::Entry);
        level.mark_placed("7".into());
        level.retire_order();
        level.mark_placed("8".into());
        state.insert_level(level);

        let late = Fill {
            order_id: "7".into(),
            symbol: "BTC".into(),
            side: OrderSide::Buy,
            price: 180.0,
            amount: 1.0,
            fee: 0.0,
            timestamp: chrono::Utc::now(),
        };
        match ops.apply_fill(&mut state, &mut tracker, &late) {
            FillOutcome::Completed(level) => assert_eq!(level.order_id.as_deref(), Some("8")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(state.levels[0].state, LevelState::Filled);
        assert!((tracker.position().size - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_close_position_uses_reduce_only_market() {
        let (exchange, ops, _, _) = setup(150.0).await;
        exchange
            .create_order(&OrderRequest::market("BTC", OrderSide::Buy, 2.0))
            .await
            .unwrap();
        let position = exchange.position().await;
        let order = ops.close_position(&position).await.unwrap().unwrap();
        assert_eq!(order.side, OrderSide::Sell);
        assert!(exchange.position().await.is_flat());
        assert!(ops.close_position(&Position::default()).await.unwrap().is_none());
    }
}
