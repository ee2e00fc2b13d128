//! Order health checks: compares the expected resting orders with the exchange

use std::collections::{HashMap, HashSet};

use log::{info, warn};
use serde::Serialize;

use super::errors::GridResult;
use super::order_ops::OrderOperations;
use super::state::GridState;
use super::types::{LevelKey, LevelState, Order};

/// Corrective step for one mismatch
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAction {
    /// Expected order is missing on the exchange
    Recreate { level: usize },
    /// Resting order no level expects
    CancelStray { order_id: String },
    /// Order exists with a drifted price or amount
    Replace { level: usize, order_id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub recreated: usize,
    pub canceled: usize,
    pub replaced: usize,
}

impl HealthReport {
    pub fn is_clean(&self) -> bool {
        *self == HealthReport::default()
    }
}

/// Diff Placed levels against the open orders
pub fn diff(state: &GridState, open: &[Order], amount_epsilon: f64) -> Vec<HealthAction> {
    let decimals = state.layout.price_decimals;
    let by_id: HashMap<&str, &Order> = open.iter().map(|o| (o.id.as_str(), o)).collect();
    let mut expected = HashSet::new();
    let mut actions = Vec::new();

    for (i, level) in state.levels.iter().enumerate() {
        if level.state != LevelState::Placed {
            continue;
        }
        let Some(id) = level.order_id.as_deref() else {
            actions.push(HealthAction::Recreate { level: i });
            continue;
        };
        expected.insert(id);
        match by_id.get(id) {
            None => actions.push(HealthAction::Recreate { level: i }),
            Some(order) => {
                let key_drift = order
                    .price
                    .map(|p| LevelKey::new(p, order.side, decimals) != level.key(decimals))
                    .unwrap_or(true);
                let open_amount = order.amount - order.filled;
                let amount_drift = (open_amount - level.remaining()).abs() > amount_epsilon;
                if key_drift || amount_drift {
                    actions.push(HealthAction::Replace {
                        level: i,
                        order_id: id.to_string(),
                    });
                }
            }
        }
    }

    for order in open {
        if !expected.contains(order.id.as_str()) {
            actions.push(HealthAction::CancelStray {
                order_id: order.id.clone(),
            });
        }
    }
    actions
}

/// Periodic self-healing pass
#[derive(Clone)]
pub struct OrderHealthChecker {
    ops: OrderOperations,
    amount_epsilon: f64,
}

impl OrderHealthChecker {
    pub fn new(ops: OrderOperations, amount_epsilon: f64) -> Self {
        Self { ops, amount_epsilon }
    }

    /// Fetch open orders and correct every mismatch
    ///
    /// With `allow_placement` false, missing orders are only marked and
    /// left for a later pass; strays are still cancelled.
    pub async fn check(&self, state: &mut GridState, allow_placement: bool) -> GridResult<HealthReport> {
        let open = self.ops.open_orders().await?;
        let actions = diff(state, &open, self.amount_epsilon);
        let mut report = HealthReport::default();
        if actions.is_empty() {
            return Ok(report);
        }

        for action in actions {
            match action {
                HealthAction::Recreate { level } => {
                    let level = &mut state.levels[level];
                    warn!(
                        "Order {:?} for {} @ {} missing on exchange, recreating",
                        level.order_id, level.side, level.price
                    );
                    level.retire_order();
                    report.recreated += 1;
                }
                HealthAction::Replace { level, order_id } => {
                    warn!("Order {} drifted from its level, replacing", order_id);
                    self.ops.cancel_order_id(&order_id).await?;
                    state.levels[level].retire_order();
                    report.replaced += 1;
                }
                HealthAction::CancelStray { order_id } => {
                    warn!("Cancelling stray order {}", order_id);
                    self.ops.cancel_order_id(&order_id).await?;
                    report.canceled += 1;
                }
            }
        }

        if allow_placement {
            self.ops.place_pending(state).await?;
        }
        info!(
            "Health check: recreated {}, replaced {}, cancelled {} strays",
            report.recreated, report.replaced, report.canceled
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::grid::config::GridConfig;
    use crate::grid::executor::EngineContext;
    use crate::grid::paper::{PaperExchange, PaperSettings};
    use crate::grid::retry::RetryPolicy;
    use crate::grid::strategy::GridStrategyEngine;
    use crate::grid::types::OrderSide;

    async fn placed_grid() -> (Arc<PaperExchange>, OrderHealthChecker, GridState) {
        let config = GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0);
        let epsilon = config.precision.amount_epsilon();
        let exchange = Arc::new(PaperExchange::new("BTC", 195.0, PaperSettings::default()));
        let ctx = EngineContext::new(exchange.clone(), config, RetryPolicy::immediate(3));
        let strategy = GridStrategyEngine::new(ctx.config.clone());
        let (layout, ladder) = strategy.compute(195.0).unwrap();
        let mut state = GridState::new(layout, Vec::new());
        let ops = OrderOperations::new(ctx, 4);
        ops.sync(&mut state, ladder).await.unwrap();
        (exchange, OrderHealthChecker::new(ops, epsilon), state)
    }

    #[tokio::test]
    async fn test_healthy_grid_needs_nothing() {
        let (exchange, checker, mut state) = placed_grid().await;
        let before = exchange.call_counts().await;
        assert!(checker.check(&mut state, true).await.unwrap().is_clean());
        assert_eq!(exchange.call_counts().await, before);
    }

    #[tokio::test]
    async fn test_check_heals_and_is_idempotent() {
        let (exchange, checker, mut state) = placed_grid().await;
        let missing = state.levels[2].order_id.clone().unwrap();
        exchange.drop_order(&missing).await;
        exchange.insert_stray_order(OrderSide::Buy, 55.0, 3.0).await;

        let report = checker.check(&mut state, true).await.unwrap();
        assert_eq!(report.recreated, 1);
        assert_eq!(report.canceled, 1);
        assert_eq!(exchange.open_order_count().await, 10);
        assert_ne!(state.levels[2].order_id.as_deref(), Some(missing.as_str()));
        assert_eq!(state.levels[2].retired_order_ids, vec![missing.clone()]);
        assert_eq!(state.level_by_order_id(&missing), Some(2));

        let counts = exchange.call_counts().await;
        let second = checker.check(&mut state, true).await.unwrap();
        assert!(second.is_clean());
        assert_eq!(exchange.call_counts().await, counts);
    }

    #[tokio::test]
    async fn test_drifted_order_is_replaced() {
        let (_, _, mut state) = placed_grid().await;
        let mut open: Vec<Order> = Vec::new();
        for level in state.levels.iter() {
            open.push(Order {
                id: level.order_id.clone().unwrap(),
                client_id: None,
                symbol: "BTC".into(),
                side: level.side,
                order_type: crate::grid::types::OrderType::Limit,
                price: Some(level.price),
                amount: level.amount,
                filled: 0.0,
                average_price: None,
                status: crate::grid::types::OrderStatus::Open,
            });
        }
        assert!(diff(&state, &open, 1e-6).is_empty());

        open[4].price = Some(141.0);
        state.levels[7].amount = 2.0;
        let actions = diff(&state, &open, 1e-6);
        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .all(|a| matches!(a, HealthAction::Replace { level, .. } if *level == 4 || *level == 7)));
    }
}
