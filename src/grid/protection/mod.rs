//! Protection managers
//!
//! Each manager is a pure decision object. [`ProtectionManagers::evaluate`]
//! runs them in priority order (price lock, stop-loss, take profit, capital
//! protection, scalping) and returns the first decision that fires. The
//! coordinator carries the decision out; managers never call the exchange.

pub mod capital;
pub mod position_anomaly;
pub mod price_lock;
pub mod scalping;
pub mod smart_scalping;
pub mod stop_loss;
pub mod take_profit;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::GridConfig;
use super::state::GridMode;
use super::strategy::GridLayout;

pub use capital::CapitalProtectionManager;
pub use position_anomaly::{AnomalyVerdict, PositionAnomalyMonitor};
pub use price_lock::PriceLockManager;
pub use scalping::ScalpingManager;
pub use smart_scalping::{SmartPhase, SmartScalpingTracker};
pub use stop_loss::{cycle_apr, StopLossAction, StopLossManager};
pub use take_profit::TakeProfitManager;

/// Snapshot the managers decide on
#[derive(Debug, Clone, Copy)]
pub struct ProtectionInputs<'a> {
    pub mode: GridMode,
    pub price: f64,
    pub layout: &'a GridLayout,
    pub capital_delta: f64,
    pub initial_capital: f64,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionDecision {
    None,
    Lock,
    Unlock,
    /// Locked and staying locked
    Hold,
    EnterTakeProfit,
    EnterCapitalProtection,
    /// Capital protection reached break-even
    RecoverAndReset,
    EnterScalping,
    /// Price rebounded above the scalping trigger
    ExitScalping,
    /// Price stayed past the stop-loss trigger for the escape timeout
    EnterStopLoss,
}

/// How often each protection fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProtectionCounters {
    pub scalping: u32,
    pub capital_protection: u32,
    pub take_profit: u32,
    pub price_lock: u32,
    pub stop_loss: u32,
    pub anomaly_alerts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ProtectionManagers {
    pub scalping: Option<ScalpingManager>,
    pub capital: Option<CapitalProtectionManager>,
    pub take_profit: Option<TakeProfitManager>,
    pub price_lock: Option<PriceLockManager>,
    pub stop_loss: Option<StopLossManager>,
    pub anomaly: Option<PositionAnomalyMonitor>,
    counters: ProtectionCounters,
}

impl ProtectionManagers {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            scalping: config.scalping.clone().map(ScalpingManager::new),
            capital: config
                .capital_protection
                .clone()
                .map(CapitalProtectionManager::new),
            take_profit: config.take_profit.clone().map(TakeProfitManager::new),
            price_lock: config.price_lock.clone().map(PriceLockManager::new),
            stop_loss: config.stop_loss.clone().map(StopLossManager::new),
            anomaly: config.position_anomaly.clone().map(|settings| {
                PositionAnomalyMonitor::new(settings, config.order_amount, Utc::now())
            }),
            counters: ProtectionCounters::default(),
        }
    }

    pub fn counters(&self) -> ProtectionCounters {
        self.counters
    }

    /// First decision in priority order
    pub fn evaluate(&mut self, inputs: ProtectionInputs<'_>) -> ProtectionDecision {
        let ProtectionInputs {
            mode,
            price,
            layout,
            capital_delta,
            initial_capital,
            now,
        } = inputs;

        if let Some(lock) = &self.price_lock {
            if mode == GridMode::PriceLocked {
                return if lock.should_unlock(layout, price) {
                    ProtectionDecision::Unlock
                } else {
                    ProtectionDecision::Hold
                };
            }
            if mode.is_lockable() && lock.should_lock(layout, price) {
                self.counters.price_lock += 1;
                return ProtectionDecision::Lock;
            }
        }

        if let Some(stop_loss) = self.stop_loss.as_mut() {
            // not carried out yet, retry
            if mode == GridMode::StopLoss {
                return ProtectionDecision::EnterStopLoss;
            }
            if matches!(
                mode,
                GridMode::Normal | GridMode::Scalping | GridMode::CapitalProtection
            ) && stop_loss.observe(layout, price, now)
            {
                self.counters.stop_loss += 1;
                return ProtectionDecision::EnterStopLoss;
            }
        }

        if matches!(
            mode,
            GridMode::TakeProfit | GridMode::Resetting | GridMode::PriceLocked | GridMode::StopLoss
        ) {
            return ProtectionDecision::None;
        }

        if let Some(tp) = &self.take_profit {
            if mode == GridMode::Normal && tp.should_trigger(capital_delta, initial_capital) {
                self.counters.take_profit += 1;
                return ProtectionDecision::EnterTakeProfit;
            }
        }

        if let Some(cp) = &self.capital {
            if mode == GridMode::CapitalProtection {
                return if cp.has_recovered(capital_delta) {
                    ProtectionDecision::RecoverAndReset
                } else {
                    ProtectionDecision::None
                };
            }
            if cp.should_trigger(layout, price) {
                self.counters.capital_protection += 1;
                return ProtectionDecision::EnterCapitalProtection;
            }
        }

        if mode == GridMode::Scalping {
            if let Some(scalping) = &self.scalping {
                if scalping.should_exit(layout, price) {
                    return ProtectionDecision::ExitScalping;
                }
            }
        }

        if mode == GridMode::Normal {
            if let Some(scalping) = self.scalping.as_mut() {
                if scalping.observe(layout, price) {
                    self.counters.scalping += 1;
                    return ProtectionDecision::EnterScalping;
                }
            }
        }
        ProtectionDecision::None
    }

    /// Clear per-cycle tracking after a reset
    pub fn reset_cycle(&mut self) {
        if let Some(scalping) = self.scalping.as_mut() {
            scalping.reset();
        }
        if let Some(stop_loss) = self.stop_loss.as_mut() {
            stop_loss.reset();
        }
    }

    /// Run the anomaly check on a reconciled signed position size
    pub fn check_position(&mut self, size: f64, now: DateTime<Utc>) -> AnomalyVerdict {
        let Some(anomaly) = self.anomaly.as_mut() else {
            return AnomalyVerdict::Normal;
        };
        let verdict = anomaly.check(size, now);
        if matches!(verdict, AnomalyVerdict::Alert { .. }) {
            self.counters.anomaly_alerts += 1;
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::Direction;

    fn layout() -> GridLayout {
        GridLayout {
            direction: Direction::Long,
            lower: 100.0,
            upper: 200.0,
            interval: 10.0,
            count: 10,
            price_decimals: 2,
        }
    }

    fn managers() -> ProtectionManagers {
        let config = GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0)
            .with_scalping(50.0, 2)
            .with_capital_protection(80.0)
            .with_take_profit(1.0)
            .with_price_lock(210.0);
        ProtectionManagers::from_config(&config)
    }

    fn inputs(layout: &GridLayout, mode: GridMode, price: f64, delta: f64) -> ProtectionInputs<'_> {
        ProtectionInputs {
            mode,
            price,
            layout,
            capital_delta: delta,
            initial_capital: 10_000.0,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_priority_order() {
        let layout = layout();
        let mut m = managers();
        // lock beats take profit
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Normal, 215.0, 500.0)),
            ProtectionDecision::Lock
        );
        // take profit beats capital protection
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Normal, 105.0, 500.0)),
            ProtectionDecision::EnterTakeProfit
        );
        // capital protection beats scalping
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Normal, 105.0, -50.0)),
            ProtectionDecision::EnterCapitalProtection
        );
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Normal, 140.0, -50.0)),
            ProtectionDecision::EnterScalping
        );
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Normal, 170.0, 0.0)),
            ProtectionDecision::None
        );
        let counters = m.counters();
        assert_eq!(
            (counters.price_lock, counters.take_profit, counters.capital_protection, counters.scalping),
            (1, 1, 1, 1)
        );
    }

    #[test]
    fn test_scalping_escalates_and_does_not_exit_on_rebound() {
        let layout = layout();
        let mut m = managers();
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Scalping, 180.0, 0.0)),
            ProtectionDecision::None
        );
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Scalping, 110.0, -80.0)),
            ProtectionDecision::EnterCapitalProtection
        );
    }

    #[test]
    fn test_capital_protection_waits_for_break_even() {
        let layout = layout();
        let mut m = managers();
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::CapitalProtection, 150.0, -3.0)),
            ProtectionDecision::None
        );
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::CapitalProtection, 160.0, 0.5)),
            ProtectionDecision::RecoverAndReset
        );
    }

    #[test]
    fn test_locked_grid_holds_until_back_in_range() {
        let layout = layout();
        let mut m = managers();
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::PriceLocked, 205.0, 900.0)),
            ProtectionDecision::Hold
        );
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::PriceLocked, 195.0, 900.0)),
            ProtectionDecision::Unlock
        );
        // take profit mode is never locked
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::TakeProfit, 215.0, 0.0)),
            ProtectionDecision::None
        );
    }

    #[test]
    fn test_scalping_rebound_exit_when_enabled() {
        let layout = layout();
        let config = GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0).with_scalping(50.0, 2);
        let mut config = config.with_capital_protection(80.0);
        if let Some(scalping) = config.scalping.as_mut() {
            scalping.rebound_exit = true;
        }
        let mut m = ProtectionManagers::from_config(&config);
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Scalping, 140.0, 0.0)),
            ProtectionDecision::None
        );
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Scalping, 165.0, 0.0)),
            ProtectionDecision::ExitScalping
        );
        // capital protection still comes first
        assert_eq!(
            m.evaluate(inputs(&layout, GridMode::Scalping, 105.0, -50.0)),
            ProtectionDecision::EnterCapitalProtection
        );
    }

    #[test]
    fn test_stop_loss_outranks_take_profit_and_retries() {
        use chrono::Duration;

        let layout = layout();
        let config = GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0)
            .with_take_profit(1.0)
            .with_stop_loss(100.0, 300, 50.0);
        let mut m = ProtectionManagers::from_config(&config);
        let start = Utc::now();
        let at = |price: f64, secs: i64, mode: GridMode| ProtectionInputs {
            now: start + Duration::seconds(secs),
            ..inputs(&layout, mode, price, 500.0)
        };

        assert_eq!(
            m.evaluate(at(95.0, 0, GridMode::Normal)),
            ProtectionDecision::EnterTakeProfit
        );
        assert_eq!(
            m.evaluate(at(95.0, 300, GridMode::Normal)),
            ProtectionDecision::EnterStopLoss
        );
        assert_eq!(
            m.evaluate(at(120.0, 310, GridMode::StopLoss)),
            ProtectionDecision::EnterStopLoss
        );
        assert_eq!(m.counters().stop_loss, 1);

        m.reset_cycle();
        assert!(m.stop_loss.as_ref().is_some_and(|sl| sl.escaped_since().is_none()));
    }

    #[test]
    fn test_position_alerts_are_counted() {
        let config = GridConfig::fixed_long("BTC", 100.0, 200.0, 10.0, 1.0).with_position_anomaly(
            crate::grid::config::PositionAnomalySettings {
                alert_percent: 100.0,
                max_multiplier: 10.0,
                grace_secs: 0,
            },
        );
        let mut m = ProtectionManagers::from_config(&config);
        let now = Utc::now();
        assert_eq!(m.check_position(2.0, now), AnomalyVerdict::Normal);
        assert!(matches!(m.check_position(5.0, now), AnomalyVerdict::Alert { .. }));
        assert!(matches!(m.check_position(60.0, now), AnomalyVerdict::Halt { .. }));
        assert_eq!(m.counters().anomaly_alerts, 1);
    }
}
