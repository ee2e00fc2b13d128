//! Take profit on the cycle's return over initial capital

use crate::grid::config::TakeProfitSettings;

#[derive(Debug, Clone)]
pub struct TakeProfitManager {
    settings: TakeProfitSettings,
}

impl TakeProfitManager {
    pub fn new(settings: TakeProfitSettings) -> Self {
        Self { settings }
    }

    /// Return of the cycle in percent of initial capital
    pub fn return_percent(capital_delta: f64, initial_capital: f64) -> Option<f64> {
        (initial_capital > 0.0).then(|| capital_delta / initial_capital * 100.0)
    }

    pub fn should_trigger(&self, capital_delta: f64, initial_capital: f64) -> bool {
        Self::return_percent(capital_delta, initial_capital)
            .is_some_and(|pct| pct >= self.settings.percentage)
    }
}
