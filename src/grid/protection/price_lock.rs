//! Price lock: freeze the grid while price runs away on the favourable side

use crate::grid::config::{Direction, PriceLockSettings};
use crate::grid::strategy::GridLayout;

#[derive(Debug, Clone)]
pub struct PriceLockManager {
    settings: PriceLockSettings,
}

impl PriceLockManager {
    pub fn new(settings: PriceLockSettings) -> Self {
        Self { settings }
    }

    pub fn threshold(&self) -> f64 {
        self.settings.threshold
    }

    pub fn should_lock(&self, layout: &GridLayout, price: f64) -> bool {
        match layout.direction {
            Direction::Long => price >= self.settings.threshold && price > layout.upper,
            Direction::Short => price <= self.settings.threshold && price < layout.lower,
        }
    }

    pub fn should_unlock(&self, layout: &GridLayout, price: f64) -> bool {
        layout.contains(price)
    }
}
