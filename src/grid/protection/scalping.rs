//! Scalping exit: once most of the ladder has filled, trade out on one take-profit order

use crate::grid::config::{Precision, ScalpingSettings};
use crate::grid::strategy::GridLayout;
use crate::grid::types::{GridLevel, LevelRole, Position, PositionSide};

use super::smart_scalping::SmartScalpingTracker;

/// Plain trigger plus the optional smart tracker
#[derive(Debug, Clone)]
pub struct ScalpingManager {
    settings: ScalpingSettings,
    smart: Option<SmartScalpingTracker>,
}

impl ScalpingManager {
    pub fn new(settings: ScalpingSettings) -> Self {
        let smart = settings.smart.clone().map(SmartScalpingTracker::new);
        Self { settings, smart }
    }

    pub fn trigger_index(&self, layout: &GridLayout) -> u32 {
        layout.trigger_index(self.settings.trigger_percent)
    }

    /// Feed a price; true when scalping should start
    pub fn observe(&mut self, layout: &GridLayout, price: f64) -> bool {
        let index = layout.index_for_price(price);
        let threshold = self.trigger_index(layout);
        match self.smart.as_mut() {
            Some(tracker) => tracker.observe(index, threshold, layout.count),
            None => index <= threshold,
        }
    }

    /// Price is back above the trigger and the rebound exit is enabled
    pub fn should_exit(&self, layout: &GridLayout, price: f64) -> bool {
        self.settings.rebound_exit && layout.index_for_price(price) > self.trigger_index(layout)
    }

    /// Forget tracked excursions, e.g. after a reset
    pub fn reset(&mut self) {
        if let Some(tracker) = self.smart.as_mut() {
            tracker.reset();
        }
    }

    pub fn smart_tracker(&self) -> Option<&SmartScalpingTracker> {
        self.smart.as_ref()
    }

    /// The single order that closes `position` at break-even plus the configured grids
    pub fn take_profit_level(
        &self,
        layout: &GridLayout,
        precision: &Precision,
        position: &Position,
        break_even: f64,
    ) -> Option<GridLevel> {
        if position.is_flat() || position.side == PositionSide::Flat {
            return None;
        }
        let target = layout.favourable_offset(break_even, self.settings.take_profit_grids as i64);
        let price = precision.round_price(target.clamp(layout.lower, layout.upper));
        let amount = precision.round_amount(position.size);
        if amount <= 0.0 {
            return None;
        }
        let side = layout.direction.building_side().opposite();
        Some(GridLevel::new(
            layout.index_for_price(price),
            price,
            side,
            amount,
            LevelRole::TakeProfit,
        ))
    }
}
