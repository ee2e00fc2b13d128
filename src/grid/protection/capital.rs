//! Capital protection: stop adding exposure and wait for break-even

use crate::grid::config::CapitalProtectionSettings;
use crate::grid::strategy::GridLayout;

/// Delta at which a protected position counts as recovered
pub const RECOVERY_TOLERANCE: f64 = -0.01;

#[derive(Debug, Clone)]
pub struct CapitalProtectionManager {
    settings: CapitalProtectionSettings,
}

impl CapitalProtectionManager {
    pub fn new(settings: CapitalProtectionSettings) -> Self {
        Self { settings }
    }

    pub fn trigger_index(&self, layout: &GridLayout) -> u32 {
        layout.trigger_index(self.settings.trigger_percent)
    }

    /// Price has crossed the protection fraction of the ladder
    pub fn should_trigger(&self, layout: &GridLayout, price: f64) -> bool {
        layout.index_for_price(price) <= self.trigger_index(layout)
    }

    /// Cycle pnl is back to break-even
    pub fn has_recovered(&self, capital_delta: f64) -> bool {
        capital_delta >= RECOVERY_TOLERANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::Direction;

    #[test]
    fn test_trigger_and_recovery() {
        let layout = GridLayout {
            direction: Direction::Long,
            lower: 100.0,
            upper: 200.0,
            interval: 10.0,
            count: 10,
            price_decimals: 2,
        };
        let m = CapitalProtectionManager::new(CapitalProtectionSettings {
            trigger_percent: 80.0,
        });
        assert_eq!(m.trigger_index(&layout), 2);
        assert!(!m.should_trigger(&layout, 130.0));
        assert!(m.should_trigger(&layout, 112.0));

        assert!(!m.has_recovered(-5.0));
        assert!(m.has_recovered(-0.005));
        assert!(m.has_recovered(3.0));
    }
}
