//! Stop-loss: close out once price has stayed past the adverse trigger for too long
//!
//! The trigger price sits `trigger_percent` of the range away from the
//! favourable bound (100% is the adverse bound itself). When it fires, the
//! cycle's annualised return decides between a reset and a full stop.

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::grid::config::{Direction, StopLossSettings};
use crate::grid::strategy::GridLayout;

/// Cycles younger than this report a zero APR
pub const APR_MIN_WINDOW_SECS: i64 = 600;

const SECS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// What to do once the stop-loss fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopLossAction {
    Reset,
    Stop,
}

#[derive(Debug, Clone)]
pub struct StopLossManager {
    settings: StopLossSettings,
    escaped_since: Option<DateTime<Utc>>,
}

impl StopLossManager {
    pub fn new(settings: StopLossSettings) -> Self {
        Self {
            settings,
            escaped_since: None,
        }
    }

    pub fn trigger_price(&self, layout: &GridLayout) -> f64 {
        let distance = (layout.upper - layout.lower) * self.settings.trigger_percent / 100.0;
        match layout.direction {
            Direction::Long => layout.upper - distance,
            Direction::Short => layout.lower + distance,
        }
    }

    pub fn is_escaped(&self, layout: &GridLayout, price: f64) -> bool {
        let trigger = self.trigger_price(layout);
        match layout.direction {
            Direction::Long => price <= trigger,
            Direction::Short => price >= trigger,
        }
    }

    pub fn escaped_since(&self) -> Option<DateTime<Utc>> {
        self.escaped_since
    }

    /// Feed a price; true once it has been past the trigger for the timeout
    pub fn observe(&mut self, layout: &GridLayout, price: f64, now: DateTime<Utc>) -> bool {
        if !self.is_escaped(layout, price) {
            if let Some(since) = self.escaped_since.take() {
                info!(
                    "Price {} back above stop-loss trigger after {}s",
                    price,
                    (now - since).num_seconds()
                );
            }
            return false;
        }
        let since = match self.escaped_since {
            Some(since) => since,
            None => {
                warn!(
                    "Price {} past stop-loss trigger {:.2}, closing out in {}s unless it recovers",
                    price,
                    self.trigger_price(layout),
                    self.settings.escape_timeout_secs
                );
                self.escaped_since = Some(now);
                now
            }
        };
        (now - since).num_seconds() >= self.settings.escape_timeout_secs as i64
    }

    pub fn reset(&mut self) {
        self.escaped_since = None;
    }

    /// Reset when the cycle earned at least the threshold APR, stop otherwise
    pub fn action(&self, apr: f64) -> StopLossAction {
        if apr >= self.settings.apr_threshold {
            StopLossAction::Reset
        } else {
            StopLossAction::Stop
        }
    }

    pub fn apr_threshold(&self) -> f64 {
        self.settings.apr_threshold
    }
}

/// Annualised realized return of a cycle, in percent
pub fn cycle_apr(net_realized: f64, initial_capital: f64, elapsed_secs: i64) -> f64 {
    if elapsed_secs < APR_MIN_WINDOW_SECS || initial_capital <= 0.0 {
        return 0.0;
    }
    net_realized / initial_capital * 100.0 * SECS_PER_YEAR / elapsed_secs as f64
}
