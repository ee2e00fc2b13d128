//! Position anomaly check run on every reconcile
//!
//! Sizes below one order amount count as flat so rounding noise never
//! alerts. A jump past `max_multiplier` times the last reconciled size halts
//! the grid until an operator looks at it.

use chrono::{DateTime, Utc};
use log::{debug, error, warn};

use crate::grid::config::PositionAnomalySettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnomalyVerdict {
    Normal,
    /// Size changed by more than the alert percentage
    Alert { change_percent: f64 },
    /// Size grew beyond the allowed multiple
    Halt { previous: f64, current: f64 },
}

#[derive(Debug, Clone)]
pub struct PositionAnomalyMonitor {
    settings: PositionAnomalySettings,
    order_amount: f64,
    started_at: DateTime<Utc>,
    last_size: Option<f64>,
}

impl PositionAnomalyMonitor {
    pub fn new(settings: PositionAnomalySettings, order_amount: f64, started_at: DateTime<Utc>) -> Self {
        Self {
            settings,
            order_amount,
            started_at,
            last_size: None,
        }
    }

    fn normalize(&self, size: f64) -> f64 {
        if size.abs() < self.order_amount {
            0.0
        } else {
            size
        }
    }

    /// Compare a freshly reconciled signed size with the previous one
    pub fn check(&mut self, size: f64, now: DateTime<Utc>) -> AnomalyVerdict {
        let previous = self.last_size.replace(size);
        if (now - self.started_at).num_seconds() < self.settings.grace_secs as i64 {
            debug!("Position {:+} observed during start-up grace period", size);
            return AnomalyVerdict::Normal;
        }
        let Some(previous) = previous else {
            return AnomalyVerdict::Normal;
        };
        let last = self.normalize(previous);
        let current = self.normalize(size);
        if last == 0.0 {
            return AnomalyVerdict::Normal;
        }

        let limit = last.abs() * self.settings.max_multiplier;
        if current.abs() > limit {
            error!(
                "Position anomaly: {:+} -> {:+} exceeds {}x the previous size, manual check required",
                previous, size, self.settings.max_multiplier
            );
            return AnomalyVerdict::Halt {
                previous,
                current: size,
            };
        }

        let change_percent = (current - last).abs() / last.abs() * 100.0;
        if change_percent > self.settings.alert_percent {
            warn!(
                "Position changed {:+} -> {:+} ({:.1}%, alert at {}%)",
                previous, size, change_percent, self.settings.alert_percent
            );
            return AnomalyVerdict::Alert { change_percent };
        }
        AnomalyVerdict::Normal
    }
}
