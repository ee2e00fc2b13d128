//! Smart scalping: waits for repeated deep excursions before firing
//!
//! Indices count from the adverse end, so "below" the threshold means an
//! index at or under it for both directions.

use log::info;
use serde::Serialize;

use crate::grid::config::SmartScalpingSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SmartPhase {
    Idle,
    /// Below the threshold, excursion not yet deep enough
    Tracking { extreme: u32 },
    /// Deep excursion seen, waiting for price to come back over the threshold
    WaitingRebound { extreme: u32 },
    /// Fires once price returns to the activation index
    Activated { activation: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct SmartScalpingTracker {
    settings: SmartScalpingSettings,
    phase: SmartPhase,
    /// Moves to each confirmed extreme; None until the first one
    threshold: Option<u32>,
    deep_drops: u32,
}

impl SmartScalpingTracker {
    pub fn new(settings: SmartScalpingSettings) -> Self {
        Self {
            settings,
            phase: SmartPhase::Idle,
            threshold: None,
            deep_drops: 0,
        }
    }

    pub fn phase(&self) -> SmartPhase {
        self.phase
    }

    pub fn deep_drops(&self) -> u32 {
        self.deep_drops
    }

    pub fn reset(&mut self) {
        self.phase = SmartPhase::Idle;
        self.threshold = None;
        self.deep_drops = 0;
    }

    fn is_deep(&self, threshold: u32, extreme: u32, count: u32) -> bool {
        let depth = threshold.saturating_sub(extreme) as f64 / count.max(1) as f64 * 100.0;
        depth >= self.settings.min_drop_threshold_percent
    }

    /// Feed the current grid index; returns true when scalping should fire
    pub fn observe(&mut self, index: u32, trigger_index: u32, count: u32) -> bool {
        let threshold = self.threshold.unwrap_or(trigger_index);
        let phase = self.phase;
        self.phase = match phase {
            SmartPhase::Idle if index <= threshold => SmartPhase::Tracking { extreme: index },
            SmartPhase::Idle => SmartPhase::Idle,
            SmartPhase::Tracking { extreme } => {
                let extreme = extreme.min(index);
                if index > threshold {
                    // shallow excursion, forgotten
                    SmartPhase::Idle
                } else if self.is_deep(threshold, extreme, count) {
                    SmartPhase::WaitingRebound { extreme }
                } else {
                    SmartPhase::Tracking { extreme }
                }
            }
            SmartPhase::WaitingRebound { extreme } => {
                let extreme = extreme.min(index);
                if index > threshold {
                    self.deep_drops += 1;
                    self.threshold = Some(extreme);
                    info!(
                        "Smart scalping: deep drop {}/{} bottomed at index {}",
                        self.deep_drops, self.settings.allowed_deep_drops, extreme
                    );
                    if self.deep_drops >= self.settings.allowed_deep_drops {
                        SmartPhase::Activated { activation: extreme }
                    } else {
                        SmartPhase::Idle
                    }
                } else {
                    SmartPhase::WaitingRebound { extreme }
                }
            }
            SmartPhase::Activated { activation } => {
                if index <= activation {
                    info!("Smart scalping activated at index {}", index);
                    self.reset();
                    return true;
                }
                SmartPhase::Activated { activation }
            }
        };
        false
    }
}
