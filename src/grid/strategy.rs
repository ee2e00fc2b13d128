//! Grid strategy engine: configuration + price -> target level set
//!
//! Everything here is pure. The same inputs always produce the same levels
//! in the same order (ascending price, buys before sells).

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use super::config::{Direction, GridConfig, IntervalSpec, RangeSpec, Sizing};
use super::errors::{GridError, GridResult};
use super::state::GridMode;
use super::types::{GridLevel, LevelKey, LevelRole, OrderSide};

/// Resolved geometry of one grid cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridLayout {
    pub direction: Direction,
    pub lower: f64,
    pub upper: f64,
    pub interval: f64,
    pub count: u32,
    pub price_decimals: u32,
}

/// Direction in which price left a follow grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeDirection {
    Up,
    Down,
}

impl GridLayout {
    fn round(&self, price: f64) -> f64 {
        let scale = 10f64.powi(self.price_decimals as i32);
        (price * scale).round() / scale
    }

    /// Price of a 1-based index; index 1 is the adverse end of the ladder
    pub fn price_at(&self, index: u32) -> f64 {
        let steps = index.saturating_sub(1) as f64 * self.interval;
        match self.direction {
            Direction::Long => self.round(self.lower + steps),
            Direction::Short => self.round(self.upper - steps),
        }
    }

    /// Nearest index for a price, clamped to the ladder
    pub fn index_for_price(&self, price: f64) -> u32 {
        let raw = match self.direction {
            Direction::Long => (price - self.lower) / self.interval,
            Direction::Short => (self.upper - price) / self.interval,
        };
        let index = raw.round() + 1.0;
        index.clamp(1.0, self.count as f64) as u32
    }

    /// Index at or below which `percent` of the ladder has been crossed
    pub fn trigger_index(&self, percent: f64) -> u32 {
        let crossed = (self.count as f64 * percent / 100.0).floor() as u32;
        self.count.saturating_sub(crossed).max(1)
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.lower && price <= self.upper
    }

    /// Offset a price by `levels` intervals toward the favourable side
    pub fn favourable_offset(&self, price: f64, levels: i64) -> f64 {
        let delta = levels as f64 * self.interval;
        match self.direction {
            Direction::Long => self.round(price + delta),
            Direction::Short => self.round(price - delta),
        }
    }

    /// Index of an off-ladder price, 0 when it lies outside
    fn index_if_on_ladder(&self, price: f64) -> u32 {
        if self.contains(price) {
            self.index_for_price(price)
        } else {
            0
        }
    }
}

/// Computes target level sets for the configured grid variant
#[derive(Debug, Clone)]
pub struct GridStrategyEngine {
    config: Arc<GridConfig>,
}

impl GridStrategyEngine {
    pub fn new(config: Arc<GridConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    fn resolve_interval(&self, reference_price: f64) -> GridResult<f64> {
        let interval = match self.config.interval {
            IntervalSpec::Absolute(step) => step,
            IntervalSpec::Percent(pct) => {
                self.config.precision.round_price(reference_price * pct / 100.0)
            }
        };
        if interval > 0.0 {
            Ok(interval)
        } else {
            Err(GridError::FatalConfig(format!(
                "grid_interval resolves to {} at price {}",
                interval, reference_price
            )))
        }
    }

    /// Resolve the ladder geometry around `price`
    pub fn layout(&self, price: f64) -> GridResult<GridLayout> {
        let interval = self.resolve_interval(price)?;
        let precision = &self.config.precision;
        let direction = self.config.direction;

        let (lower, upper, count) = match self.config.range {
            RangeSpec::Fixed { lower, upper } => {
                let count = ((upper - lower) / interval).round();
                if count < 1.0 {
                    return Err(GridError::FatalConfig(
                        "grid_interval is wider than the price range".into(),
                    ));
                }
                (lower, upper, count as u32)
            }
            RangeSpec::Follow {
                grid_count,
                price_offset_grids,
                ..
            } => {
                let offset = price_offset_grids as f64 * interval;
                let width = grid_count as f64 * interval;
                let (lower, upper) = match direction {
                    Direction::Long => {
                        let upper = precision.round_price(price + offset);
                        (precision.round_price(upper - width), upper)
                    }
                    Direction::Short => {
                        let lower = precision.round_price(price - offset);
                        (lower, precision.round_price(lower + width))
                    }
                };
                if lower <= 0.0 {
                    return Err(GridError::FatalConfig(format!(
                        "follow range at price {} reaches non-positive lower bound {}",
                        price, lower
                    )));
                }
                (lower, upper, grid_count)
            }
        };

        Ok(GridLayout {
            direction,
            lower,
            upper,
            interval,
            count,
            price_decimals: precision.price_decimals,
        })
    }

    /// Order amount for a ladder index
    ///
    /// Martingale ladders grow by `increment` per level of adverse depth, so
    /// the level furthest from the favourable bound carries the largest size.
    pub fn order_amount(&self, layout: &GridLayout, index: u32) -> f64 {
        let base = self.config.order_amount;
        let amount = match self.config.sizing {
            Sizing::Flat => base,
            Sizing::Martingale { increment } => {
                let depth = layout.count.saturating_sub(index) as f64;
                base + depth * increment
            }
        };
        self.config.precision.round_amount(amount)
    }

    /// The full initial ladder: one building-side order per index
    pub fn ladder(&self, layout: &GridLayout) -> Vec<GridLevel> {
        let side = layout.direction.building_side();
        let mut levels: Vec<GridLevel> = (1..=layout.count)
            .map(|index| {
                GridLevel::new(
                    index,
                    layout.price_at(index),
                    side,
                    self.order_amount(layout, index),
                    LevelRole::Entry,
                )
            })
            .collect();
        sort_levels(&mut levels);
        levels
    }

    /// Fresh cycle: layout plus initial ladder for the observed price
    pub fn compute(&self, price: f64) -> GridResult<(GridLayout, Vec<GridLevel>)> {
        let layout = self.layout(price)?;
        let levels = self.ladder(&layout);
        Ok((layout, levels))
    }

    /// Target set for the current mode given the live levels
    ///
    /// An empty level set yields the initial ladder. Scalping drops reverse
    /// orders; every other mode keeps what is live.
    pub fn target_levels(
        &self,
        layout: &GridLayout,
        mode: GridMode,
        existing: &[GridLevel],
    ) -> Vec<GridLevel> {
        let live: Vec<GridLevel> = existing.iter().filter(|l| l.is_live()).cloned().collect();
        if live.is_empty() && mode == GridMode::Normal {
            return self.ladder(layout);
        }
        let mut target: Vec<GridLevel> = match mode {
            GridMode::Scalping => live
                .into_iter()
                .filter(|l| l.role != LevelRole::Reverse)
                .collect(),
            _ => live,
        };
        sort_levels(&mut target);
        target
    }

    /// The order that closes (or re-arms) a fully filled level
    ///
    /// Offsets are measured from the level's placed price, never the fill price.
    pub fn reverse_level(&self, layout: &GridLayout, filled: &GridLevel) -> GridLevel {
        let distance = self.config.reverse_distance as i64;
        let (price, role) = match filled.role {
            LevelRole::Entry | LevelRole::TakeProfit => {
                (layout.favourable_offset(filled.price, distance), LevelRole::Reverse)
            }
            LevelRole::Reverse => (layout.favourable_offset(filled.price, -distance), LevelRole::Entry),
        };
        GridLevel::new(
            layout.index_if_on_ladder(price),
            price,
            filled.side.opposite(),
            filled.amount,
            role,
        )
    }

    /// Favourable-side escape of a follow grid, if any
    pub fn check_escape(&self, layout: &GridLayout, price: f64) -> Option<EscapeDirection> {
        let RangeSpec::Follow { distance, .. } = self.config.range else {
            return None;
        };
        let margin = distance as f64 * layout.interval;
        match layout.direction {
            Direction::Long if price > layout.upper + margin => Some(EscapeDirection::Up),
            Direction::Short if price < layout.lower - margin => Some(EscapeDirection::Down),
            _ => None,
        }
    }

    /// Re-centre a follow grid around `price`
    ///
    /// Reverse and take-profit orders back filled exposure and are kept as-is.
    /// Entry orders survive only where the new ladder has the same price.
    pub fn recenter(
        &self,
        existing: &[GridLevel],
        price: f64,
    ) -> GridResult<(GridLayout, Vec<GridLevel>)> {
        let layout = self.layout(price)?;
        let decimals = layout.price_decimals;
        let ladder = self.ladder(&layout);
        let ladder_keys: HashSet<LevelKey> = ladder.iter().map(|l| l.key(decimals)).collect();

        let mut target: Vec<GridLevel> = existing
            .iter()
            .filter(|l| {
                l.is_live() && (l.role != LevelRole::Entry || ladder_keys.contains(&l.key(decimals)))
            })
            .cloned()
            .map(|mut l| {
                l.index = layout.index_if_on_ladder(l.price);
                l
            })
            .collect();
        let occupied: HashSet<LevelKey> = target.iter().map(|l| l.key(decimals)).collect();

        for level in ladder {
            if !occupied.contains(&level.key(decimals)) {
                target.push(level);
            }
        }
        sort_levels(&mut target);
        Ok((layout, target))
    }
}

/// Ascending price, buys before sells at the same price
pub fn sort_levels(levels: &mut [GridLevel]) {
    levels.sort_by(|a, b| {
        a.price
            .partial_cmp(&b.price)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| side_rank(a.side).cmp(&side_rank(b.side)))
    });
}

fn side_rank(side: OrderSide) -> u8 {
    match side {
        OrderSide::Buy => 0,
        OrderSide::Sell => 1,
    }
}
