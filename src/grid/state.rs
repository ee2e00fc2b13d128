//! Grid state: level set, operating mode and price bounds

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

use super::errors::{GridError, GridResult};
use super::strategy::{sort_levels, GridLayout};
use super::types::{GridLevel, LevelKey, LevelRole, LevelState, OrderSide};

/// Operating mode of a grid instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GridMode {
    Normal,
    Scalping,
    CapitalProtection,
    TakeProfit,
    PriceLocked,
    /// Stop-loss fired, closing out
    StopLoss,
    Resetting,
}

impl GridMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GridMode::Normal => "normal",
            GridMode::Scalping => "scalping",
            GridMode::CapitalProtection => "capital_protection",
            GridMode::TakeProfit => "take_profit",
            GridMode::PriceLocked => "price_locked",
            GridMode::StopLoss => "stop_loss",
            GridMode::Resetting => "resetting",
        }
    }

    /// Modes that a price lock may freeze
    pub fn is_lockable(&self) -> bool {
        matches!(
            self,
            GridMode::Normal | GridMode::Scalping | GridMode::CapitalProtection
        )
    }

    /// Modes that conclude through a reset
    pub fn is_protective(&self) -> bool {
        matches!(
            self,
            GridMode::Scalping
                | GridMode::CapitalProtection
                | GridMode::TakeProfit
                | GridMode::StopLoss
        )
    }
}

impl std::fmt::Display for GridMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeTransition {
    pub from: GridMode,
    pub to: GridMode,
    pub at: DateTime<Utc>,
}

const MAX_HISTORY: usize = 256;

/// Single active mode with its entry time and the mode a lock suspended
#[derive(Debug, Clone, Serialize)]
pub struct ModeMachine {
    current: GridMode,
    entered_at: DateTime<Utc>,
    locked_from: Option<GridMode>,
    history: Vec<ModeTransition>,
}

impl Default for ModeMachine {
    fn default() -> Self {
        Self {
            current: GridMode::Normal,
            entered_at: Utc::now(),
            locked_from: None,
            history: Vec::new(),
        }
    }
}

impl ModeMachine {
    pub fn current(&self) -> GridMode {
        self.current
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    /// Mode a price lock will restore
    pub fn locked_from(&self) -> Option<GridMode> {
        self.locked_from
    }

    pub fn history(&self) -> &[ModeTransition] {
        &self.history
    }

    /// Whether `from -> to` is an edge of the mode graph
    pub fn is_allowed(from: GridMode, to: GridMode, locked_from: Option<GridMode>) -> bool {
        use GridMode::*;
        match (from, to) {
            (Normal, Scalping) | (Normal, CapitalProtection) | (Normal, TakeProfit) => true,
            // escalation once price keeps moving against a scalping grid
            (Scalping, CapitalProtection) => true,
            (Normal, StopLoss) | (Scalping, StopLoss) | (CapitalProtection, StopLoss) => true,
            (f, PriceLocked) => f.is_lockable(),
            (PriceLocked, t) => locked_from == Some(t),
            (f, Resetting) => f.is_protective(),
            (Resetting, Normal) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, to: GridMode) -> GridResult<()> {
        let from = self.current;
        if !Self::is_allowed(from, to, self.locked_from) {
            return Err(GridError::ProtectionInvariantViolation(format!(
                "illegal mode transition {} -> {}",
                from, to
            )));
        }
        match to {
            GridMode::PriceLocked => self.locked_from = Some(from),
            _ if from == GridMode::PriceLocked => self.locked_from = None,
            _ => {}
        }
        let now = Utc::now();
        self.current = to;
        self.entered_at = now;
        self.history.push(ModeTransition { from, to, at: now });
        if self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }
        warn!("Grid mode {} -> {}", from, to);
        Ok(())
    }

    /// Leave a price lock, restoring the suspended mode
    pub fn unlock(&mut self) -> GridResult<GridMode> {
        let prior = self.locked_from.ok_or_else(|| {
            GridError::ProtectionInvariantViolation("unlock without an active price lock".into())
        })?;
        self.transition(prior)?;
        Ok(prior)
    }
}

/// Everything the coordinator mutates for one grid cycle
#[derive(Debug, Clone, Serialize)]
pub struct GridState {
    pub layout: GridLayout,
    /// Level set ordered by price
    pub levels: Vec<GridLevel>,
    pub mode: ModeMachine,
    pub last_price: Option<f64>,
    pub cycle_started_at: DateTime<Utc>,
}

impl GridState {
    pub fn new(layout: GridLayout, levels: Vec<GridLevel>) -> Self {
        let mut state = Self {
            layout,
            levels: Vec::new(),
            mode: ModeMachine::default(),
            last_price: None,
            cycle_started_at: Utc::now(),
        };
        for level in levels {
            state.insert_level(level);
        }
        state
    }

    /// Next cycle's state, carrying the mode history across the reset
    pub fn next_cycle(&self, layout: GridLayout, levels: Vec<GridLevel>) -> Self {
        let mut next = Self::new(layout, levels);
        next.mode = self.mode.clone();
        next.last_price = self.last_price;
        next
    }

    pub fn mode(&self) -> GridMode {
        self.mode.current()
    }

    fn decimals(&self) -> u32 {
        self.layout.price_decimals
    }

    /// Insert a level unless a live level already holds its (price, side)
    pub fn insert_level(&mut self, level: GridLevel) -> bool {
        let key = level.key(self.decimals());
        if self.live_level_by_key(&key).is_some() {
            warn!(
                "Refusing duplicate {} level at {}: a live order already holds it",
                level.side, level.price
            );
            return false;
        }
        self.levels.push(level);
        sort_levels(&mut self.levels);
        true
    }

    pub fn live_level_by_key(&self, key: &LevelKey) -> Option<usize> {
        let decimals = self.decimals();
        self.levels
            .iter()
            .position(|l| l.is_live() && &l.key(decimals) == key)
    }

    /// Level holding `order_id`, live or replaced
    pub fn level_by_order_id(&self, order_id: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|l| l.order_id.as_deref() == Some(order_id))
            .or_else(|| self.levels.iter().position(|l| l.owns_order(order_id)))
    }

    /// Live order id -> level position
    pub fn live_order_index(&self) -> HashMap<String, usize> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.state == LevelState::Placed)
            .filter_map(|(i, l)| l.order_id.clone().map(|id| (id, i)))
            .collect()
    }

    pub fn live_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter().filter(|l| l.is_live())
    }

    pub fn count(&self, state: LevelState) -> usize {
        self.levels.iter().filter(|l| l.state == state).count()
    }

    pub fn count_live_side(&self, side: OrderSide) -> usize {
        self.live_levels().filter(|l| l.side == side).count()
    }

    pub fn take_profit_level(&self) -> Option<usize> {
        self.levels
            .iter()
            .position(|l| l.is_live() && l.role == LevelRole::TakeProfit)
    }

    /// Drop filled and canceled levels
    pub fn prune_terminal(&mut self) {
        self.levels.retain(|l| l.is_live());
    }

    /// Sum of amounts resting on the exchange
    pub fn placed_amount(&self) -> f64 {
        self.levels
            .iter()
            .filter(|l| l.state == LevelState::Placed)
            .map(|l| l.amount)
            .sum()
    }

    /// No two live levels share a (price, side)
    pub fn has_unique_live_keys(&self) -> bool {
        let decimals = self.decimals();
        let mut seen = std::collections::HashSet::new();
        self.live_levels().all(|l| seen.insert(l.key(decimals)))
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

    #[test]
    fn test_mode_graph_edges() {
        use GridMode::*;
        assert!(ModeMachine::is_allowed(Normal, Scalping, None));
        assert!(ModeMachine::is_allowed(Scalping, CapitalProtection, None));
        assert!(ModeMachine::is_allowed(TakeProfit, Resetting, None));
        assert!(!ModeMachine::is_allowed(Normal, Resetting, None));
        assert!(!ModeMachine::is_allowed(Scalping, Normal, None));
        assert!(!ModeMachine::is_allowed(TakeProfit, PriceLocked, None));
        assert!(!ModeMachine::is_allowed(CapitalProtection, Scalping, None));
        assert!(ModeMachine::is_allowed(CapitalProtection, StopLoss, None));
        assert!(ModeMachine::is_allowed(StopLoss, Resetting, None));
        assert!(!ModeMachine::is_allowed(StopLoss, Normal, None));
        assert!(!ModeMachine::is_allowed(TakeProfit, StopLoss, None));
        assert!(!ModeMachine::is_allowed(StopLoss, PriceLocked, None));
        assert!(ModeMachine::is_allowed(PriceLocked, Scalping, Some(Scalping)));
        assert!(!ModeMachine::is_allowed(PriceLocked, Normal, Some(Scalping)));
    }

    #[test]
    fn test_price_lock_restores_prior_mode() {
        let mut machine = ModeMachine::default();
        machine.transition(GridMode::Scalping).unwrap();
        machine.transition(GridMode::PriceLocked).unwrap();
        assert_eq!(machine.locked_from(), Some(GridMode::Scalping));

        let restored = machine.unlock().unwrap();
        assert_eq!(restored, GridMode::Scalping);
        assert_eq!(machine.current(), GridMode::Scalping);
        assert_eq!(machine.locked_from(), None);
        assert_eq!(machine.history().len(), 3);
    }

    #[test]
    fn test_illegal_transition_is_invariant_violation() {
        let mut machine = ModeMachine::default();
        let err = machine.transition(GridMode::Resetting).unwrap_err();
        assert!(matches!(err, GridError::ProtectionInvariantViolation(_)));
        assert_eq!(machine.current(), GridMode::Normal);
        assert!(machine.unlock().is_err());
    }

    #[test]
    fn test_duplicate_live_level_refused() {
        let mut state = GridState::new(layout(), Vec::new());
        assert!(state.insert_level(GridLevel::new(1, 100.0, OrderSide::Buy, 1.0, LevelRole::Entry)));
        assert!(!state.insert_level(GridLevel::new(1, 100.001, OrderSide::Buy, 1.0, LevelRole::Entry)));
        assert!(state.insert_level(GridLevel::new(1, 100.0, OrderSide::Sell, 1.0, LevelRole::Reverse)));
        assert!(state.has_unique_live_keys());

        // once terminal, the slot can be reused
        state.levels[0].state = LevelState::Filled;
        assert!(state.insert_level(GridLevel::new(1, 100.0, OrderSide::Buy, 1.0, LevelRole::Entry)));
        state.prune_terminal();
        assert_eq!(state.levels.len(), 2);
    }

    #[test]
    fn test_levels_stay_ordered() {
        let mut state = GridState::new(layout(), Vec::new());
        state.insert_level(GridLevel::new(3, 120.0, OrderSide::Buy, 1.0, LevelRole::Entry));
        state.insert_level(GridLevel::new(1, 100.0, OrderSide::Buy, 1.0, LevelRole::Entry));
        state.insert_level(GridLevel::new(2, 110.0, OrderSide::Buy, 1.0, LevelRole::Entry));
        let prices: Vec<f64> = state.levels.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![100.0, 110.0, 120.0]);
    }
}
