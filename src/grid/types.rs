//! Core data types for the grid engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// Lifecycle of a grid level's order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelState {
    /// Wanted, no live order yet
    Pending,
    /// Resting on the exchange
    Placed,
    Filled,
    Canceled,
}

impl LevelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LevelState::Filled | LevelState::Canceled)
    }
}

/// Why a level exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelRole {
    /// Ladder order on the building side (buy for long grids, sell for short)
    Entry,
    /// Order closing a filled entry one or more intervals away
    Reverse,
    /// Scalping exit order sized to the whole position
    TakeProfit,
}

/// Identity of a level: rounded price plus side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LevelKey {
    pub price_ticks: i64,
    pub side: OrderSide,
}

impl LevelKey {
    pub fn new(price: f64, side: OrderSide, price_decimals: u32) -> Self {
        let scale = 10f64.powi(price_decimals as i32);
        Self {
            price_ticks: (price * scale).round() as i64,
            side,
        }
    }
}

/// A single price point of the ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// Grid index (1-based from the adverse end); 0 when off-ladder
    pub index: u32,
    pub price: f64,
    pub side: OrderSide,
    pub amount: f64,
    pub role: LevelRole,
    pub state: LevelState,
    /// Exchange order id while the order is live
    pub order_id: Option<String>,
    /// Cumulative filled amount (partial fills)
    pub filled_amount: f64,
    /// Ids of orders this level replaced; a late fill of one still counts here
    #[serde(default)]
    pub retired_order_ids: Vec<String>,
}

impl GridLevel {
    pub fn new(index: u32, price: f64, side: OrderSide, amount: f64, role: LevelRole) -> Self {
        Self {
            index,
            price,
            side,
            amount,
            role,
            state: LevelState::Pending,
            order_id: None,
            filled_amount: 0.0,
            retired_order_ids: Vec::new(),
        }
    }

    pub fn key(&self, price_decimals: u32) -> LevelKey {
        LevelKey::new(self.price, self.side, price_decimals)
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn mark_placed(&mut self, order_id: String) {
        self.order_id = Some(order_id);
        self.state = LevelState::Placed;
    }

    pub fn mark_canceled(&mut self) {
        self.state = LevelState::Canceled;
    }

    /// Back to Pending for a new order, keeping the old id
    pub fn retire_order(&mut self) {
        if let Some(id) = self.order_id.take() {
            self.retired_order_ids.push(id);
        }
        self.state = LevelState::Pending;
    }

    /// Whether `order_id` is the live order or one this level replaced
    pub fn owns_order(&self, order_id: &str) -> bool {
        self.order_id.as_deref() == Some(order_id) || self.retired_order_ids.iter().any(|id| id == order_id)
    }

    /// Record a (possibly partial) fill, returns true once fully filled
    pub fn record_fill(&mut self, qty: f64, amount_epsilon: f64) -> bool {
        self.filled_amount += qty;
        if self.filled_amount + amount_epsilon >= self.amount {
            self.state = LevelState::Filled;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.amount - self.filled_amount).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

/// Net position for the grid's symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: PositionSide,
    /// Absolute size
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            side: PositionSide::Flat,
            size: 0.0,
            entry_price: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
        }
    }
}

impl Position {
    /// Signed size: positive long, negative short
    pub fn signed_size(&self) -> f64 {
        match self.side {
            PositionSide::Long => self.size,
            PositionSide::Short => -self.size,
            PositionSide::Flat => 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat || self.size == 0.0
    }
}

/// Order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub amount: f64,
    pub filled: f64,
    /// Average execution price, when anything filled
    pub average_price: Option<f64>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Filled,
    Canceled,
}

/// Request handed to the exchange adapter
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub client_id: String,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: OrderSide, amount: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
            reduce_only: false,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn market(symbol: &str, side: OrderSide, amount: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
            reduce_only: false,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Position as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub free: f64,
    pub used: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub timestamp: DateTime<Utc>,
}

/// A fill delivered through the user-data subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

/// Events pushed by the user-data subscription
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Fill(Fill),
    OrderCanceled { order_id: String },
}
