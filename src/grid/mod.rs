//! Grid trading engine for leveraged perpetual markets
//!
//! A grid instance keeps a ladder of limit orders across a price range,
//! places a reverse order for every fill, and runs a set of protection
//! modes on top of the plain oscillation strategy.
//!
//! # Architecture
//!
//! - [`config`] - grid configuration, validated into a tagged variant
//! - [`types`] - levels, orders, fills and positions
//! - [`errors`] - the engine's error taxonomy
//! - [`state`] - level set and the mode machine
//! - [`strategy`] - ladder geometry, target sets and reverse orders
//! - [`executor`] - exchange trait and the shared engine context
//! - [`retry`] - backoff wrapper for adapter calls
//! - [`paper`] - simulated exchange used by the CLI and the tests
//! - [`order_ops`] - batched placement, cancellation and fill bookkeeping
//! - [`tracker`] - position and per-cycle pnl
//! - [`health`] - periodic diff of local levels against open orders
//! - [`protection`] - scalping, capital protection, take profit and price lock
//! - [`reset`] - flatten and start a new cycle
//! - [`coordinator`] - serialized event loop tying everything together
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use perp_grid_engine::grid::{
//!     EngineContext, EngineSettings, GridConfig, GridCoordinator, PaperExchange, PaperSettings,
//!     RetryPolicy,
//! };
//!
//! let config = GridConfig::fixed_long("BTC", 50_000.0, 100_000.0, 100.0, 0.01);
//! let exchange = Arc::new(PaperExchange::new("BTC", 99_845.5, PaperSettings::default()));
//! let ctx = EngineContext::new(exchange, config, RetryPolicy::default());
//! let coordinator = GridCoordinator::initialize(ctx, EngineSettings::default()).await?;
//! let handle = coordinator.start()?;
//! // ...
//! let summary = handle.stop().await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod executor;
pub mod health;
pub mod order_ops;
pub mod paper;
pub mod protection;
pub mod reset;
pub mod retry;
pub mod state;
pub mod strategy;
pub mod tracker;
pub mod types;

pub use config::{Direction, GridConfig, GridType, MarginMode, RangeSpec, RawGridConfig};
pub use coordinator::{CoordinatorHandle, EngineEvent, EngineSettings, GridCoordinator, GridSummary};
pub use errors::{GridError, GridResult};
pub use executor::{EngineContext, GridExchange};
pub use paper::{PaperExchange, PaperSettings};
pub use retry::RetryPolicy;
pub use state::{GridMode, GridState};
pub use strategy::{GridLayout, GridStrategyEngine};
pub use types::{Fill, GridLevel, LevelRole, LevelState, OrderSide, Position, Ticker};
