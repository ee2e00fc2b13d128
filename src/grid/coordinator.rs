//! Grid coordinator: the single serialized mutation path of a grid instance
//!
//! Every market event, fill and timer tick goes through
//! [`GridCoordinator::handle_event`], one at a time. Protection managers are
//! evaluated in priority order on each price and after each fill; when none
//! of them fires, the level set is synced to the strategy's target.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::config::{GridType, RangeSpec};
use super::errors::{GridError, GridResult};
use super::executor::EngineContext;
use super::health::OrderHealthChecker;
use super::order_ops::{FillOutcome, OrderOperations};
use super::protection::{
    cycle_apr, AnomalyVerdict, ProtectionCounters, ProtectionDecision, ProtectionInputs,
    ProtectionManagers, StopLossAction,
};
use super::reset::{GridResetManager, ResetReason};
use super::retry::RetryPolicy;
use super::state::{GridMode, GridState};
use super::strategy::GridStrategyEngine;
use super::tracker::{CycleTotals, PositionTracker};
use super::types::{Fill, GridLevel, LevelRole, LevelState, Position, Ticker, UserEvent};

/// Engine timers and execution limits
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Adapter calls in flight per batch
    #[serde(default = "default_max_concurrent_orders")]
    pub max_concurrent_orders: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Call `set_margin_mode` at start when the adapter supports it
    #[serde(default)]
    pub apply_margin_settings: bool,
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    300
}

fn default_max_concurrent_orders() -> usize {
    8
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            health_check_interval_secs: default_health_check_interval(),
            max_concurrent_orders: default_max_concurrent_orders(),
            retry: RetryPolicy::default(),
            apply_margin_settings: false,
        }
    }
}

/// Input to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Ticker(Ticker),
    Fill(Fill),
    OrderCanceled { order_id: String },
    HealthCheckTick,
    ReconcileTick,
}

impl From<UserEvent> for EngineEvent {
    fn from(event: UserEvent) -> Self {
        match event {
            UserEvent::Fill(fill) => EngineEvent::Fill(fill),
            UserEvent::OrderCanceled { order_id } => EngineEvent::OrderCanceled { order_id },
        }
    }
}

/// Serialisable status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct GridSummary {
    pub symbol: String,
    pub grid_type: GridType,
    pub mode: GridMode,
    pub lower: f64,
    pub upper: f64,
    pub interval: f64,
    pub level_count: u32,
    pub last_price: Option<f64>,
    pub levels_pending: usize,
    pub levels_placed: usize,
    pub position: Position,
    pub cycle: CycleTotals,
    pub unrealized_pnl: f64,
    pub initial_capital: f64,
    pub protections: ProtectionCounters,
    pub resets: u32,
    pub pending_reset: Option<ResetReason>,
    pub queued_fills: usize,
    pub halted: bool,
    pub started_at: DateTime<Utc>,
}

pub struct GridCoordinator {
    ctx: EngineContext,
    settings: EngineSettings,
    strategy: GridStrategyEngine,
    ops: OrderOperations,
    tracker: PositionTracker,
    health: OrderHealthChecker,
    protection: ProtectionManagers,
    resets: GridResetManager,
    state: GridState,
    initial_capital: f64,
    pending_reset: Option<ResetReason>,
    /// Fills received while price-locked, applied on unlock
    queued_fills: VecDeque<Fill>,
    escaped_since: Option<DateTime<Utc>>,
    halted: Option<GridError>,
    ticker_rx: Option<UnboundedReceiver<Ticker>>,
    user_rx: Option<UnboundedReceiver<UserEvent>>,
    started_at: DateTime<Utc>,
}

impl GridCoordinator {
    /// Build the grid from the exchange's current state and place the initial ladder
    pub async fn initialize(ctx: EngineContext, settings: EngineSettings) -> GridResult<Self> {
        let config = ctx.config.clone();
        let symbol = config.symbol.clone();
        info!(
            "Initializing {:?} grid on {} via {}",
            config.grid_type,
            symbol,
            ctx.exchange.name()
        );

        if !ctx.exchange.supports_margin_mode_set() {
            warn!(
                "{} cannot set margin mode: configure {:?} margin with {}x leverage on {} manually",
                ctx.exchange.name(),
                config.margin_mode,
                config.leverage,
                symbol
            );
        } else if settings.apply_margin_settings {
            ctx.exchange
                .set_margin_mode(&symbol, config.margin_mode, config.leverage)
                .await?;
            info!("Set {:?} margin with {}x leverage on {}", config.margin_mode, config.leverage, symbol);
        }

        // subscribe first so fills of marketable ladder orders are not missed
        let user_rx = ctx.exchange.subscribe_user_data(&symbol).await?;
        let ticker_rx = ctx.exchange.subscribe_ticker(&symbol).await?;

        let strategy = GridStrategyEngine::new(config.clone());
        let ops = OrderOperations::new(ctx.clone(), settings.max_concurrent_orders);
        let health = OrderHealthChecker::new(ops.clone(), config.precision.amount_epsilon());
        let mut tracker = PositionTracker::new(&config);
        tracker.refresh(&ctx).await?;
        if !tracker.position().is_flat() {
            warn!(
                "Starting with an open position on {}: {:+} @ {}",
                symbol,
                tracker.position().signed_size(),
                tracker.position().entry_price
            );
        }

        let initial_capital = ctx.fetch_collateral().await?;
        let price = ctx.fetch_price().await?;
        let (layout, ladder) = strategy.compute(price)?;
        info!(
            "Grid on {}: {} levels in [{}, {}] every {}, price {}, capital {:.2} {}",
            symbol,
            layout.count,
            layout.lower,
            layout.upper,
            layout.interval,
            price,
            initial_capital,
            config.collateral_currency
        );
        let mut state = GridState::new(layout, ladder);
        state.last_price = Some(price);
        ops.adopt_open_orders(&mut state).await?;
        let report = ops.place_pending(&mut state).await?;
        info!(
            "Initial ladder on {}: {} placed, {} rejected, {} deferred",
            symbol, report.placed, report.rejected, report.deferred
        );

        let mut coordinator = Self {
            protection: ProtectionManagers::from_config(&config),
            resets: GridResetManager::new(ctx.clone()),
            ctx,
            settings,
            strategy,
            ops,
            tracker,
            health,
            state,
            initial_capital,
            pending_reset: None,
            queued_fills: VecDeque::new(),
            escaped_since: None,
            halted: None,
            ticker_rx: Some(ticker_rx),
            user_rx: Some(user_rx),
            started_at: Utc::now(),
        };
        coordinator.process_pending_fills().await?;
        Ok(coordinator)
    }

    pub fn state(&self) -> &GridState {
        &self.state
    }

    pub fn mode(&self) -> GridMode {
        self.state.mode()
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn summary(&self) -> GridSummary {
        let layout = &self.state.layout;
        GridSummary {
            symbol: self.ctx.symbol().to_string(),
            grid_type: self.ctx.config.grid_type,
            mode: self.state.mode(),
            lower: layout.lower,
            upper: layout.upper,
            interval: layout.interval,
            level_count: layout.count,
            last_price: self.state.last_price,
            levels_pending: self.state.count(LevelState::Pending),
            levels_placed: self.state.count(LevelState::Placed),
            position: self.tracker.position().clone(),
            cycle: self.tracker.cycle(),
            unrealized_pnl: self
                .state
                .last_price
                .map(|p| self.tracker.unrealized_pnl(p))
                .unwrap_or(0.0),
            initial_capital: self.initial_capital,
            protections: self.protection.counters(),
            resets: self.resets.completed(),
            pending_reset: self.pending_reset,
            queued_fills: self.queued_fills.len(),
            halted: self.halted.is_some(),
            started_at: self.started_at,
        }
    }

    /// Process one event; fatal errors halt the engine
    pub async fn handle_event(&mut self, event: EngineEvent) -> GridResult<()> {
        if let Some(e) = &self.halted {
            return Err(e.clone());
        }
        let result = self.dispatch(event).await;
        self.state.prune_terminal();
        if let Err(e) = &result {
            if e.is_fatal() {
                self.halt(e.clone()).await;
            }
        }
        result
    }

    /// Handle every user event already delivered by the subscription
    pub async fn process_pending_fills(&mut self) -> GridResult<usize> {
        let mut handled = 0;
        loop {
            let next = match self.user_rx.as_mut() {
                Some(rx) => rx.try_recv().ok(),
                None => None,
            };
            let Some(event) = next else { break };
            self.handle_event(event.into()).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn dispatch(&mut self, event: EngineEvent) -> GridResult<()> {
        if let EngineEvent::Ticker(ticker) = &event {
            if ticker.symbol != self.ctx.symbol() {
                return Ok(());
            }
            self.state.last_price = Some(ticker.last);
        }

        let deferred = self.retry_pending_reset().await;
        if let Err(e) = &deferred {
            if e.is_fatal() {
                return deferred;
            }
        }

        let result = match event {
            EngineEvent::Ticker(ticker) => self.on_price(ticker.last).await,
            EngineEvent::Fill(fill) => self.on_fill(fill).await,
            EngineEvent::OrderCanceled { order_id } => {
                self.on_order_canceled(&order_id);
                Ok(())
            }
            EngineEvent::HealthCheckTick => self.on_health_check().await,
            EngineEvent::ReconcileTick => self.on_reconcile().await,
        };
        deferred.and(result)
    }

    async fn retry_pending_reset(&mut self) -> GridResult<()> {
        match self.pending_reset {
            Some(reason) if self.state.mode() != GridMode::PriceLocked => {
                info!("Retrying deferred reset ({})", reason);
                self.run_reset(reason).await
            }
            _ => Ok(()),
        }
    }

    async fn run_reset(&mut self, reason: ResetReason) -> GridResult<()> {
        self.pending_reset = Some(reason);
        let outcome = self
            .resets
            .reset(
                reason,
                &mut self.state,
                &self.ops,
                &mut self.tracker,
                &self.strategy,
            )
            .await;
        match outcome {
            Ok(outcome) => {
                self.pending_reset = None;
                if let Some(capital) = outcome.initial_capital {
                    self.initial_capital = capital;
                }
                self.protection.reset_cycle();
                self.escaped_since = None;
                self.queued_fills.clear();
                Ok(())
            }
            Err(e) => {
                error!("Reset ({}) failed, staying in {} mode: {}", reason, self.state.mode(), e);
                Err(e)
            }
        }
    }

    fn evaluate(&mut self, price: f64) -> ProtectionDecision {
        let inputs = ProtectionInputs {
            mode: self.state.mode(),
            price,
            layout: &self.state.layout,
            capital_delta: self.tracker.capital_delta(price),
            initial_capital: self.initial_capital,
            now: Utc::now(),
        };
        self.protection.evaluate(inputs)
    }

    /// Carry out a protection decision; true when it changed the mode or froze the grid
    async fn apply_decision(&mut self, decision: ProtectionDecision, price: f64) -> GridResult<bool> {
        match decision {
            ProtectionDecision::None => Ok(false),
            ProtectionDecision::Hold => Ok(true),
            ProtectionDecision::Lock => {
                self.state.mode.transition(GridMode::PriceLocked)?;
                warn!("Price lock engaged at {}, grid frozen", price);
                Ok(true)
            }
            ProtectionDecision::Unlock => {
                let prior = self.state.mode.unlock()?;
                info!("Price {} back in range, resuming {} mode", price, prior);
                self.drain_queued_fills().await?;
                Ok(true)
            }
            ProtectionDecision::EnterTakeProfit => {
                self.state.mode.transition(GridMode::TakeProfit)?;
                self.run_reset(ResetReason::TakeProfit).await?;
                Ok(true)
            }
            ProtectionDecision::EnterCapitalProtection => {
                if self.state.mode() == GridMode::Scalping {
                    self.ops
                        .cancel_where(&mut self.state, |l| l.role == LevelRole::TakeProfit)
                        .await?;
                }
                self.state.mode.transition(GridMode::CapitalProtection)?;
                warn!(
                    "Capital protection at {}: holding {:+} until break-even",
                    price,
                    self.tracker.position().signed_size()
                );
                Ok(true)
            }
            ProtectionDecision::RecoverAndReset => {
                self.run_reset(ResetReason::CapitalRecovered).await?;
                Ok(true)
            }
            ProtectionDecision::EnterScalping => {
                self.state.mode.transition(GridMode::Scalping)?;
                let canceled = self
                    .ops
                    .cancel_where(&mut self.state, |l| l.role == LevelRole::Reverse)
                    .await?;
                info!("Scalping at {}: {} reverse orders cancelled", price, canceled);
                self.refresh_take_profit().await?;
                Ok(true)
            }
            ProtectionDecision::ExitScalping => {
                info!(
                    "Price {} rebounded above the scalping trigger, re-arming with {:+} held",
                    price,
                    self.tracker.position().signed_size()
                );
                self.run_reset(ResetReason::ScalpingRebound).await?;
                Ok(true)
            }
            ProtectionDecision::EnterStopLoss => {
                self.stop_loss(price).await?;
                Ok(true)
            }
        }
    }

    /// Close out on a stop-loss: reset when the cycle earned enough, stop otherwise
    async fn stop_loss(&mut self, price: f64) -> GridResult<()> {
        let Some(stop_loss) = self.protection.stop_loss.as_ref() else {
            return Ok(());
        };
        let totals = self.tracker.cycle();
        let elapsed = (Utc::now() - self.state.cycle_started_at).num_seconds();
        let apr = cycle_apr(totals.realized_pnl - totals.fees, self.initial_capital, elapsed);
        let action = stop_loss.action(apr);
        warn!(
            "Stop-loss at {}: cycle APR {:.2}% against threshold {}%, {:?}",
            price,
            apr,
            stop_loss.apr_threshold(),
            action
        );
        if self.state.mode() != GridMode::StopLoss {
            self.state.mode.transition(GridMode::StopLoss)?;
        }
        match action {
            StopLossAction::Reset => self.run_reset(ResetReason::StopLoss).await,
            StopLossAction::Stop => {
                self.resets
                    .close_out(&mut self.state, &self.ops, &mut self.tracker)
                    .await?;
                Err(GridError::StoppedOut(format!(
                    "{} closed at {} with cycle APR {:.2}%",
                    self.ctx.symbol(),
                    price,
                    apr
                )))
            }
        }
    }

    async fn on_price(&mut self, price: f64) -> GridResult<()> {
        let decision = self.evaluate(price);
        if self.apply_decision(decision, price).await? {
            return Ok(());
        }
        match self.state.mode() {
            GridMode::Normal => {
                if !self.check_follow(price).await? {
                    self.sync_target().await?;
                }
            }
            GridMode::Scalping => {
                self.sync_target().await?;
                self.refresh_take_profit().await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_fill(&mut self, fill: Fill) -> GridResult<()> {
        if fill.symbol != self.ctx.symbol() {
            return Ok(());
        }
        if self.state.mode() == GridMode::PriceLocked {
            debug!("Price locked, queueing fill for order {}", fill.order_id);
            self.queued_fills.push_back(fill);
            return Ok(());
        }
        let fill_price = fill.price;
        let resets = self.resets.completed();
        self.process_fill(fill).await?;
        if self.resets.completed() != resets {
            // fresh cycle, evaluated on the next price
            return Ok(());
        }
        let price = self.state.last_price.unwrap_or(fill_price);
        let decision = self.evaluate(price);
        self.apply_decision(decision, price).await?;
        Ok(())
    }

    async fn process_fill(&mut self, fill: Fill) -> GridResult<()> {
        let outcome = self.ops.apply_fill(&mut self.state, &mut self.tracker, &fill);
        let mode = self.state.mode();
        match outcome {
            FillOutcome::Untracked => Ok(()),
            FillOutcome::Partial(level) => {
                if mode == GridMode::Scalping && level.role != LevelRole::TakeProfit {
                    self.refresh_take_profit().await?;
                }
                Ok(())
            }
            FillOutcome::Completed(level) => {
                if let Some(live) = level.order_id.as_deref().filter(|id| *id != fill.order_id) {
                    info!(
                        "Replaced order {} filled late, cancelling its successor {}",
                        fill.order_id, live
                    );
                    if let Err(e) = self.ops.cancel_order_id(live).await {
                        warn!("Cancel of {} failed, left to the health check: {}", live, e);
                    }
                }
                self.after_completed(level, mode, fill.price).await
            }
        }
    }

    async fn after_completed(&mut self, level: GridLevel, mode: GridMode, price: f64) -> GridResult<()> {
        match mode {
            GridMode::Normal => self.place_reverse(&level).await,
            GridMode::Scalping if level.role == LevelRole::TakeProfit => {
                info!("Scalping take-profit filled at {}", price);
                self.run_reset(ResetReason::ScalpingTakeProfit).await
            }
            GridMode::Scalping => self.refresh_take_profit().await,
            _ => {
                debug!("{} fill in {} mode, no follow-up order", level.side, mode);
                Ok(())
            }
        }
    }

    async fn drain_queued_fills(&mut self) -> GridResult<()> {
        if !self.queued_fills.is_empty() {
            info!("Applying {} fills queued during price lock", self.queued_fills.len());
        }
        while let Some(fill) = self.queued_fills.pop_front() {
            self.process_fill(fill).await?;
        }
        Ok(())
    }

    async fn place_reverse(&mut self, filled: &GridLevel) -> GridResult<()> {
        let reverse = self.strategy.reverse_level(&self.state.layout, filled);
        debug!(
            "{} {} @ {} filled, placing {} @ {}",
            filled.side, filled.amount, filled.price, reverse.side, reverse.price
        );
        if self.state.insert_level(reverse) {
            self.ops.place_pending(&mut self.state).await?;
        }
        Ok(())
    }

    /// Keep exactly one take-profit order matching the position
    async fn refresh_take_profit(&mut self) -> GridResult<()> {
        let Some(scalping) = self.protection.scalping.as_ref() else {
            return Ok(());
        };
        let precision = self.ctx.config.precision;
        let desired = self.tracker.break_even_price().and_then(|be| {
            scalping.take_profit_level(&self.state.layout, &precision, self.tracker.position(), be)
        });

        let decimals = self.state.layout.price_decimals;
        if let Some(i) = self.state.take_profit_level() {
            let current = &self.state.levels[i];
            let unchanged = desired.as_ref().is_some_and(|d| {
                d.key(decimals) == current.key(decimals)
                    && (d.amount - current.remaining()).abs() <= precision.amount_epsilon()
            });
            if unchanged {
                return Ok(());
            }
            self.ops
                .cancel_where(&mut self.state, |l| l.role == LevelRole::TakeProfit)
                .await?;
            if self.state.take_profit_level().is_some() {
                warn!("Outdated take-profit order still live, retrying on next event");
                return Ok(());
            }
        }

        if let Some(level) = desired {
            info!("Take-profit {} {} @ {}", level.side, level.amount, level.price);
            if self.state.insert_level(level) {
                self.ops.place_pending(&mut self.state).await?;
            }
        }
        Ok(())
    }

    async fn sync_target(&mut self) -> GridResult<()> {
        let target = self
            .strategy
            .target_levels(&self.state.layout, self.state.mode(), &self.state.levels);
        self.ops.sync(&mut self.state, target).await?;
        Ok(())
    }

    /// Re-centre a follow grid once price has escaped for the timeout
    async fn check_follow(&mut self, price: f64) -> GridResult<bool> {
        let RangeSpec::Follow { timeout_secs, .. } = self.ctx.config.range else {
            return Ok(false);
        };
        let Some(direction) = self.strategy.check_escape(&self.state.layout, price) else {
            if self.escaped_since.take().is_some() {
                debug!("Price {} back within follow range", price);
            }
            return Ok(false);
        };

        let now = Utc::now();
        let since = *self.escaped_since.get_or_insert(now);
        let escaped_for = (now - since).num_seconds();
        if escaped_for < timeout_secs as i64 {
            return Ok(false);
        }
        info!(
            "Price {} escaped {:?} for {}s, re-centring follow grid",
            price, direction, escaped_for
        );
        let (layout, target) = self.strategy.recenter(&self.state.levels, price)?;
        self.state.layout = layout;
        self.ops.sync(&mut self.state, target).await?;
        self.escaped_since = None;
        Ok(true)
    }

    fn on_order_canceled(&mut self, order_id: &str) {
        let Some(i) = self.state.level_by_order_id(order_id) else {
            return;
        };
        let level = &mut self.state.levels[i];
        if level.state == LevelState::Placed {
            warn!(
                "Order {} for {} @ {} cancelled externally, re-arming",
                order_id, level.side, level.price
            );
            level.order_id = None;
            level.state = LevelState::Pending;
        }
    }

    async fn on_health_check(&mut self) -> GridResult<()> {
        let mode = self.state.mode();
        if matches!(
            mode,
            GridMode::PriceLocked | GridMode::Resetting | GridMode::TakeProfit | GridMode::StopLoss
        ) {
            debug!("Skipping health check in {} mode", mode);
            return Ok(());
        }
        let allow_placement = mode != GridMode::CapitalProtection;
        self.health.check(&mut self.state, allow_placement).await?;
        Ok(())
    }

    async fn on_reconcile(&mut self) -> GridResult<()> {
        if self.state.mode() == GridMode::PriceLocked {
            // queued fills are already in the exchange position
            debug!(
                "Price locked with {} queued fills, skipping position refresh",
                self.queued_fills.len()
            );
        } else {
            self.tracker.refresh(&self.ctx).await?;
            let size = self.tracker.position().signed_size();
            if let AnomalyVerdict::Halt { previous, current } =
                self.protection.check_position(size, Utc::now())
            {
                return Err(GridError::PositionAnomaly(format!(
                    "position on {} jumped from {:+} to {:+} between reconciles",
                    self.ctx.symbol(),
                    previous,
                    current
                )));
            }
        }
        if let Some(price) = self.state.last_price {
            let decision = self.evaluate(price);
            self.apply_decision(decision, price).await?;
        }
        Ok(())
    }

    async fn halt(&mut self, cause: GridError) {
        error!("Halting grid on {}: {}", self.ctx.symbol(), cause);
        if let Err(e) = self.ops.cancel_all(&mut self.state).await {
            error!("Cancel-all while halting failed: {}", e);
        }
        self.halted = Some(cause);
    }

    /// Cancel orders, reconcile once more and report where the grid stopped
    pub async fn shutdown(&mut self) -> GridSummary {
        info!("Stopping grid on {}", self.ctx.symbol());
        if let Err(e) = self.ops.cancel_all(&mut self.state).await {
            error!("Cancel-all on shutdown failed: {}", e);
        }
        if let Err(e) = self.tracker.refresh(&self.ctx).await {
            error!("Final reconcile failed: {}", e);
        }
        let position = self.tracker.position();
        if !position.is_flat() {
            warn!(
                "Residual position on {}: {:+} @ {} left open",
                self.ctx.symbol(),
                position.signed_size(),
                position.entry_price
            );
        }
        self.state.prune_terminal();

        let summary = self.summary();
        match serde_json::to_string(&summary) {
            Ok(json) => info!("Final grid summary: {}", json),
            Err(e) => warn!("Could not serialise grid summary: {}", e),
        }
        summary
    }

    /// Run the event loop on its own task
    pub fn start(mut self) -> GridResult<CoordinatorHandle> {
        let ticker_rx = self
            .ticker_rx
            .take()
            .ok_or_else(|| GridError::ChannelClosed("ticker stream already consumed".into()))?;
        let user_rx = self
            .user_rx
            .take()
            .ok_or_else(|| GridError::ChannelClosed("user stream already consumed".into()))?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move { self.run(ticker_rx, user_rx, shutdown_rx).await });
        Ok(CoordinatorHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run(
        mut self,
        mut ticker_rx: UnboundedReceiver<Ticker>,
        mut user_rx: UnboundedReceiver<UserEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> GridResult<GridSummary> {
        let mut health_timer = interval(Duration::from_secs(self.settings.health_check_interval_secs.max(1)));
        let mut reconcile_timer = interval(Duration::from_secs(self.settings.reconcile_interval_secs.max(1)));
        // both intervals tick immediately once
        health_timer.tick().await;
        reconcile_timer.tick().await;
        let mut consecutive_errors = 0u32;
        info!("Grid on {} running", self.ctx.symbol());

        let outcome = loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown_rx => break Ok(()),
                Some(user) = user_rx.recv() => EngineEvent::from(user),
                Some(ticker) = ticker_rx.recv() => EngineEvent::Ticker(ticker),
                _ = health_timer.tick() => EngineEvent::HealthCheckTick,
                _ = reconcile_timer.tick() => EngineEvent::ReconcileTick,
            };
            match self.handle_event(event).await {
                Ok(()) => consecutive_errors = 0,
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => {
                    consecutive_errors += 1;
                    error!("Event failed ({} in a row): {}", consecutive_errors, e);
                }
            }
        };

        let summary = self.shutdown().await;
        outcome.map(|_| summary)
    }
}

/// Handle to a running coordinator task
pub struct CoordinatorHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<GridResult<GridSummary>>,
}

impl CoordinatorHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop accepting events, let the current one finish, then clean up
    pub async fn stop(self) -> GridResult<GridSummary> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| GridError::ChannelClosed(format!("grid task ended abnormally: {}", e)))?
    }
}
