//! Exchange abstraction for the grid engine - enables paper trading and tests

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use super::config::{GridConfig, MarginMode};
use super::errors::{GridError, GridResult};
use super::retry::RetryPolicy;
use super::types::{Balance, ExchangePosition, Order, OrderRequest, Ticker, UserEvent};

/// Exchange adapter operations consumed by the engine
///
/// Adapters return [`GridError::Connectivity`] for transient network failures
/// and [`GridError::Rejection`] for orders the venue refuses.
#[async_trait]
pub trait GridExchange: Send + Sync {
    /// Exchange name for logs
    fn name(&self) -> &str;

    async fn create_order(&self, request: &OrderRequest) -> GridResult<Order>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> GridResult<Order>;

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> GridResult<Vec<Order>>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> GridResult<Vec<Order>>;

    async fn get_positions(&self, symbols: Option<&[String]>) -> GridResult<Vec<ExchangePosition>>;

    async fn get_balances(&self) -> GridResult<Vec<Balance>>;

    async fn get_ticker(&self, symbol: &str) -> GridResult<Ticker>;

    async fn subscribe_ticker(&self, symbol: &str) -> GridResult<UnboundedReceiver<Ticker>>;

    /// Fills and order updates for the account
    async fn subscribe_user_data(&self, symbol: &str) -> GridResult<UnboundedReceiver<UserEvent>>;

    async fn subscribe_orderbook(&self, symbol: &str) -> GridResult<UnboundedReceiver<Ticker>> {
        Err(GridError::Unsupported(format!(
            "{} has no orderbook stream for {}",
            self.name(),
            symbol
        )))
    }

    async fn subscribe_trades(&self, symbol: &str) -> GridResult<UnboundedReceiver<Ticker>> {
        Err(GridError::Unsupported(format!(
            "{} has no trade stream for {}",
            self.name(),
            symbol
        )))
    }

    /// Whether margin mode and leverage can be set through the adapter
    fn supports_margin_mode_set(&self) -> bool {
        false
    }

    async fn set_margin_mode(
        &self,
        symbol: &str,
        _mode: MarginMode,
        _leverage: u32,
    ) -> GridResult<()> {
        Err(GridError::Unsupported(format!(
            "{} cannot set margin mode for {}",
            self.name(),
            symbol
        )))
    }
}

/// Shared handles built once at startup and passed to every component
#[derive(Clone)]
pub struct EngineContext {
    pub exchange: Arc<dyn GridExchange>,
    pub config: Arc<GridConfig>,
    pub retry: RetryPolicy,
}

impl EngineContext {
    pub fn new(exchange: Arc<dyn GridExchange>, config: GridConfig, retry: RetryPolicy) -> Self {
        Self {
            exchange,
            config: Arc::new(config),
            retry,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    /// Total of the collateral currency, used as the capital baseline
    pub async fn fetch_collateral(&self) -> GridResult<f64> {
        let exchange = self.exchange.clone();
        let balances = self
            .retry
            .run("get_balances", || {
                let exchange = exchange.clone();
                async move { exchange.get_balances().await }
            })
            .await?;
        balances
            .iter()
            .find(|b| b.currency.eq_ignore_ascii_case(&self.config.collateral_currency))
            .map(|b| b.total)
            .ok_or_else(|| {
                GridError::ReconciliationMismatch(format!(
                    "no {} balance reported by {}",
                    self.config.collateral_currency,
                    self.exchange.name()
                ))
            })
    }

    pub async fn fetch_price(&self) -> GridResult<f64> {
        let exchange = self.exchange.clone();
        let symbol = self.config.symbol.clone();
        let ticker = self
            .retry
            .run("get_ticker", || {
                let exchange = exchange.clone();
                let symbol = symbol.clone();
                async move { exchange.get_ticker(&symbol).await }
            })
            .await?;
        Ok(ticker.last)
    }
}
