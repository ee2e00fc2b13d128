//! Paper trading exchange
//!
//! Simulates order execution locally: limit orders fill when the price
//! crosses them, marketable orders fill at the current price. Prices are
//! pushed in by the caller (a replay file in the CLI, the test itself in
//! unit tests). Fills are delivered through the user-data subscription.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde::Deserialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use super::errors::{GridError, GridResult};
use super::executor::GridExchange;
use super::tracker::apply_fill;
use super::types::{
    Balance, ExchangePosition, Fill, Order, OrderRequest, OrderSide, OrderStatus, OrderType,
    Position, Ticker, UserEvent,
};

/// Settings for the simulated account
#[derive(Debug, Clone, Deserialize)]
pub struct PaperSettings {
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_currency")]
    pub collateral_currency: String,
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_fee_rate() -> f64 {
    0.0001
}

fn default_leverage() -> u32 {
    10
}

fn default_currency() -> String {
    "USDC".to_string()
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            fee_rate: default_fee_rate(),
            leverage: default_leverage(),
            collateral_currency: default_currency(),
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order: Order,
}

impl PaperOrder {
    /// Whether this resting order executes at `price`
    fn should_fill(&self, price: f64) -> bool {
        if self.order.status != OrderStatus::Open {
            return false;
        }
        match (self.order.side, self.order.price) {
            (OrderSide::Buy, Some(limit)) => price <= limit,
            (OrderSide::Sell, Some(limit)) => price >= limit,
            (_, None) => true,
        }
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    price: f64,
    orders: BTreeMap<u64, PaperOrder>,
    position: Position,
    /// Wallet balance: deposits plus realized pnl minus fees
    wallet: f64,
    next_id: u64,
    ticker_subs: Vec<UnboundedSender<Ticker>>,
    user_subs: Vec<UnboundedSender<UserEvent>>,
    fail_next: u32,
    min_amount: Option<f64>,
    creates: u32,
    cancels: u32,
}

impl PaperBook {
    fn take_failure(&mut self, op: &str) -> GridResult<()> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(GridError::Connectivity(format!("paper: injected failure in {}", op)));
        }
        Ok(())
    }

    fn execute(&mut self, id: u64, price: f64, fee_rate: f64) -> Option<Fill> {
        let paper = self.orders.get_mut(&id)?;
        let qty = paper.order.amount - paper.order.filled;
        paper.order.filled = paper.order.amount;
        paper.order.average_price = Some(price);
        paper.order.status = OrderStatus::Filled;
        let fill = Fill {
            order_id: paper.order.id.clone(),
            symbol: paper.order.symbol.clone(),
            side: paper.order.side,
            price,
            amount: qty,
            fee: price * qty * fee_rate,
            timestamp: Utc::now(),
        };
        self.orders.remove(&id);

        let realized = apply_fill(&mut self.position, fill.side, fill.price, fill.amount);
        self.wallet += realized - fill.fee;
        self.user_subs
            .retain(|tx| tx.send(UserEvent::Fill(fill.clone())).is_ok());
        debug!(
            "paper fill {} {} {} @ {}",
            fill.order_id, fill.side, fill.amount, fill.price
        );
        Some(fill)
    }

    fn unrealized(&self) -> f64 {
        if self.position.is_flat() {
            return 0.0;
        }
        (self.price - self.position.entry_price) * self.position.signed_size()
    }
}

/// Simulated exchange for a single symbol
pub struct PaperExchange {
    symbol: String,
    settings: PaperSettings,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(symbol: &str, price: f64, settings: PaperSettings) -> Self {
        info!(
            "Paper exchange for {} starting at {} with {} {}",
            symbol, price, settings.initial_balance, settings.collateral_currency
        );
        let book = PaperBook {
            price,
            wallet: settings.initial_balance,
            next_id: 1,
            ..PaperBook::default()
        };
        Self {
            symbol: symbol.to_string(),
            settings,
            book: Mutex::new(book),
        }
    }

    /// Move the market; crossing orders fill at their limit price
    pub async fn set_price(&self, price: f64) -> Vec<Fill> {
        let mut book = self.book.lock().await;
        book.price = price;
        let ticker = Ticker {
            symbol: self.symbol.clone(),
            last: price,
            timestamp: Utc::now(),
        };
        book.ticker_subs.retain(|tx| tx.send(ticker.clone()).is_ok());

        let crossing: Vec<(u64, f64)> = book
            .orders
            .iter()
            .filter(|(_, o)| o.should_fill(price))
            .map(|(&id, o)| (id, o.order.price.unwrap_or(price)))
            .collect();
        crossing
            .into_iter()
            .filter_map(|(id, limit)| book.execute(id, limit, self.settings.fee_rate))
            .collect()
    }

    /// Fill one resting order at its limit price regardless of the market
    pub async fn fill_order(&self, order_id: &str) -> Option<Fill> {
        let mut book = self.book.lock().await;
        let id: u64 = order_id.parse().ok()?;
        let limit = book.orders.get(&id)?.order.price.unwrap_or(book.price);
        book.execute(id, limit, self.settings.fee_rate)
    }

    /// Make the next `n` adapter calls fail with a connectivity error
    pub async fn fail_next_calls(&self, n: u32) {
        self.book.lock().await.fail_next = n;
    }

    /// Reject orders smaller than `amount`
    pub async fn set_min_amount(&self, amount: f64) {
        self.book.lock().await.min_amount = Some(amount);
    }

    /// Rest an order the engine never asked for
    pub async fn insert_stray_order(&self, side: OrderSide, price: f64, amount: f64) -> String {
        let mut book = self.book.lock().await;
        let id = book.next_id;
        book.next_id += 1;
        let order = Order {
            id: id.to_string(),
            client_id: None,
            symbol: self.symbol.clone(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            amount,
            filled: 0.0,
            average_price: None,
            status: OrderStatus::Open,
        };
        book.orders.insert(id, PaperOrder { order });
        id.to_string()
    }

    /// Remove a resting order without notifying anyone
    pub async fn drop_order(&self, order_id: &str) -> bool {
        let mut book = self.book.lock().await;
        match order_id.parse::<u64>() {
            Ok(id) => book.orders.remove(&id).is_some(),
            Err(_) => false,
        }
    }

    /// (create, cancel) calls accepted so far
    pub async fn call_counts(&self) -> (u32, u32) {
        let book = self.book.lock().await;
        (book.creates, book.cancels)
    }

    pub async fn position(&self) -> Position {
        self.book.lock().await.position.clone()
    }

    pub async fn open_order_count(&self) -> usize {
        self.book.lock().await.orders.len()
    }

    pub async fn account_value(&self) -> f64 {
        let book = self.book.lock().await;
        book.wallet + book.unrealized()
    }

    fn check_symbol(&self, symbol: &str) -> GridResult<()> {
        if symbol == self.symbol {
            Ok(())
        } else {
            Err(GridError::Rejection(format!("paper: unknown symbol {}", symbol)))
        }
    }
}

#[async_trait]
impl GridExchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn create_order(&self, request: &OrderRequest) -> GridResult<Order> {
        self.check_symbol(&request.symbol)?;
        let mut book = self.book.lock().await;
        book.take_failure("create_order")?;
        if let Some(min) = book.min_amount {
            if request.amount < min {
                return Err(GridError::Rejection(format!(
                    "paper: amount {} below minimum {}",
                    request.amount, min
                )));
            }
        }
        if request.reduce_only {
            let reduces = book.position.signed_size() * request.side.sign() < 0.0;
            if !reduces {
                return Err(GridError::Rejection("paper: reduce-only order would increase position".into()));
            }
        }

        let id = book.next_id;
        book.next_id += 1;
        book.creates += 1;
        let order = Order {
            id: id.to_string(),
            client_id: Some(request.client_id.clone()),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            price: request.price,
            amount: request.amount,
            filled: 0.0,
            average_price: None,
            status: OrderStatus::Open,
        };
        book.orders.insert(id, PaperOrder { order: order.clone() });

        // marketable orders execute at once at the current price
        let price = book.price;
        if book.orders.get(&id).is_some_and(|o| o.should_fill(price)) {
            let filled = book.execute(id, price, self.settings.fee_rate);
            return Ok(Order {
                filled: request.amount,
                average_price: filled.map(|f| f.price),
                status: OrderStatus::Filled,
                ..order
            });
        }
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> GridResult<Order> {
        self.check_symbol(symbol)?;
        let mut book = self.book.lock().await;
        book.take_failure("cancel_order")?;
        let id: u64 = order_id
            .parse()
            .map_err(|_| GridError::OrderNotFound(order_id.to_string()))?;
        let mut paper = book
            .orders
            .remove(&id)
            .ok_or_else(|| GridError::OrderNotFound(order_id.to_string()))?;
        book.cancels += 1;
        paper.order.status = OrderStatus::Canceled;
        Ok(paper.order)
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> GridResult<Vec<Order>> {
        if let Some(symbol) = symbol {
            self.check_symbol(symbol)?;
        }
        let mut book = self.book.lock().await;
        book.take_failure("cancel_all_orders")?;
        let canceled: Vec<Order> = std::mem::take(&mut book.orders)
            .into_values()
            .map(|mut p| {
                p.order.status = OrderStatus::Canceled;
                p.order
            })
            .collect();
        book.cancels += canceled.len() as u32;
        Ok(canceled)
    }

    async fn get_open_orders(&self, _symbol: Option<&str>) -> GridResult<Vec<Order>> {
        let mut book = self.book.lock().await;
        book.take_failure("get_open_orders")?;
        Ok(book.orders.values().map(|p| p.order.clone()).collect())
    }

    async fn get_positions(&self, _symbols: Option<&[String]>) -> GridResult<Vec<ExchangePosition>> {
        let mut book = self.book.lock().await;
        book.take_failure("get_positions")?;
        if book.position.is_flat() {
            return Ok(Vec::new());
        }
        Ok(vec![ExchangePosition {
            symbol: self.symbol.clone(),
            side: book.position.side,
            size: book.position.size,
            entry_price: book.position.entry_price,
            unrealized_pnl: book.unrealized(),
        }])
    }

    async fn get_balances(&self) -> GridResult<Vec<Balance>> {
        let mut book = self.book.lock().await;
        book.take_failure("get_balances")?;
        let total = book.wallet + book.unrealized();
        let used = book.position.size * book.position.entry_price / self.settings.leverage.max(1) as f64;
        Ok(vec![Balance {
            currency: self.settings.collateral_currency.clone(),
            free: total - used,
            used,
            total,
        }])
    }

    async fn get_ticker(&self, symbol: &str) -> GridResult<Ticker> {
        self.check_symbol(symbol)?;
        let mut book = self.book.lock().await;
        book.take_failure("get_ticker")?;
        Ok(Ticker {
            symbol: self.symbol.clone(),
            last: book.price,
            timestamp: Utc::now(),
        })
    }

    async fn subscribe_ticker(&self, symbol: &str) -> GridResult<UnboundedReceiver<Ticker>> {
        self.check_symbol(symbol)?;
        let (tx, rx) = unbounded_channel();
        self.book.lock().await.ticker_subs.push(tx);
        Ok(rx)
    }

    async fn subscribe_user_data(&self, symbol: &str) -> GridResult<UnboundedReceiver<UserEvent>> {
        self.check_symbol(symbol)?;
        let (tx, rx) = unbounded_channel();
        self.book.lock().await.user_subs.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> PaperExchange {
        PaperExchange::new("BTC", 100.0, PaperSettings::default())
    }

    #[tokio::test]
    async fn test_limit_order_fills_when_crossed() {
        let ex = exchange();
        let mut fills = ex.subscribe_user_data("BTC").await.unwrap();
        let order = ex
            .create_order(&OrderRequest::limit("BTC", OrderSide::Buy, 1.0, 95.0))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);

        assert!(ex.set_price(96.0).await.is_empty());
        let executed = ex.set_price(94.0).await;
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].price, 95.0);

        match fills.recv().await {
            Some(UserEvent::Fill(fill)) => assert_eq!(fill.order_id, order.id),
            other => panic!("unexpected event {:?}", other),
        }
        let pos = ex.position().await;
        assert_eq!(pos.signed_size(), 1.0);
        assert_eq!(pos.entry_price, 95.0);
    }

    #[tokio::test]
    async fn test_marketable_order_fills_at_market() {
        let ex = exchange();
        let order = ex
            .create_order(&OrderRequest::limit("BTC", OrderSide::Buy, 2.0, 110.0))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.average_price, Some(100.0));
        assert_eq!(ex.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_failure_injection_and_rejection() {
        let ex = exchange();
        ex.fail_next_calls(1).await;
        let err = ex.get_open_orders(None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(ex.get_open_orders(None).await.is_ok());

        ex.set_min_amount(0.5).await;
        let err = ex
            .create_order(&OrderRequest::limit("BTC", OrderSide::Buy, 0.1, 90.0))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::Rejection(_)));
    }

    #[tokio::test]
    async fn test_balance_tracks_realized_pnl() {
        let ex = PaperExchange::new(
            "BTC",
            100.0,
            PaperSettings {
                fee_rate: 0.0,
                ..PaperSettings::default()
            },
        );
        ex.create_order(&OrderRequest::market("BTC", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        ex.set_price(110.0).await;
        ex.create_order(&OrderRequest::market("BTC", OrderSide::Sell, 1.0).reduce_only())
            .await
            .unwrap();

        let balances = ex.get_balances().await.unwrap();
        assert!((balances[0].total - 10_010.0).abs() < 1e-9);
        assert!(ex.get_positions(None).await.unwrap().is_empty());
    }
}
