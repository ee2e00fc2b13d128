use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::config::Settings;
use crate::grid::{
    EngineContext, GridConfig, GridCoordinator, GridError, GridExchange, GridResult, GridSummary,
    PaperExchange,
};

/// Runs one grid against the paper exchange, replaying a price series
pub struct EngineRunner {
    config: Settings,
    grid: GridConfig,
    debug: bool,
}

impl EngineRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> GridResult<Self> {
        let path = config_path.as_ref();
        let path = path
            .to_str()
            .ok_or_else(|| GridError::FatalConfig(format!("invalid config path {}", path.display())))?;
        let config = Settings::new(path)?;
        let grid = config.grid_config()?;
        Ok(Self {
            config,
            grid,
            debug: false,
        })
    }

    /// Force debug logging regardless of the configured level
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Run until the price series ends or Ctrl-C
    pub async fn run(self) -> GridResult<GridSummary> {
        // 1. Setup Logging
        if self.debug {
            std::env::set_var("RUST_LOG", "debug");
        } else if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", &self.config.log.level);
        }
        env_logger::try_init().ok();

        info!("Starting grid engine for {}...", self.grid.symbol);

        // 2. Price series
        let paper = &self.config.paper;
        let prices = match &paper.prices_file {
            Some(file) => load_prices(file).await?,
            None => Vec::new(),
        };
        let start_price = prices
            .first()
            .copied()
            .or(paper.start_price)
            .ok_or_else(|| {
                GridError::FatalConfig("paper trading needs paper.prices_file or paper.start_price".into())
            })?;

        // 3. Exchange and coordinator
        let exchange = Arc::new(PaperExchange::new(
            &self.grid.symbol,
            start_price,
            paper.account.clone(),
        ));
        info!("Paper exchange ready ({}). Initializing grid...", exchange.name());
        let ctx = EngineContext::new(exchange.clone(), self.grid.clone(), self.config.engine.retry);
        let coordinator = GridCoordinator::initialize(ctx, self.config.engine.clone()).await?;
        let handle = coordinator.start()?;

        // 4. Replay
        let tick = Duration::from_millis(paper.tick_ms.max(1));
        let replay = async {
            for price in prices.iter().skip(1) {
                tokio::time::sleep(tick).await;
                if handle.is_finished() {
                    warn!("Grid stopped during replay");
                    return;
                }
                exchange.set_price(*price).await;
            }
            if prices.len() > 1 {
                info!("Replayed {} prices", prices.len());
                tokio::time::sleep(tick).await;
            } else {
                // nothing to replay: run until interrupted
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = replay => {}
            _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        }

        handle.stop().await
    }
}

async fn load_prices(path: &str) -> GridResult<Vec<f64>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| GridError::FatalConfig(format!("cannot read prices file {}: {}", path, e)))?;
    parse_prices(&contents)
}

/// One price per line; blank lines and `#` comments are skipped
fn parse_prices(contents: &str) -> GridResult<Vec<f64>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.parse::<f64>() {
            Ok(price) if price > 0.0 => Ok(price),
            _ => Err(GridError::FatalConfig(format!("invalid price {:?}", line))),
        })
        .collect()
}
