//! Grid configuration and validation
//!
//! The YAML keys are deserialized into [`RawGridConfig`] and then validated
//! once into a [`GridConfig`], where each grid variant carries exactly the
//! fields it needs.

use log::warn;
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// The grid variants accepted by `grid_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridType {
    Long,
    Short,
    FollowLong,
    FollowShort,
    MartingaleLong,
    MartingaleShort,
}

impl GridType {
    pub fn direction(&self) -> Direction {
        match self {
            GridType::Long | GridType::FollowLong | GridType::MartingaleLong => Direction::Long,
            GridType::Short | GridType::FollowShort | GridType::MartingaleShort => Direction::Short,
        }
    }

    pub fn is_follow(&self) -> bool {
        matches!(self, GridType::FollowLong | GridType::FollowShort)
    }

    pub fn is_martingale(&self) -> bool {
        matches!(self, GridType::MartingaleLong | GridType::MartingaleShort)
    }
}

/// Which way the grid accumulates exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Buys on the way down, sells reverse orders above
    Long,
    /// Sells on the way up, buys reverse orders below
    Short,
}

impl Direction {
    pub fn building_side(&self) -> super::types::OrderSide {
        match self {
            Direction::Long => super::types::OrderSide::Buy,
            Direction::Short => super::types::OrderSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl Default for MarginMode {
    fn default() -> Self {
        Self::Isolated
    }
}

/// Price range definition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RangeSpec {
    Fixed {
        lower: f64,
        upper: f64,
    },
    Follow {
        grid_count: u32,
        /// Seconds the price must stay escaped before re-centring
        timeout_secs: u64,
        /// Escape distance in levels
        distance: u32,
        /// Levels of headroom beyond the price on the favourable side
        price_offset_grids: u32,
    },
}

/// Order sizing per level
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Sizing {
    Flat,
    Martingale { increment: f64 },
}

/// Spacing between levels
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum IntervalSpec {
    Absolute(f64),
    /// Percentage of the reference price, resolved once per cycle
    Percent(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Precision {
    pub quantity_decimals: u32,
    pub price_decimals: u32,
}

impl Precision {
    pub fn round_amount(&self, amount: f64) -> f64 {
        round_half_up(amount, self.quantity_decimals)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_half_up(price, self.price_decimals)
    }

    /// Smallest representable amount step
    pub fn amount_epsilon(&self) -> f64 {
        0.5 * 10f64.powi(-(self.quantity_decimals as i32))
    }
}

fn round_half_up(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    let scaled = value * scale;
    // x.5 boundaries are often stored just below the half
    (scaled + scaled.abs().max(1.0).copysign(scaled) * 1e-12).round() / scale
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmartScalpingSettings {
    pub allowed_deep_drops: u32,
    pub min_drop_threshold_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalpingSettings {
    pub trigger_percent: f64,
    pub take_profit_grids: u32,
    pub smart: Option<SmartScalpingSettings>,
    /// Leave scalping and rebuild the ladder once price is back above the trigger
    pub rebound_exit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapitalProtectionSettings {
    pub trigger_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TakeProfitSettings {
    /// Profit in percent of initial capital
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceLockSettings {
    /// Absolute price beyond the favourable bound
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopLossSettings {
    /// Share of the range, measured from the favourable bound, past which price counts as escaped
    pub trigger_percent: f64,
    pub escape_timeout_secs: u64,
    /// Cycle APR at or above which a stop-loss resets instead of stopping
    pub apr_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionAnomalySettings {
    /// Change between two reconciles, in percent of the previous size, that raises an alert
    pub alert_percent: f64,
    /// Halt when the position grows beyond this multiple of the previous size
    pub max_multiplier: f64,
    /// No checks this long after start
    pub grace_secs: u64,
}

impl Default for PositionAnomalySettings {
    fn default() -> Self {
        Self {
            alert_percent: default_position_alert_percent(),
            max_multiplier: default_position_max_multiplier(),
            grace_secs: default_position_grace(),
        }
    }
}

/// Grid configuration keys as they appear in YAML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawGridConfig {
    pub grid_type: GridType,
    pub symbol: String,

    #[serde(default)]
    pub lower_price: Option<f64>,
    #[serde(default)]
    pub upper_price: Option<f64>,

    #[serde(default)]
    pub follow_grid_count: Option<u32>,
    #[serde(default = "default_follow_timeout")]
    pub follow_timeout: u64,
    #[serde(default = "default_follow_distance")]
    pub follow_distance: u32,
    #[serde(default)]
    pub price_offset_grids: u32,

    pub order_amount: f64,
    pub grid_interval: f64,
    #[serde(default)]
    pub grid_interval_percent: bool,

    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub margin_mode: MarginMode,

    #[serde(default)]
    pub martingale_increment: Option<f64>,

    #[serde(default)]
    pub scalping_enabled: bool,
    #[serde(default = "default_scalping_trigger")]
    pub scalping_trigger_percent: f64,
    #[serde(default = "default_scalping_tp_grids")]
    pub scalping_take_profit_grids: u32,
    #[serde(default)]
    pub smart_scalping_enabled: bool,
    #[serde(default = "default_allowed_deep_drops")]
    pub allowed_deep_drops: u32,
    #[serde(default = "default_min_drop_threshold")]
    pub min_drop_threshold_percent: f64,
    #[serde(default)]
    pub scalping_rebound_exit: bool,

    #[serde(default)]
    pub capital_protection_enabled: bool,
    #[serde(default = "default_capital_protection_trigger")]
    pub capital_protection_trigger_percent: f64,

    #[serde(default)]
    pub take_profit_enabled: bool,
    #[serde(default = "default_take_profit_percentage")]
    pub take_profit_percentage: f64,

    #[serde(default)]
    pub price_lock_enabled: bool,
    #[serde(default)]
    pub price_lock_threshold: Option<f64>,

    #[serde(default)]
    pub stop_loss_protection_enabled: bool,
    #[serde(default = "default_stop_loss_trigger")]
    pub stop_loss_trigger_percent: f64,
    #[serde(default = "default_stop_loss_timeout")]
    pub stop_loss_escape_timeout: u64,
    #[serde(default = "default_stop_loss_apr_threshold")]
    pub stop_loss_apr_threshold: f64,

    #[serde(default = "default_true")]
    pub position_anomaly_enabled: bool,
    #[serde(default = "default_position_alert_percent")]
    pub position_change_alert_percent: f64,
    #[serde(default = "default_position_max_multiplier")]
    pub position_max_multiplier: f64,
    #[serde(default = "default_position_grace")]
    pub position_anomaly_grace_secs: u64,

    #[serde(default = "default_reverse_distance")]
    pub reverse_order_grid_distance: u32,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default = "default_quantity_precision")]
    pub quantity_precision: u32,
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    #[serde(default = "default_collateral_currency")]
    pub collateral_currency: String,
}

fn default_follow_timeout() -> u64 {
    300
}

fn default_follow_distance() -> u32 {
    1
}

fn default_leverage() -> u32 {
    10
}

fn default_scalping_trigger() -> f64 {
    80.0
}

fn default_scalping_tp_grids() -> u32 {
    2
}

fn default_allowed_deep_drops() -> u32 {
    1
}

fn default_min_drop_threshold() -> f64 {
    10.0
}

fn default_capital_protection_trigger() -> f64 {
    50.0
}

fn default_take_profit_percentage() -> f64 {
    1.0
}

fn default_stop_loss_trigger() -> f64 {
    100.0
}

fn default_stop_loss_timeout() -> u64 {
    300
}

fn default_stop_loss_apr_threshold() -> f64 {
    50.0
}

fn default_true() -> bool {
    true
}

fn default_position_alert_percent() -> f64 {
    100.0
}

fn default_position_max_multiplier() -> f64 {
    10.0
}

fn default_position_grace() -> u64 {
    60
}

fn default_reverse_distance() -> u32 {
    1
}

fn default_fee_rate() -> f64 {
    0.0001
}

fn default_quantity_precision() -> u32 {
    3
}

fn default_price_decimals() -> u32 {
    2
}

fn default_collateral_currency() -> String {
    "USDC".to_string()
}

/// Validated grid configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridConfig {
    pub symbol: String,
    pub grid_type: GridType,
    pub direction: Direction,
    pub range: RangeSpec,
    pub sizing: Sizing,
    pub order_amount: f64,
    pub interval: IntervalSpec,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub scalping: Option<ScalpingSettings>,
    pub capital_protection: Option<CapitalProtectionSettings>,
    pub take_profit: Option<TakeProfitSettings>,
    pub price_lock: Option<PriceLockSettings>,
    pub stop_loss: Option<StopLossSettings>,
    pub position_anomaly: Option<PositionAnomalySettings>,
    /// Levels between a filled order and its reverse order
    pub reverse_distance: u32,
    pub fee_rate: f64,
    pub precision: Precision,
    pub collateral_currency: String,
}

impl TryFrom<RawGridConfig> for GridConfig {
    type Error = GridError;

    fn try_from(raw: RawGridConfig) -> GridResult<Self> {
        let fatal = |msg: String| GridError::FatalConfig(msg);

        if raw.symbol.trim().is_empty() {
            return Err(fatal("symbol must not be empty".into()));
        }
        if !(raw.order_amount > 0.0) {
            return Err(fatal("order_amount must be positive".into()));
        }
        if !(raw.grid_interval > 0.0) {
            return Err(fatal("grid_interval must be positive".into()));
        }
        if raw.grid_interval_percent && raw.grid_interval >= 100.0 {
            return Err(fatal("grid_interval as a percentage must be below 100".into()));
        }
        if raw.leverage == 0 {
            return Err(fatal("leverage must be at least 1".into()));
        }
        if raw.reverse_order_grid_distance == 0 {
            return Err(fatal("reverse_order_grid_distance must be at least 1".into()));
        }
        if raw.fee_rate < 0.0 {
            return Err(fatal("fee_rate must not be negative".into()));
        }

        let interval = if raw.grid_interval_percent {
            IntervalSpec::Percent(raw.grid_interval)
        } else {
            IntervalSpec::Absolute(raw.grid_interval)
        };

        let range = if raw.grid_type.is_follow() {
            if raw.lower_price.is_some() || raw.upper_price.is_some() {
                return Err(fatal(
                    "lower_price/upper_price are not used by follow grids; remove them".into(),
                ));
            }
            let grid_count = raw
                .follow_grid_count
                .ok_or_else(|| fatal("follow grids require follow_grid_count".into()))?;
            if grid_count == 0 {
                return Err(fatal("follow_grid_count must be positive".into()));
            }
            if raw.follow_distance == 0 {
                return Err(fatal("follow_distance must be at least 1".into()));
            }
            if raw.price_offset_grids > grid_count {
                return Err(fatal("price_offset_grids must not exceed follow_grid_count".into()));
            }
            RangeSpec::Follow {
                grid_count,
                timeout_secs: raw.follow_timeout,
                distance: raw.follow_distance,
                price_offset_grids: raw.price_offset_grids,
            }
        } else {
            if raw.follow_grid_count.is_some() {
                return Err(fatal("follow_grid_count is only valid for follow grids".into()));
            }
            let lower = raw
                .lower_price
                .ok_or_else(|| fatal("fixed-range grids require lower_price".into()))?;
            let upper = raw
                .upper_price
                .ok_or_else(|| fatal("fixed-range grids require upper_price".into()))?;
            if lower <= 0.0 {
                return Err(fatal("lower_price must be positive".into()));
            }
            if lower >= upper {
                return Err(fatal("lower_price must be less than upper_price".into()));
            }
            if let IntervalSpec::Absolute(step) = interval {
                if ((upper - lower) / step).round() < 1.0 {
                    return Err(fatal("grid_interval is wider than the price range".into()));
                }
            }
            RangeSpec::Fixed { lower, upper }
        };

        let sizing = match raw.martingale_increment {
            Some(inc) if inc > 0.0 => Sizing::Martingale { increment: inc },
            Some(inc) if inc < 0.0 => {
                return Err(fatal("martingale_increment must not be negative".into()))
            }
            _ if raw.grid_type.is_martingale() => {
                return Err(fatal("martingale grids require a positive martingale_increment".into()))
            }
            _ => Sizing::Flat,
        };

        let check_percent = |name: &str, value: f64| -> GridResult<()> {
            if value > 0.0 && value <= 100.0 {
                Ok(())
            } else {
                Err(GridError::FatalConfig(format!("{} must be in (0, 100]", name)))
            }
        };

        let scalping = if raw.scalping_enabled {
            check_percent("scalping_trigger_percent", raw.scalping_trigger_percent)?;
            let smart = if raw.smart_scalping_enabled {
                if raw.allowed_deep_drops == 0 {
                    return Err(fatal("allowed_deep_drops must be at least 1".into()));
                }
                check_percent("min_drop_threshold_percent", raw.min_drop_threshold_percent)?;
                Some(SmartScalpingSettings {
                    allowed_deep_drops: raw.allowed_deep_drops,
                    min_drop_threshold_percent: raw.min_drop_threshold_percent,
                })
            } else {
                None
            };
            Some(ScalpingSettings {
                trigger_percent: raw.scalping_trigger_percent,
                take_profit_grids: raw.scalping_take_profit_grids,
                smart,
                rebound_exit: raw.scalping_rebound_exit,
            })
        } else if raw.smart_scalping_enabled {
            return Err(fatal("smart_scalping_enabled requires scalping_enabled".into()));
        } else {
            None
        };

        let capital_protection = if raw.capital_protection_enabled {
            check_percent(
                "capital_protection_trigger_percent",
                raw.capital_protection_trigger_percent,
            )?;
            Some(CapitalProtectionSettings {
                trigger_percent: raw.capital_protection_trigger_percent,
            })
        } else {
            None
        };

        if let (Some(s), Some(cp)) = (&scalping, &capital_protection) {
            if cp.trigger_percent <= s.trigger_percent {
                warn!(
                    "capital_protection_trigger_percent ({}) is not beyond scalping_trigger_percent ({}); \
                     capital protection will pre-empt scalping",
                    cp.trigger_percent, s.trigger_percent
                );
            }
        }

        let take_profit = if raw.take_profit_enabled {
            if !(raw.take_profit_percentage > 0.0) {
                return Err(fatal("take_profit_percentage must be positive".into()));
            }
            Some(TakeProfitSettings {
                percentage: raw.take_profit_percentage,
            })
        } else {
            None
        };

        let price_lock = if raw.price_lock_enabled {
            let threshold = raw
                .price_lock_threshold
                .ok_or_else(|| fatal("price_lock_enabled requires price_lock_threshold".into()))?;
            if threshold <= 0.0 {
                return Err(fatal("price_lock_threshold must be positive".into()));
            }
            Some(PriceLockSettings { threshold })
        } else {
            None
        };

        let stop_loss = if raw.stop_loss_protection_enabled {
            if !(raw.stop_loss_trigger_percent > 0.0) {
                return Err(fatal("stop_loss_trigger_percent must be positive".into()));
            }
            Some(StopLossSettings {
                trigger_percent: raw.stop_loss_trigger_percent,
                escape_timeout_secs: raw.stop_loss_escape_timeout,
                apr_threshold: raw.stop_loss_apr_threshold,
            })
        } else {
            None
        };

        let position_anomaly = if raw.position_anomaly_enabled {
            if !(raw.position_change_alert_percent > 0.0) {
                return Err(fatal("position_change_alert_percent must be positive".into()));
            }
            if !(raw.position_max_multiplier > 1.0) {
                return Err(fatal("position_max_multiplier must be greater than 1".into()));
            }
            Some(PositionAnomalySettings {
                alert_percent: raw.position_change_alert_percent,
                max_multiplier: raw.position_max_multiplier,
                grace_secs: raw.position_anomaly_grace_secs,
            })
        } else {
            None
        };

        Ok(Self {
            direction: raw.grid_type.direction(),
            grid_type: raw.grid_type,
            symbol: raw.symbol,
            range,
            sizing,
            order_amount: raw.order_amount,
            interval,
            leverage: raw.leverage,
            margin_mode: raw.margin_mode,
            scalping,
            capital_protection,
            take_profit,
            price_lock,
            stop_loss,
            position_anomaly,
            reverse_distance: raw.reverse_order_grid_distance,
            fee_rate: raw.fee_rate,
            precision: Precision {
                quantity_decimals: raw.quantity_precision,
                price_decimals: raw.price_decimals,
            },
            collateral_currency: raw.collateral_currency,
        })
    }
}

impl GridConfig {
    /// Fixed-range long grid with defaults for everything else
    pub fn fixed_long(symbol: &str, lower: f64, upper: f64, interval: f64, amount: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            grid_type: GridType::Long,
            direction: Direction::Long,
            range: RangeSpec::Fixed { lower, upper },
            sizing: Sizing::Flat,
            order_amount: amount,
            interval: IntervalSpec::Absolute(interval),
            leverage: default_leverage(),
            margin_mode: MarginMode::Isolated,
            scalping: None,
            capital_protection: None,
            take_profit: None,
            price_lock: None,
            stop_loss: None,
            position_anomaly: Some(PositionAnomalySettings::default()),
            reverse_distance: 1,
            fee_rate: default_fee_rate(),
            precision: Precision {
                quantity_decimals: default_quantity_precision(),
                price_decimals: default_price_decimals(),
            },
            collateral_currency: default_collateral_currency(),
        }
    }

    /// Fixed-range short grid with defaults for everything else
    pub fn fixed_short(symbol: &str, lower: f64, upper: f64, interval: f64, amount: f64) -> Self {
        Self {
            grid_type: GridType::Short,
            direction: Direction::Short,
            ..Self::fixed_long(symbol, lower, upper, interval, amount)
        }
    }

    pub fn with_scalping(mut self, trigger_percent: f64, take_profit_grids: u32) -> Self {
        self.scalping = Some(ScalpingSettings {
            trigger_percent,
            take_profit_grids,
            smart: None,
            rebound_exit: false,
        });
        self
    }

    pub fn with_capital_protection(mut self, trigger_percent: f64) -> Self {
        self.capital_protection = Some(CapitalProtectionSettings { trigger_percent });
        self
    }

    pub fn with_take_profit(mut self, percentage: f64) -> Self {
        self.take_profit = Some(TakeProfitSettings { percentage });
        self
    }

    pub fn with_price_lock(mut self, threshold: f64) -> Self {
        self.price_lock = Some(PriceLockSettings { threshold });
        self
    }

    pub fn with_stop_loss(mut self, trigger_percent: f64, escape_timeout_secs: u64, apr_threshold: f64) -> Self {
        self.stop_loss = Some(StopLossSettings {
            trigger_percent,
            escape_timeout_secs,
            apr_threshold,
        });
        self
    }

    pub fn with_position_anomaly(mut self, settings: PositionAnomalySettings) -> Self {
        self.position_anomaly = Some(settings);
        self
    }

    pub fn is_follow(&self) -> bool {
        matches!(self.range, RangeSpec::Follow { .. })
    }

    /// Parse and validate the grid section of a YAML document
    pub fn from_yaml_str(yaml: &str) -> GridResult<Self> {
        let raw: RawGridConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        Self::try_from(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXED_LONG: &str = r#"
grid_type: long
symbol: BTC
lower_price: 50000
upper_price: 100000
grid_interval: 100
order_amount: 12
"#;

    #[test]
    fn test_parse_fixed_long_defaults() {
        let config = GridConfig::from_yaml_str(FIXED_LONG).unwrap();
        assert_eq!(config.direction, Direction::Long);
        assert_eq!(
            config.range,
            RangeSpec::Fixed {
                lower: 50000.0,
                upper: 100000.0
            }
        );
        assert_eq!(config.sizing, Sizing::Flat);
        assert_eq!(config.leverage, 10);
        assert_eq!(config.margin_mode, MarginMode::Isolated);
        assert!(config.scalping.is_none());
        assert_eq!(config.precision.price_decimals, 2);
    }

    #[test]
    fn test_follow_grid_requires_count() {
        let yaml = r#"
grid_type: follow_long
symbol: ETH
grid_interval: 5
order_amount: 0.1
"#;
        let err = GridConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, GridError::FatalConfig(msg) if msg.contains("follow_grid_count")));
    }

    #[test]
    fn test_follow_grid_rejects_fixed_bounds() {
        let yaml = r#"
grid_type: follow_short
symbol: ETH
follow_grid_count: 20
lower_price: 100
grid_interval: 5
order_amount: 0.1
"#;
        assert!(GridConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_martingale_requires_increment() {
        let yaml = r#"
grid_type: martingale_long
symbol: BTC
lower_price: 100
upper_price: 200
grid_interval: 10
order_amount: 1
"#;
        assert!(GridConfig::from_yaml_str(yaml).is_err());

        let yaml = format!("{}martingale_increment: 0.5\n", yaml);
        let config = GridConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.sizing, Sizing::Martingale { increment: 0.5 });
    }

    #[test]
    fn test_config_validation() {
        let base = RawGridConfig {
            grid_type: GridType::Long,
            symbol: "BTC".into(),
            lower_price: Some(100.0),
            upper_price: Some(200.0),
            follow_grid_count: None,
            follow_timeout: 300,
            follow_distance: 1,
            price_offset_grids: 0,
            order_amount: 1.0,
            grid_interval: 10.0,
            grid_interval_percent: false,
            leverage: 10,
            margin_mode: MarginMode::Isolated,
            martingale_increment: None,
            scalping_enabled: false,
            scalping_trigger_percent: 80.0,
            scalping_take_profit_grids: 2,
            smart_scalping_enabled: false,
            allowed_deep_drops: 1,
            min_drop_threshold_percent: 10.0,
            scalping_rebound_exit: false,
            capital_protection_enabled: false,
            capital_protection_trigger_percent: 50.0,
            take_profit_enabled: false,
            take_profit_percentage: 1.0,
            price_lock_enabled: false,
            price_lock_threshold: None,
            stop_loss_protection_enabled: false,
            stop_loss_trigger_percent: 100.0,
            stop_loss_escape_timeout: 300,
            stop_loss_apr_threshold: 50.0,
            position_anomaly_enabled: true,
            position_change_alert_percent: 100.0,
            position_max_multiplier: 10.0,
            position_anomaly_grace_secs: 60,
            reverse_order_grid_distance: 1,
            fee_rate: 0.0001,
            quantity_precision: 3,
            price_decimals: 2,
            collateral_currency: "USDC".into(),
        };
        assert!(GridConfig::try_from(base.clone()).is_ok());

        let mut bad = base.clone();
        bad.lower_price = Some(300.0);
        assert!(GridConfig::try_from(bad).is_err());

        let mut bad = base.clone();
        bad.grid_interval = 0.0;
        assert!(GridConfig::try_from(bad).is_err());

        let mut bad = base.clone();
        bad.order_amount = -1.0;
        assert!(GridConfig::try_from(bad).is_err());

        let mut bad = base.clone();
        bad.price_lock_enabled = true;
        assert!(GridConfig::try_from(bad).is_err());

        let mut bad = base.clone();
        bad.smart_scalping_enabled = true;
        assert!(GridConfig::try_from(bad).is_err());

        let mut bad = base.clone();
        bad.position_max_multiplier = 1.0;
        assert!(GridConfig::try_from(bad).is_err());

        let mut bad = base.clone();
        bad.stop_loss_protection_enabled = true;
        bad.stop_loss_trigger_percent = 0.0;
        assert!(GridConfig::try_from(bad).is_err());

        let mut bad = base;
        bad.scalping_enabled = true;
        bad.scalping_trigger_percent = 120.0;
        assert!(GridConfig::try_from(bad).is_err());
    }

    #[test]
    fn test_stop_loss_and_anomaly_keys() {
        let yaml = format!(
            "{}stop_loss_protection_enabled: true\nstop_loss_escape_timeout: 120\nposition_max_multiplier: 4\n",
            FIXED_LONG
        );
        let config = GridConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(
            config.stop_loss,
            Some(StopLossSettings {
                trigger_percent: 100.0,
                escape_timeout_secs: 120,
                apr_threshold: 50.0,
            })
        );
        let anomaly = config.position_anomaly.unwrap();
        assert_eq!(anomaly.max_multiplier, 4.0);
        assert_eq!(anomaly.alert_percent, 100.0);
        assert_eq!(anomaly.grace_secs, 60);

        let config = GridConfig::from_yaml_str(FIXED_LONG).unwrap();
        assert!(config.stop_loss.is_none());
    }

    #[test]
    fn test_precision_rounding() {
        let precision = Precision {
            quantity_decimals: 3,
            price_decimals: 2,
        };
        assert_eq!(precision.round_amount(0.0125), 0.013);
        assert_eq!(precision.round_amount(1.2344), 1.234);
        assert_eq!(precision.round_price(2.345), 2.35);
        assert_eq!(precision.round_price(99845.505), 99845.51);
    }
}
