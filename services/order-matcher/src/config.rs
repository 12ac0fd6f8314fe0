//! Configuration for the order matcher

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MatchError, MatchResult};
use crate::market_hours::TradingCalendar;
use crate::order::DEFAULT_PRICE_SCALE;

/// Environment prefix for overrides, e.g. `MATCHER__SCHEDULER__TICK_INTERVAL_MS=500`
pub const ENV_PREFIX: &str = "MATCHER";

/// Order matcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Database configuration. No URL means the in-memory backends are used.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Tick driver configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Trading calendar. Required.
    pub market_hours: MarketHoursConfig,
    /// Matching configuration
    #[serde(default)]
    pub matching: MatchingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL
    pub url: Option<String>,
    /// Maximum pool size
    pub max_connections: u32,
    /// Pool acquire timeout in seconds
    pub acquire_timeout_secs: u64,
    /// Create tables on startup
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_secs: 5,
            run_migrations: true,
        }
    }
}

/// Tick driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay between timer fires in milliseconds
    pub tick_interval_ms: u64,
    /// Tickers processed concurrently within one tick
    pub max_concurrent_tickers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_concurrent_tickers: 4,
        }
    }
}

impl SchedulerConfig {
    /// Timer period
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Trading calendar configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHoursConfig {
    /// Exchange offset from UTC in minutes
    pub utc_offset_minutes: i32,
    /// Session open, local `HH:MM` (inclusive)
    pub open: String,
    /// Session close, local `HH:MM` (exclusive)
    pub close: String,
    /// Trading weekdays, e.g. `["Mon", "Tue"]`
    pub trading_days: Vec<String>,
    /// Exchange holidays
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 9 * 60,
            open: "09:00".to_string(),
            close: "15:30".to_string(),
            trading_days: ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .into_iter()
                .map(String::from)
                .collect(),
            holidays: Vec::new(),
        }
    }
}

/// Matching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Decimal places of the average executed price
    pub price_scale: u32,
    /// Tradable tickers; empty accepts any ticker
    pub universe: Vec<String>,
    /// Fill event buffer per subscriber
    pub event_capacity: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            price_scale: DEFAULT_PRICE_SCALE,
            universe: Vec::new(),
            event_capacity: 1024,
        }
    }
}

impl MatcherConfig {
    /// Load configuration from an optional TOML file plus `MATCHER__*` environment overrides
    pub fn load(path: Option<&str>) -> MatchResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("matching.universe")
                    .with_list_parse_key("market_hours.trading_days")
                    .with_list_parse_key("market_hours.holidays")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> MatchResult<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(MatchError::config("scheduler.tick_interval_ms must be positive"));
        }
        if self.scheduler.max_concurrent_tickers == 0 {
            return Err(MatchError::config(
                "scheduler.max_concurrent_tickers must be positive",
            ));
        }
        // rust_decimal carries at most 28 fractional digits
        if self.matching.price_scale > 28 {
            return Err(MatchError::config("matching.price_scale must be at most 28"));
        }
        if self.database.url.is_some() && self.database.max_connections == 0 {
            return Err(MatchError::config("database.max_connections must be positive"));
        }

        TradingCalendar::from_config(&self.market_hours)?;
        Ok(())
    }

    /// Whether orders and the index live in `PostgreSQL`
    #[must_use]
    pub const fn uses_database(&self) -> bool {
        self.database.url.is_some()
    }
}
