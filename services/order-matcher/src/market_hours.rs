//! Market-hours oracle
//!
//! Decides whether a scheduler tick may touch the book at all.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use rustc_hash::FxHashSet;
use std::fmt;

use crate::config::MarketHoursConfig;
use crate::error::{MatchError, MatchResult};

/// Answers whether the market is open at a given instant
pub trait MarketHoursOracle: Send + Sync + fmt::Debug {
    /// Check if trading is allowed at `now`
    fn is_market_open(&self, now: DateTime<Utc>) -> bool;
}

/// Fixed weekly session with a holiday list, in exchange-local time
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    offset: FixedOffset,
    open: NaiveTime,
    close: NaiveTime,
    trading_days: FxHashSet<Weekday>,
    holidays: FxHashSet<NaiveDate>,
}

fn parse_session_time(field: &str, value: &str) -> MatchResult<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| MatchError::config(format!("market_hours.{field} '{value}': {e}")))
}

impl TradingCalendar {
    /// Build a calendar, rejecting incomplete or inconsistent settings
    pub fn from_config(config: &MarketHoursConfig) -> MatchResult<Self> {
        let offset = config
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                MatchError::config(format!(
                    "market_hours.utc_offset_minutes {} is out of range",
                    config.utc_offset_minutes
                ))
            })?;

        let open = parse_session_time("open", &config.open)?;
        let close = parse_session_time("close", &config.close)?;
        if open >= close {
            return Err(MatchError::config(format!(
                "market_hours.open {open} must be before close {close}"
            )));
        }

        if config.trading_days.is_empty() {
            return Err(MatchError::config("market_hours.trading_days is empty"));
        }
        let trading_days = config
            .trading_days
            .iter()
            .map(|day| {
                day.parse::<Weekday>()
                    .map_err(|_| MatchError::config(format!("unknown trading day '{day}'")))
            })
            .collect::<MatchResult<FxHashSet<_>>>()?;

        Ok(Self {
            offset,
            open,
            close,
            trading_days,
            holidays: config.holidays.iter().copied().collect(),
        })
    }
}

impl MarketHoursOracle for TradingCalendar {
    fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset);
        let date = local.date_naive();
        let time = local.time();

        self.trading_days.contains(&date.weekday())
            && !self.holidays.contains(&date)
            && time >= self.open
            && time < self.close
    }
}
