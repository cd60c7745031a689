//! Shared data models for trade input, baselines and emitted triggers.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Raw trade print as delivered by the feed or a replayed flat file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Raw option identifier (OCC style, e.g. `O:AAPL250117C00150000`)
    pub symbol: String,
    pub price: Decimal,
    pub size: i64,
    /// Nanoseconds since the Unix epoch (UTC)
    pub timestamp: i64,
    #[serde(default)]
    pub conditions: Vec<i32>,
}

/// Option right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionRight {
    Call,
    Put,
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionRight::Call => write!(f, "call"),
            OptionRight::Put => write!(f, "put"),
        }
    }
}

/// Why a trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    /// Bucket notional cleared the ratio threshold against its baseline
    RatioTrigger,
    /// No baseline history, but the bucket cleared the absolute floor
    HighAbsoluteVolume,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::RatioTrigger => "ratio_trigger",
            SignalType::HighAbsoluteVolume => "high_absolute_volume",
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dominant side of a bucket's notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

/// Per-factor breakdown of a trigger score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub ratio_points: i32,
    pub skew_points: i32,
    pub sweep_points: i32,
    pub strike_points: i32,
    pub notional_points: i32,
    /// call_notional / (call_notional + put_notional)
    pub call_pct: Decimal,
    /// sweep_trade_count / trade_count
    pub sweep_pct: Decimal,
    /// unique_strikes / trade_count (lower = more concentrated)
    pub strike_ratio: Decimal,
    pub direction: Direction,
}

impl ScoreComponents {
    /// Sum of all factor points.
    pub fn total(&self) -> i32 {
        self.ratio_points
            + self.skew_points
            + self.sweep_points
            + self.strike_points
            + self.notional_points
    }
}

/// A finalized unusual-activity trigger handed to the signal emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: Uuid,
    pub symbol: String,
    pub signal_type: SignalType,
    pub trading_day: NaiveDate,
    pub bucket_start: DateTime<Utc>,
    /// Local session time of the bucket start, `HH:MM`
    pub bucket_of_day: String,
    pub detection_time: DateTime<Utc>,
    pub bucket_notional: Decimal,
    pub call_notional: Decimal,
    pub put_notional: Decimal,
    pub trade_count: i64,
    pub baseline_notional: Option<Decimal>,
    pub ratio: Option<Decimal>,
    pub score: i32,
    pub score_components: ScoreComponents,
}

/// One archived (symbol, bucket-of-day, day) notional value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BaselineRow {
    pub symbol: String,
    /// Minutes since local session midnight
    pub bucket_of_day: i32,
    pub day: NaiveDate,
    pub notional: Decimal,
}
