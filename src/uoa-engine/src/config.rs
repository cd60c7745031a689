//! Engine configuration.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use chrono_tz::Tz;
use common::ConfigError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::baseline::{BaselineManager, TimeOfDayCurve};
use crate::bucket::{BucketAggregator, BucketOfDay, SessionClock};
use crate::detector::{CooldownPolicy, DetectorConfig};
use crate::scorer::ScoreWeights;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Named bundles of detection thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigProfile {
    /// Per-day cooldown, $10k minimum
    #[default]
    Live,
    /// Per-day cooldown, $50k minimum
    Backtest,
    /// 60-minute rolling cooldown, $25k minimum
    Rolling,
}

impl fmt::Display for ConfigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigProfile::Live => write!(f, "live"),
            ConfigProfile::Backtest => write!(f, "backtest"),
            ConfigProfile::Rolling => write!(f, "rolling"),
        }
    }
}

impl FromStr for ConfigProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "live" => Ok(ConfigProfile::Live),
            "backtest" => Ok(ConfigProfile::Backtest),
            "rolling" => Ok(ConfigProfile::Rolling),
            other => Err(format!("unknown profile {:?}", other)),
        }
    }
}

/// UOA engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub profile: ConfigProfile,
    /// Bucket width in minutes; must divide a day evenly
    pub bucket_width_minutes: u32,
    /// Prior trading days averaged per slot
    pub baseline_lookback_days: usize,
    /// Prior days required before a baseline exists
    pub min_history_days: usize,
    pub detection_ratio_threshold: Decimal,
    pub min_notional: Decimal,
    pub absolute_notional_floor: Decimal,
    /// Lower bound on the ratio denominator
    pub floor_notional: Decimal,
    pub cooldown_policy: CooldownPolicy,
    pub time_of_day_multipliers: TimeOfDayCurve,
    pub score_weights: ScoreWeights,
    pub session_timezone: Tz,
    /// Venue condition code marking an intermarket sweep
    pub sweep_condition: i32,
    /// Shares per contract
    pub contract_multiplier: Decimal,
    pub out_of_order_tolerance_ms: i64,
    pub symbol_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: ConfigProfile::Live,
            bucket_width_minutes: 30,
            baseline_lookback_days: 20,
            min_history_days: 1,
            detection_ratio_threshold: dec!(3.0),
            min_notional: dec!(10000),
            absolute_notional_floor: dec!(50000),
            floor_notional: dec!(1000),
            cooldown_policy: CooldownPolicy::PerDay,
            time_of_day_multipliers: TimeOfDayCurve::flat(),
            score_weights: ScoreWeights::default(),
            session_timezone: chrono_tz::America::New_York,
            sweep_condition: 209,
            contract_multiplier: dec!(100),
            out_of_order_tolerance_ms: 1_000,
            symbol_cache_capacity: 200_000,
        }
    }
}

impl EngineConfig {
    pub fn for_profile(profile: ConfigProfile) -> Self {
        let base = Self {
            profile,
            ..Self::default()
        };
        match profile {
            ConfigProfile::Live => base,
            ConfigProfile::Backtest => Self {
                min_notional: dec!(50000),
                ..base
            },
            ConfigProfile::Rolling => Self {
                min_notional: dec!(25000),
                cooldown_policy: CooldownPolicy::Minutes(60),
                ..base
            },
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `UOA_PROFILE` picks the starting profile (default: live); every other
    /// `UOA_*` variable overrides a single field.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no .env file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Like [`from_env`](Self::from_env), but `profile` (e.g. from the CLI)
    /// takes precedence over `UOA_PROFILE`.
    pub fn from_env_with_profile(profile: Option<ConfigProfile>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::load(profile)
    }

    fn load(profile: Option<ConfigProfile>) -> Result<Self, ConfigError> {
        let profile = match profile {
            Some(profile) => profile,
            None => parse_var::<ConfigProfile>("UOA_PROFILE")?.unwrap_or_default(),
        };
        let mut config = Self::for_profile(profile);

        if let Some(v) = parse_var("UOA_BUCKET_WIDTH_MINUTES")? {
            config.bucket_width_minutes = v;
        }
        if let Some(v) = parse_var("UOA_BASELINE_LOOKBACK_DAYS")? {
            config.baseline_lookback_days = v;
        }
        if let Some(v) = parse_var("UOA_MIN_HISTORY_DAYS")? {
            config.min_history_days = v;
        }
        if let Some(v) = parse_var("UOA_DETECTION_RATIO_THRESHOLD")? {
            config.detection_ratio_threshold = v;
        }
        if let Some(v) = parse_var("UOA_MIN_NOTIONAL")? {
            config.min_notional = v;
        }
        if let Some(v) = parse_var("UOA_ABSOLUTE_NOTIONAL_FLOOR")? {
            config.absolute_notional_floor = v;
        }
        if let Some(v) = parse_var("UOA_FLOOR_NOTIONAL")? {
            config.floor_notional = v;
        }
        if let Some(v) = parse_var("UOA_COOLDOWN_POLICY")? {
            config.cooldown_policy = v;
        }
        if let Some(raw) = read_var("UOA_TIME_OF_DAY_MULTIPLIERS") {
            config.time_of_day_multipliers =
                parse_multipliers(&raw).map_err(|_| invalid("UOA_TIME_OF_DAY_MULTIPLIERS", &raw))?;
        }
        if let Some(raw) = read_var("UOA_SCORE_WEIGHTS") {
            config.score_weights =
                serde_json::from_str(&raw).map_err(|_| invalid("UOA_SCORE_WEIGHTS", &raw))?;
        }
        if let Some(raw) = read_var("UOA_SESSION_TIMEZONE") {
            config.session_timezone = raw
                .parse::<Tz>()
                .map_err(|_| invalid("UOA_SESSION_TIMEZONE", &raw))?;
        }
        if let Some(v) = parse_var("UOA_SWEEP_CONDITION")? {
            config.sweep_condition = v;
        }
        if let Some(v) = parse_var("UOA_OUT_OF_ORDER_TOLERANCE_MS")? {
            config.out_of_order_tolerance_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_width_minutes == 0 || MINUTES_PER_DAY % self.bucket_width_minutes != 0 {
            return Err(invalid(
                "bucket_width_minutes",
                &self.bucket_width_minutes.to_string(),
            ));
        }
        if self.baseline_lookback_days == 0 {
            return Err(invalid("baseline_lookback_days", "0"));
        }
        if self.min_history_days == 0 || self.min_history_days > self.baseline_lookback_days {
            return Err(invalid(
                "min_history_days",
                &self.min_history_days.to_string(),
            ));
        }
        if self.detection_ratio_threshold <= Decimal::ZERO {
            return Err(invalid(
                "detection_ratio_threshold",
                &self.detection_ratio_threshold.to_string(),
            ));
        }
        if self.floor_notional <= Decimal::ZERO {
            return Err(invalid("floor_notional", &self.floor_notional.to_string()));
        }
        if self.min_notional < Decimal::ZERO || self.absolute_notional_floor < Decimal::ZERO {
            return Err(invalid("min_notional", &self.min_notional.to_string()));
        }
        if self.contract_multiplier <= Decimal::ZERO {
            return Err(invalid(
                "contract_multiplier",
                &self.contract_multiplier.to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_clock(&self) -> SessionClock {
        SessionClock::new(self.session_timezone, self.bucket_width_minutes)
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            detection_ratio_threshold: self.detection_ratio_threshold,
            min_notional: self.min_notional,
            absolute_notional_floor: self.absolute_notional_floor,
            floor_notional: self.floor_notional,
            cooldown_policy: self.cooldown_policy,
        }
    }

    pub fn aggregator(&self) -> BucketAggregator {
        BucketAggregator::new(
            self.session_clock(),
            self.contract_multiplier,
            self.sweep_condition,
            self.out_of_order_tolerance_ms,
        )
    }

    /// Empty baseline store sized by this configuration.
    pub fn baseline_manager(&self) -> BaselineManager {
        BaselineManager::new(
            self.baseline_lookback_days,
            self.min_history_days,
            self.time_of_day_multipliers.clone(),
        )
    }
}

/// Parse `HH:MM=x,HH:MM=y`, or `u_curve` for the preset.
pub fn parse_multipliers(raw: &str) -> Result<TimeOfDayCurve, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("u_curve") {
        return Ok(TimeOfDayCurve::us_equity_u_curve());
    }

    let mut multipliers = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (slot, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected HH:MM=x, got {:?}", entry))?;
        let slot: BucketOfDay = slot.parse()?;
        let value: Decimal = value
            .trim()
            .parse()
            .map_err(|_| format!("invalid multiplier in {:?}", entry))?;
        if value <= Decimal::ZERO {
            return Err(format!("multiplier must be positive in {:?}", entry));
        }
        multipliers.insert(slot, value);
    }
    Ok(TimeOfDayCurve::new(multipliers))
}

fn read_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match read_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &raw)),
        None => Ok(None),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
