//! Threshold detection and per-symbol cooldown management.
//!
//! Per symbol the detector moves `Idle -> Triggered -> Cooldown -> Idle`.
//! `Triggered` is transient: the evaluation that fires records the trigger
//! time and leaves the symbol in `Cooldown` until the policy releases it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use common::SignalType;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::baseline::BaselineValue;
use crate::bucket::ClosedBucket;

const NANOS_PER_MINUTE: i64 = 60 * 1_000_000_000;

/// How long a symbol stays quiet after a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownPolicy {
    /// First occurrence per symbol per trading day
    PerDay,
    /// Rolling cooldown of N minutes from the last trigger
    Minutes(u32),
}

impl fmt::Display for CooldownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CooldownPolicy::PerDay => write!(f, "per_day"),
            CooldownPolicy::Minutes(n) => write!(f, "minutes:{}", n),
        }
    }
}

impl FromStr for CooldownPolicy {
    type Err = String;

    /// Accepts `per_day` / `per-day` / `day`, or `minutes:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "per_day" | "per-day" | "day" => Ok(CooldownPolicy::PerDay),
            other => {
                let minutes = other
                    .strip_prefix("minutes:")
                    .or_else(|| other.strip_prefix("per_minutes:"))
                    .ok_or_else(|| format!("unknown cooldown policy {:?}", other))?;
                let minutes: u32 = minutes
                    .parse()
                    .map_err(|_| format!("invalid cooldown minutes {:?}", minutes))?;
                if minutes == 0 {
                    return Err("cooldown minutes must be positive".to_string());
                }
                Ok(CooldownPolicy::Minutes(minutes))
            }
        }
    }
}

/// Detection thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Minimum bucket/baseline ratio (e.g. 3.0)
    pub detection_ratio_threshold: Decimal,
    /// Minimum bucket notional for a ratio trigger
    pub min_notional: Decimal,
    /// Cold-start trigger level when no baseline exists
    pub absolute_notional_floor: Decimal,
    /// Lower bound on the ratio denominator
    pub floor_notional: Decimal,
    pub cooldown_policy: CooldownPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Cooldown {
        last_trigger_time: i64,
        trading_day: NaiveDate,
    },
}

/// A threshold crossing, before cooldown is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Ratio { baseline: Decimal, ratio: Decimal },
    HighAbsoluteVolume,
}

impl Detection {
    /// Signal type recorded on the emitted trigger.
    pub fn signal_type(&self) -> SignalType {
        match self {
            Detection::Ratio { .. } => SignalType::RatioTrigger,
            Detection::HighAbsoluteVolume => SignalType::HighAbsoluteVolume,
        }
    }

    /// Bucket notional over baseline, for ratio detections.
    pub fn ratio(&self) -> Option<Decimal> {
        match self {
            Detection::Ratio { ratio, .. } => Some(*ratio),
            Detection::HighAbsoluteVolume => None,
        }
    }

    pub fn baseline(&self) -> Option<Decimal> {
        match self {
            Detection::Ratio { baseline, .. } => Some(*baseline),
            Detection::HighAbsoluteVolume => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Triggered(Detection),
    BelowThreshold,
    /// Would have triggered, but the symbol is cooling down
    Suppressed(Detection),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DetectorStats {
    pub evaluated: u64,
    pub triggered: u64,
    pub suppressed: u64,
    pub below_threshold: u64,
}

/// Signal detector with cooldown management.
pub struct Detector {
    config: DetectorConfig,
    /// Map of symbol -> state; absent means Idle
    states: HashMap<String, DetectorState>,
    session_day: Option<NaiveDate>,
    stats: DetectorStats,
}

impl Detector {
    /// Create a new detector with every symbol Idle.
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            session_day: None,
            stats: DetectorStats::default(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Counters since construction. Not reset between sessions.
    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }

    /// Trading day of the current session, if one has started.
    pub fn session_day(&self) -> Option<NaiveDate> {
        self.session_day
    }

    /// Reset every symbol to Idle for a new trading session.
    pub fn start_session(&mut self, trading_day: NaiveDate) {
        if !self.states.is_empty() {
            info!(
                "[SESSION] {}: releasing {} cooldowns",
                trading_day,
                self.states.len()
            );
        }
        self.states.clear();
        self.session_day = Some(trading_day);
    }

    /// Current state for `symbol`. Unseen symbols are Idle.
    pub fn state(&self, symbol: &str) -> DetectorState {
        self.states.get(symbol).copied().unwrap_or(DetectorState::Idle)
    }

    /// Threshold logic only; no cooldown, no state.
    pub fn check(&self, bucket: &ClosedBucket, baseline: &BaselineValue) -> Option<Detection> {
        let notional = bucket.notional();

        match baseline.expected() {
            None => (notional >= self.config.absolute_notional_floor)
                .then_some(Detection::HighAbsoluteVolume),
            Some(expected) => {
                let denominator = expected.max(self.config.floor_notional);
                if denominator <= Decimal::ZERO {
                    return None;
                }
                // Saturates when a tiny floor meets a huge bucket
                let ratio = notional.checked_div(denominator).unwrap_or(Decimal::MAX);
                (ratio >= self.config.detection_ratio_threshold
                    && notional >= self.config.min_notional)
                    .then_some(Detection::Ratio {
                        baseline: expected,
                        ratio,
                    })
            }
        }
    }

    /// Whether `symbol` is cooling down at `detection_time` on `trading_day`.
    pub fn in_cooldown(&self, symbol: &str, detection_time: i64, trading_day: NaiveDate) -> bool {
        match self.state(symbol) {
            DetectorState::Idle => false,
            DetectorState::Cooldown {
                last_trigger_time,
                trading_day: trigger_day,
            } => match self.config.cooldown_policy {
                CooldownPolicy::PerDay => trigger_day == trading_day,
                CooldownPolicy::Minutes(minutes) => {
                    detection_time < last_trigger_time + i64::from(minutes) * NANOS_PER_MINUTE
                }
            },
        }
    }

    /// Evaluate a closed bucket against its baseline. Detection time is the
    /// bucket's close.
    pub fn evaluate(&mut self, bucket: &ClosedBucket, baseline: &BaselineValue) -> Evaluation {
        self.stats.evaluated += 1;

        let Some(detection) = self.check(bucket, baseline) else {
            self.stats.below_threshold += 1;
            return Evaluation::BelowThreshold;
        };

        let detection_time = bucket.bucket_end();
        if self.in_cooldown(&bucket.symbol, detection_time, bucket.trading_day) {
            self.stats.suppressed += 1;
            debug!(
                "[COOLDOWN] Suppressed {} {} at {}",
                detection.signal_type(),
                bucket.symbol,
                bucket.bucket_of_day
            );
            return Evaluation::Suppressed(detection);
        }

        self.states.insert(
            bucket.symbol.clone(),
            DetectorState::Cooldown {
                last_trigger_time: detection_time,
                trading_day: bucket.trading_day,
            },
        );
        self.stats.triggered += 1;
        Evaluation::Triggered(detection)
    }

    /// Return symbols whose rolling cooldown has elapsed by `now` to Idle.
    pub fn cleanup_cooldowns(&mut self, now: i64) {
        if let CooldownPolicy::Minutes(minutes) = self.config.cooldown_policy {
            let window = i64::from(minutes) * NANOS_PER_MINUTE;
            self.states.retain(|_, state| match state {
                DetectorState::Idle => false,
                DetectorState::Cooldown {
                    last_trigger_time, ..
                } => now < *last_trigger_time + window,
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bucket::tests::ny_nanos;
    use crate::bucket::{Bucket, SessionClock};
    use rust_decimal_macros::dec;

    pub(crate) fn closed_bucket(
        symbol: &str,
        d: u32,
        hour: u32,
        minute: u32,
        call: Decimal,
        put: Decimal,
    ) -> ClosedBucket {
        let clock = SessionClock::new(chrono_tz::America::New_York, 30);
        let slot = clock.locate(ny_nanos(d, hour, minute, 0));
        let mut bucket = Bucket::new(symbol, slot, clock.width_nanos());
        bucket.call_notional = call;
        bucket.put_notional = put;
        bucket.trade_count = 10;
        ClosedBucket::for_test(bucket)
    }

    pub(crate) fn config(policy: CooldownPolicy) -> DetectorConfig {
        DetectorConfig {
            detection_ratio_threshold: dec!(3.0),
            min_notional: dec!(10000),
            absolute_notional_floor: dec!(50000),
            floor_notional: dec!(1000),
            cooldown_policy: policy,
        }
    }

    fn expected(value: Decimal) -> BaselineValue {
        BaselineValue::Expected {
            raw_average: value,
            multiplier: Decimal::ONE,
            expected: value,
            days_used: 5,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_ratio_trigger() {
        let mut detector = Detector::new(config(CooldownPolicy::PerDay));
        detector.start_session(day(12));
        let bucket = closed_bucket("AAPL", 12, 9, 30, dec!(80000), dec!(20000));

        let result = detector.evaluate(&bucket, &expected(dec!(25000)));

        assert_eq!(
            result,
            Evaluation::Triggered(Detection::Ratio {
                baseline: dec!(25000),
                ratio: dec!(4)
            })
        );
        assert!(matches!(detector.state("AAPL"), DetectorState::Cooldown { .. }));
    }

    #[test]
    fn test_below_ratio_threshold() {
        let mut detector = Detector::new(config(CooldownPolicy::PerDay));
        let bucket = closed_bucket("AAPL", 12, 9, 30, dec!(50000), dec!(0));

        assert_eq!(
            detector.evaluate(&bucket, &expected(dec!(25000))),
            Evaluation::BelowThreshold
        );
        assert_eq!(detector.state("AAPL"), DetectorState::Idle);
        assert_eq!(detector.stats().below_threshold, 1);
    }

    #[test]
    fn test_min_notional_gate() {
        let detector = Detector::new(config(CooldownPolicy::PerDay));
        // 9x baseline but only $9k
        let bucket = closed_bucket("AAPL", 12, 9, 30, dec!(9000), dec!(0));

        assert_eq!(detector.check(&bucket, &expected(dec!(1000))), None);
    }

    #[test]
    fn test_floor_notional_bounds_ratio() {
        let detector = Detector::new(config(CooldownPolicy::PerDay));
        let bucket = closed_bucket("AAPL", 12, 9, 30, dec!(12000), dec!(0));

        let detection = detector.check(&bucket, &expected(dec!(10))).unwrap();
        assert_eq!(detection.ratio(), Some(dec!(12)));
        assert_eq!(detection.baseline(), Some(dec!(10)));
    }

    #[test]
    fn test_cold_start_absolute_floor() {
        let detector = Detector::new(config(CooldownPolicy::PerDay));
        let no_history = BaselineValue::NoHistory { days_available: 0 };

        let big = closed_bucket("NEWCO", 12, 9, 30, dec!(60000), dec!(0));
        let detection = detector.check(&big, &no_history).unwrap();
        assert_eq!(detection, Detection::HighAbsoluteVolume);
        assert_eq!(detection.signal_type(), SignalType::HighAbsoluteVolume);
        assert_eq!(detection.ratio(), None);

        let small = closed_bucket("NEWCO", 12, 9, 30, dec!(40000), dec!(0));
        assert_eq!(detector.check(&small, &no_history), None);
    }

    #[test]
    fn test_per_day_cooldown_suppresses_without_state_change() {
        let mut detector = Detector::new(config(CooldownPolicy::PerDay));
        detector.start_session(day(12));

        let first = closed_bucket("AAPL", 12, 9, 30, dec!(100000), dec!(0));
        assert!(matches!(
            detector.evaluate(&first, &expected(dec!(25000))),
            Evaluation::Triggered(_)
        ));
        let state_after_first = detector.state("AAPL");

        let second = closed_bucket("AAPL", 12, 10, 0, dec!(125000), dec!(0));
        assert!(matches!(
            detector.evaluate(&second, &expected(dec!(25000))),
            Evaluation::Suppressed(_)
        ));

        assert_eq!(detector.state("AAPL"), state_after_first);
        assert_eq!(detector.stats().triggered, 1);
        assert_eq!(detector.stats().suppressed, 1);
    }

    #[test]
    fn test_cooldown_is_per_symbol() {
        let mut detector = Detector::new(config(CooldownPolicy::PerDay));
        detector.start_session(day(12));

        let aapl = closed_bucket("AAPL", 12, 9, 30, dec!(100000), dec!(0));
        let msft = closed_bucket("MSFT", 12, 9, 30, dec!(100000), dec!(0));
        assert!(matches!(detector.evaluate(&aapl, &expected(dec!(25000))), Evaluation::Triggered(_)));
        assert!(matches!(detector.evaluate(&msft, &expected(dec!(25000))), Evaluation::Triggered(_)));
    }

    #[test]
    fn test_new_session_resets_cooldown() {
        let mut detector = Detector::new(config(CooldownPolicy::PerDay));
        detector.start_session(day(12));
        let first = closed_bucket("AAPL", 12, 9, 30, dec!(100000), dec!(0));
        detector.evaluate(&first, &expected(dec!(25000)));

        detector.start_session(day(13));
        assert_eq!(detector.state("AAPL"), DetectorState::Idle);

        let next_day = closed_bucket("AAPL", 13, 9, 30, dec!(100000), dec!(0));
        assert!(matches!(
            detector.evaluate(&next_day, &expected(dec!(25000))),
            Evaluation::Triggered(_)
        ));
    }

    #[test]
    fn test_minutes_policy_expires() {
        let mut detector = Detector::new(config(CooldownPolicy::Minutes(60)));
        detector.start_session(day(12));

        // Closes at 10:00
        let first = closed_bucket("AAPL", 12, 9, 30, dec!(100000), dec!(0));
        assert!(matches!(detector.evaluate(&first, &expected(dec!(25000))), Evaluation::Triggered(_)));

        // Closes at 10:30, inside 60 minutes
        let second = closed_bucket("AAPL", 12, 10, 0, dec!(100000), dec!(0));
        assert!(matches!(detector.evaluate(&second, &expected(dec!(25000))), Evaluation::Suppressed(_)));

        // Closes at 11:00, exactly 60 minutes later
        let third = closed_bucket("AAPL", 12, 10, 30, dec!(100000), dec!(0));
        assert!(matches!(detector.evaluate(&third, &expected(dec!(25000))), Evaluation::Triggered(_)));
    }

    #[test]
    fn test_cleanup_cooldowns() {
        let mut detector = Detector::new(config(CooldownPolicy::Minutes(30)));
        detector.start_session(day(12));
        let first = closed_bucket("AAPL", 12, 9, 30, dec!(100000), dec!(0));
        detector.evaluate(&first, &expected(dec!(25000)));

        detector.cleanup_cooldowns(ny_nanos(12, 10, 15, 0));
        assert!(matches!(detector.state("AAPL"), DetectorState::Cooldown { .. }));

        detector.cleanup_cooldowns(ny_nanos(12, 10, 30, 0));
        assert_eq!(detector.state("AAPL"), DetectorState::Idle);
    }

    #[test]
    fn test_cooldown_policy_parse() {
        assert_eq!("per_day".parse::<CooldownPolicy>().unwrap(), CooldownPolicy::PerDay);
        assert_eq!("Per-Day".parse::<CooldownPolicy>().unwrap(), CooldownPolicy::PerDay);
        assert_eq!(
            "minutes:45".parse::<CooldownPolicy>().unwrap(),
            CooldownPolicy::Minutes(45)
        );
        assert!("minutes:0".parse::<CooldownPolicy>().is_err());
        assert!("hourly".parse::<CooldownPolicy>().is_err());
        assert_eq!(CooldownPolicy::Minutes(45).to_string(), "minutes:45");
    }
}
