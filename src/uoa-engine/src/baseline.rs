//! Rolling per-slot notional baselines.
//!
//! History for each symbol covers its last `lookback_days` archived trading
//! days; a slot keeps only values from those days, so a slot that stopped
//! trading ages out with the rest. The only mutators are [`BaselineManager::archive_day`],
//! which accepts a completed session's [`DayBuckets`], and
//! [`BaselineManager::load_rows`] for warm starts from persisted history.
//! Reads take the evaluation day and only average strictly earlier days.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::NaiveDate;
use common::BaselineRow;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::debug;

use crate::bucket::{BucketOfDay, DayBuckets};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BaselineError {
    #[error("{symbol} already archived through {last_archived}, refusing {day}")]
    AlreadyArchived {
        symbol: String,
        day: NaiveDate,
        last_archived: NaiveDate,
    },

    #[error("invalid bucket_of_day {0} in baseline row")]
    InvalidSlot(i32),
}

/// Expected notional for a slot, or the cold-start sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineValue {
    Expected {
        /// Mean of the prior days' notional for the slot
        raw_average: Decimal,
        multiplier: Decimal,
        /// raw_average x multiplier
        expected: Decimal,
        days_used: usize,
    },
    NoHistory {
        days_available: usize,
    },
}

impl BaselineValue {
    /// Expected notional, or None while history is short.
    pub fn expected(&self) -> Option<Decimal> {
        match self {
            BaselineValue::Expected { expected, .. } => Some(*expected),
            BaselineValue::NoHistory { .. } => None,
        }
    }
}

/// Time-of-day multiplier table. Slots without an entry use 1.0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeOfDayCurve {
    multipliers: BTreeMap<BucketOfDay, Decimal>,
}

impl TimeOfDayCurve {
    /// Create a curve from explicit slot multipliers.
    pub fn new(multipliers: BTreeMap<BucketOfDay, Decimal>) -> Self {
        Self { multipliers }
    }

    /// Curve that leaves every slot at 1.0.
    pub fn flat() -> Self {
        Self::default()
    }

    /// U-shaped regular-session curve for 30-minute slots: heavy open and
    /// close, light midday.
    pub fn us_equity_u_curve() -> Self {
        let points = [
            ((9, 30), dec!(1.60)),
            ((10, 0), dec!(1.25)),
            ((10, 30), dec!(1.05)),
            ((11, 0), dec!(0.95)),
            ((11, 30), dec!(0.90)),
            ((12, 0), dec!(0.85)),
            ((12, 30), dec!(0.80)),
            ((13, 0), dec!(0.80)),
            ((13, 30), dec!(0.85)),
            ((14, 0), dec!(0.90)),
            ((14, 30), dec!(0.95)),
            ((15, 0), dec!(1.10)),
            ((15, 30), dec!(1.45)),
        ];

        let multipliers = points
            .into_iter()
            .filter_map(|((h, m), mult)| BucketOfDay::from_hm(h, m).map(|slot| (slot, mult)))
            .collect();
        Self { multipliers }
    }

    /// Multiplier for `slot`, 1.0 when none is configured.
    pub fn multiplier(&self, slot: BucketOfDay) -> Decimal {
        self.multipliers.get(&slot).copied().unwrap_or(Decimal::ONE)
    }

    pub fn is_flat(&self) -> bool {
        self.multipliers.values().all(|m| *m == Decimal::ONE)
    }
}

#[derive(Debug, Clone, Default)]
struct SymbolHistory {
    /// Archived trading days, at most `lookback_days` after pruning
    days: BTreeSet<NaiveDate>,
    /// Per slot, ascending by day, unique days
    slots: BTreeMap<BucketOfDay, VecDeque<(NaiveDate, Decimal)>>,
}

impl SymbolHistory {
    fn last_archived(&self) -> Option<NaiveDate> {
        self.days.last().copied()
    }

    fn insert(&mut self, slot: BucketOfDay, day: NaiveDate, notional: Decimal) {
        let window = self.slots.entry(slot).or_default();
        match window.binary_search_by(|(d, _)| d.cmp(&day)) {
            Ok(idx) => window[idx].1 = notional,
            Err(idx) => window.insert(idx, (day, notional)),
        }
        self.days.insert(day);
    }

    /// Keep the last `lookback` archived days and drop slot values older
    /// than the first of them.
    fn prune(&mut self, lookback: usize) {
        while self.days.len() > lookback {
            self.days.pop_first();
        }
        let Some(&cutoff) = self.days.first() else {
            return;
        };
        for window in self.slots.values_mut() {
            while window.front().is_some_and(|(day, _)| *day < cutoff) {
                window.pop_front();
            }
        }
        self.slots.retain(|_, window| !window.is_empty());
    }

    /// First day of the `lookback` most recent archived days before `evaluation_day`.
    fn window_start(&self, evaluation_day: NaiveDate, lookback: usize) -> Option<NaiveDate> {
        self.days.range(..evaluation_day).rev().take(lookback).last().copied()
    }
}

/// Rolling N-day baseline store, injected into the engines.
#[derive(Debug, Clone)]
pub struct BaselineManager {
    lookback_days: usize,
    min_history_days: usize,
    curve: TimeOfDayCurve,
    history: HashMap<String, SymbolHistory>,
}

impl BaselineManager {
    /// Create an empty manager. Zero lookback or minimum history is raised to 1.
    pub fn new(lookback_days: usize, min_history_days: usize, curve: TimeOfDayCurve) -> Self {
        Self {
            lookback_days: lookback_days.max(1),
            min_history_days: min_history_days.max(1),
            curve,
            history: HashMap::new(),
        }
    }

    pub fn lookback_days(&self) -> usize {
        self.lookback_days
    }

    pub fn curve(&self) -> &TimeOfDayCurve {
        &self.curve
    }

    /// Expected notional for `symbol` at `slot`, using only days before `evaluation_day`.
    pub fn get_baseline(
        &self,
        symbol: &str,
        slot: BucketOfDay,
        evaluation_day: NaiveDate,
    ) -> BaselineValue {
        let prior: Vec<Decimal> = self
            .history
            .get(symbol)
            .and_then(|h| {
                let start = h.window_start(evaluation_day, self.lookback_days)?;
                let window = h.slots.get(&slot)?;
                Some(
                    window
                        .iter()
                        .filter(|(day, _)| *day >= start && *day < evaluation_day)
                        .map(|(_, notional)| *notional)
                        .collect(),
                )
            })
            .unwrap_or_default();

        if prior.len() < self.min_history_days {
            return BaselineValue::NoHistory {
                days_available: prior.len(),
            };
        }

        let raw_average = mean(&prior);
        let multiplier = self.curve.multiplier(slot);

        BaselineValue::Expected {
            raw_average,
            multiplier,
            expected: raw_average.saturating_mul(multiplier),
            days_used: prior.len(),
        }
    }

    /// Append a completed session's per-slot notional for one symbol.
    ///
    /// Each symbol accepts each trading day once, in increasing day order.
    pub fn archive_day(&mut self, day: &DayBuckets) -> Result<Vec<BaselineRow>, BaselineError> {
        let history = self.history.entry(day.symbol().to_string()).or_default();

        if let Some(last_archived) = history.last_archived() {
            if day.trading_day() <= last_archived {
                return Err(BaselineError::AlreadyArchived {
                    symbol: day.symbol().to_string(),
                    day: day.trading_day(),
                    last_archived,
                });
            }
        }

        // Duplicate slots only occur when a DST fall-back repeats a local hour
        let mut per_slot: BTreeMap<BucketOfDay, Decimal> = BTreeMap::new();
        for bucket in day.buckets() {
            let total = per_slot.entry(bucket.bucket_of_day).or_default();
            *total = total.saturating_add(bucket.notional());
        }

        let mut rows = Vec::with_capacity(per_slot.len());
        for (slot, notional) in per_slot {
            history.insert(slot, day.trading_day(), notional);
            rows.push(BaselineRow {
                symbol: day.symbol().to_string(),
                bucket_of_day: slot.minutes() as i32,
                day: day.trading_day(),
                notional,
            });
        }
        history.days.insert(day.trading_day());
        history.prune(self.lookback_days);

        debug!(
            "[BASELINE] Archived {} for {} ({} slots)",
            day.trading_day(),
            day.symbol(),
            rows.len()
        );
        Ok(rows)
    }

    /// Warm-start from persisted rows. Later rows for the same
    /// (symbol, slot, day) replace earlier ones. Each touched symbol is then
    /// trimmed to its last `lookback_days` archived days. Returns rows applied.
    pub fn load_rows(&mut self, mut rows: Vec<BaselineRow>) -> Result<usize, BaselineError> {
        rows.sort_by(|a, b| {
            (&a.symbol, a.bucket_of_day, a.day).cmp(&(&b.symbol, b.bucket_of_day, b.day))
        });

        let mut applied = 0;
        let mut touched = BTreeSet::new();
        for row in rows {
            let slot = u32::try_from(row.bucket_of_day)
                .ok()
                .and_then(BucketOfDay::from_minutes)
                .ok_or(BaselineError::InvalidSlot(row.bucket_of_day))?;

            self.history
                .entry(row.symbol.clone())
                .or_default()
                .insert(slot, row.day, row.notional);
            touched.insert(row.symbol);
            applied += 1;
        }

        for symbol in touched {
            if let Some(history) = self.history.get_mut(&symbol) {
                history.prune(self.lookback_days);
            }
        }
        Ok(applied)
    }

    /// Export the retained history, sorted by (symbol, slot, day).
    pub fn to_rows(&self) -> Vec<BaselineRow> {
        let mut rows: Vec<BaselineRow> = self
            .history
            .iter()
            .flat_map(|(symbol, history)| {
                history.slots.iter().flat_map(move |(slot, window)| {
                    window.iter().map(move |(day, notional)| BaselineRow {
                        symbol: symbol.clone(),
                        bucket_of_day: slot.minutes() as i32,
                        day: *day,
                        notional: *notional,
                    })
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            (&a.symbol, a.bucket_of_day, a.day).cmp(&(&b.symbol, b.bucket_of_day, b.day))
        });
        rows
    }

    /// Most recent trading day archived for `symbol`.
    pub fn last_archived(&self, symbol: &str) -> Option<NaiveDate> {
        self.history.get(symbol).and_then(SymbolHistory::last_archived)
    }

    /// Number of retained days for a slot.
    pub fn window_len(&self, symbol: &str, slot: BucketOfDay) -> usize {
        self.history
            .get(symbol)
            .and_then(|h| h.slots.get(&slot))
            .map_or(0, VecDeque::len)
    }

    /// Number of symbols with any archived history.
    pub fn symbol_count(&self) -> usize {
        self.history.len()
    }
}

/// Mean that cannot overflow: sums directly when the total fits, otherwise
/// averages term by term.
fn mean(values: &[Decimal]) -> Decimal {
    let count = Decimal::from(values.len());
    match values
        .iter()
        .try_fold(Decimal::ZERO, |total, v| total.checked_add(*v))
    {
        Some(total) => total / count,
        None => values
            .iter()
            .fold(Decimal::ZERO, |total, v| total.saturating_add(*v / count)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::tests::{ny_nanos, trade};
    use crate::bucket::{BucketAggregator, SessionClock};
    use common::OptionRight;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn slot(s: &str) -> BucketOfDay {
        s.parse().unwrap()
    }

    /// Close a session in which `symbol` trades `count` prints in the 09:30 slot.
    fn session_with(symbol: &str, d: u32, count: usize) -> Vec<DayBuckets> {
        session_at(symbol, d, 9, count)
    }

    /// Same, in the slot starting at `hour`:30.
    fn session_at(symbol: &str, d: u32, hour: u32, count: usize) -> Vec<DayBuckets> {
        let mut agg = BucketAggregator::new(
            SessionClock::new(chrono_tz::America::New_York, 30),
            dec!(100),
            209,
            1_000,
        );
        for i in 0..count {
            agg.ingest(&trade(symbol, OptionRight::Call, dec!(100), ny_nanos(d, hour, 31, i as u32), false));
        }
        agg.flush();
        agg.end_session()
    }

    fn manager(lookback: usize) -> BaselineManager {
        BaselineManager::new(lookback, 1, TimeOfDayCurve::flat())
    }

    #[test]
    fn test_cold_start_is_sentinel_not_zero() {
        let mgr = manager(20);
        assert_eq!(
            mgr.get_baseline("AAPL", slot("09:30"), day(12)),
            BaselineValue::NoHistory { days_available: 0 }
        );
    }

    #[test]
    fn test_average_over_prior_days() {
        let mut mgr = manager(20);
        // 2500 notional per print
        for (d, count) in [(4, 4), (5, 8), (6, 12)] {
            for day_buckets in session_with("AAPL", d, count) {
                mgr.archive_day(&day_buckets).unwrap();
            }
        }

        let value = mgr.get_baseline("AAPL", slot("09:30"), day(7));
        assert_eq!(value.expected(), Some(dec!(20000)));
        assert!(matches!(value, BaselineValue::Expected { days_used: 3, .. }));
    }

    #[test]
    fn test_window_capped_at_lookback() {
        let mut mgr = manager(2);
        for (d, count) in [(4, 4), (5, 8), (6, 12)] {
            for day_buckets in session_with("AAPL", d, count) {
                mgr.archive_day(&day_buckets).unwrap();
            }
        }

        assert_eq!(mgr.window_len("AAPL", slot("09:30")), 2);
        assert_eq!(
            mgr.get_baseline("AAPL", slot("09:30"), day(7)).expected(),
            Some(dec!(25000))
        );
    }

    #[test]
    fn test_sparse_days_are_excluded_not_zero() {
        let mut mgr = manager(20);
        for day_buckets in session_with("AAPL", 4, 4) {
            mgr.archive_day(&day_buckets).unwrap();
        }
        // 03-05 missing entirely, 03-06 traded
        for day_buckets in session_with("AAPL", 6, 8) {
            mgr.archive_day(&day_buckets).unwrap();
        }

        assert_eq!(
            mgr.get_baseline("AAPL", slot("09:30"), day(7)).expected(),
            Some(dec!(15000))
        );
        // Untraded slot stays cold
        assert!(mgr.get_baseline("AAPL", slot("10:00"), day(7)).expected().is_none());
    }

    #[test]
    fn test_quiet_slot_ages_out_with_symbol_days() {
        let mut mgr = manager(3);
        mgr.archive_day(&session_at("AAPL", 1, 9, 1)[0]).unwrap();
        for d in [4, 5] {
            mgr.archive_day(&session_at("AAPL", d, 14, 4)[0]).unwrap();
        }

        // 03-01 is still one of the last three AAPL days
        assert!(matches!(
            mgr.get_baseline("AAPL", slot("09:30"), day(6)),
            BaselineValue::Expected { days_used: 1, .. }
        ));

        mgr.archive_day(&session_at("AAPL", 6, 14, 4)[0]).unwrap();

        assert_eq!(
            mgr.get_baseline("AAPL", slot("09:30"), day(7)),
            BaselineValue::NoHistory { days_available: 0 }
        );
        assert_eq!(mgr.window_len("AAPL", slot("09:30")), 0);
        assert_eq!(
            mgr.get_baseline("AAPL", slot("14:30"), day(7)).expected(),
            Some(dec!(10000))
        );
    }

    #[test]
    fn test_load_rows_trims_to_symbol_days() {
        let mut mgr = manager(3);
        let row = |bucket_of_day, d, notional| BaselineRow {
            symbol: "SPY".into(),
            bucket_of_day,
            day: day(d),
            notional,
        };
        let rows = vec![
            row(570, 1, dec!(2500)),
            row(870, 4, dec!(100)),
            row(870, 5, dec!(200)),
            row(870, 6, dec!(300)),
        ];

        assert_eq!(mgr.load_rows(rows).unwrap(), 4);
        assert_eq!(mgr.window_len("SPY", slot("09:30")), 0);
        assert_eq!(mgr.window_len("SPY", slot("14:30")), 3);
        assert!(mgr.get_baseline("SPY", slot("09:30"), day(7)).expected().is_none());
        assert_eq!(mgr.to_rows().len(), 3);
    }

    #[test]
    fn test_reads_ignore_evaluation_day_and_later() {
        let mut mgr = manager(20);
        for day_buckets in session_with("AAPL", 4, 4) {
            mgr.archive_day(&day_buckets).unwrap();
        }
        let before = mgr.get_baseline("AAPL", slot("09:30"), day(5));

        for day_buckets in session_with("AAPL", 5, 40) {
            mgr.archive_day(&day_buckets).unwrap();
        }
        let after = mgr.get_baseline("AAPL", slot("09:30"), day(5));

        assert_eq!(before, after);
    }

    #[test]
    fn test_archive_day_once() {
        let mut mgr = manager(20);
        let days = session_with("AAPL", 5, 4);
        mgr.archive_day(&days[0]).unwrap();

        let err = mgr.archive_day(&days[0]).unwrap_err();
        assert!(matches!(err, BaselineError::AlreadyArchived { .. }));

        let earlier = session_with("AAPL", 4, 4);
        assert!(mgr.archive_day(&earlier[0]).is_err());
        assert_eq!(mgr.window_len("AAPL", slot("09:30")), 1);
    }

    #[test]
    fn test_archive_returns_rows() {
        let mut mgr = manager(20);
        let rows = mgr.archive_day(&session_with("AAPL", 5, 4)[0]).unwrap();

        assert_eq!(
            rows,
            vec![BaselineRow {
                symbol: "AAPL".to_string(),
                bucket_of_day: 570,
                day: day(5),
                notional: dec!(10000),
            }]
        );
    }

    #[test]
    fn test_multiplier_scales_expected() {
        let mut curve = BTreeMap::new();
        curve.insert(slot("09:30"), dec!(1.5));
        let mut mgr = BaselineManager::new(20, 1, TimeOfDayCurve::new(curve));
        mgr.archive_day(&session_with("AAPL", 5, 4)[0]).unwrap();

        match mgr.get_baseline("AAPL", slot("09:30"), day(6)) {
            BaselineValue::Expected {
                raw_average,
                multiplier,
                expected,
                ..
            } => {
                assert_eq!(raw_average, dec!(10000));
                assert_eq!(multiplier, dec!(1.5));
                assert_eq!(expected, dec!(15000));
            }
            other => panic!("expected baseline, got {:?}", other),
        }
    }

    #[test]
    fn test_min_history_days() {
        let mut mgr = BaselineManager::new(20, 3, TimeOfDayCurve::flat());
        mgr.archive_day(&session_with("AAPL", 4, 4)[0]).unwrap();
        mgr.archive_day(&session_with("AAPL", 5, 4)[0]).unwrap();

        assert_eq!(
            mgr.get_baseline("AAPL", slot("09:30"), day(6)),
            BaselineValue::NoHistory { days_available: 2 }
        );
    }

    #[test]
    fn test_load_rows_and_export() {
        let mut mgr = manager(2);
        let rows = vec![
            BaselineRow { symbol: "SPY".into(), bucket_of_day: 600, day: day(6), notional: dec!(300) },
            BaselineRow { symbol: "SPY".into(), bucket_of_day: 600, day: day(4), notional: dec!(100) },
            BaselineRow { symbol: "SPY".into(), bucket_of_day: 600, day: day(5), notional: dec!(200) },
        ];

        assert_eq!(mgr.load_rows(rows).unwrap(), 3);
        assert_eq!(mgr.window_len("SPY", slot("10:00")), 2);
        assert_eq!(mgr.last_archived("SPY"), Some(day(6)));
        assert_eq!(
            mgr.get_baseline("SPY", slot("10:00"), day(7)).expected(),
            Some(dec!(250))
        );

        let exported = mgr.to_rows();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].day, day(5));
    }

    #[test]
    fn test_load_rows_rejects_bad_slot() {
        let mut mgr = manager(20);
        let rows = vec![BaselineRow {
            symbol: "SPY".into(),
            bucket_of_day: 1440,
            day: day(6),
            notional: dec!(1),
        }];

        assert_eq!(mgr.load_rows(rows), Err(BaselineError::InvalidSlot(1440)));
    }

    #[test]
    fn test_u_curve_preset() {
        let curve = TimeOfDayCurve::us_equity_u_curve();
        assert_eq!(curve.multiplier(slot("09:30")), dec!(1.60));
        assert_eq!(curve.multiplier(slot("04:00")), Decimal::ONE);
        assert!(!curve.is_flat());
        assert!(TimeOfDayCurve::flat().is_flat());
    }
}
