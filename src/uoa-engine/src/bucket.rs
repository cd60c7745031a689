//! Event-time bucketing of option trades per underlying.
//!
//! Buckets are fixed-width windows anchored at local session midnight, keyed
//! by `(symbol, bucket_start)`. A bucket is open while trades for its window
//! arrive and becomes a [`ClosedBucket`] once the aggregator's watermark moves
//! past its end or the session is flushed. Closed buckets are never mutated.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use common::OptionRight;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::trade::Trade;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const MINUTES_PER_DAY: u32 = 24 * 60;

/// Slot within the trading day: minutes since local session midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketOfDay(u16);

impl BucketOfDay {
    /// Slot starting `minutes` after local midnight, None past the end of the day.
    pub fn from_minutes(minutes: u32) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then(|| Self(minutes as u16))
    }

    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour * 60 + minute)
    }

    /// Minutes since local midnight.
    pub fn minutes(&self) -> u32 {
        u32::from(self.0)
    }
}

impl fmt::Display for BucketOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for BucketOfDay {
    type Err = String;

    /// Parses `HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got {:?}", s))?;
        let hour: u32 = h.parse().map_err(|_| format!("invalid hour in {:?}", s))?;
        let minute: u32 = m.parse().map_err(|_| format!("invalid minute in {:?}", s))?;
        Self::from_hm(hour, minute).ok_or_else(|| format!("time out of range: {:?}", s))
    }
}

impl Serialize for BucketOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where a timestamp lands in the session calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSlot {
    pub trading_day: NaiveDate,
    /// Nanoseconds since the Unix epoch
    pub bucket_start: i64,
    pub bucket_of_day: BucketOfDay,
}

/// Maps event timestamps onto trading days and bucket windows.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    tz: Tz,
    width_secs: i64,
}

impl SessionClock {
    /// Create a clock for `tz`. A zero width is raised to one minute.
    pub fn new(tz: Tz, bucket_width_minutes: u32) -> Self {
        Self {
            tz,
            width_secs: i64::from(bucket_width_minutes.max(1)) * 60,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Bucket width in nanoseconds.
    pub fn width_nanos(&self) -> i64 {
        self.width_secs * NANOS_PER_SEC
    }

    /// Local calendar date of `timestamp` in the session timezone.
    pub fn trading_day(&self, timestamp: i64) -> NaiveDate {
        DateTime::<Utc>::from_timestamp_nanos(timestamp)
            .with_timezone(&self.tz)
            .date_naive()
    }

    /// Floor `timestamp` to its bucket within the local session day.
    pub fn locate(&self, timestamp: i64) -> BucketSlot {
        let local = DateTime::<Utc>::from_timestamp_nanos(timestamp).with_timezone(&self.tz);
        let secs_of_day = i64::from(local.num_seconds_from_midnight());
        let slot_secs = secs_of_day - secs_of_day % self.width_secs;
        let offset_nanos =
            (secs_of_day - slot_secs) * NANOS_PER_SEC + i64::from(local.nanosecond() % 1_000_000_000);

        BucketSlot {
            trading_day: local.date_naive(),
            bucket_start: timestamp - offset_nanos,
            // slot_secs < 86_400, so the minute count always fits
            bucket_of_day: BucketOfDay((slot_secs / 60) as u16),
        }
    }
}

/// Per-(symbol, window) trade statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub symbol: String,
    pub trading_day: NaiveDate,
    pub bucket_start: i64,
    pub width_nanos: i64,
    pub bucket_of_day: BucketOfDay,
    pub call_notional: Decimal,
    pub put_notional: Decimal,
    pub total_contracts: i64,
    pub trade_count: u64,
    /// Distinct (strike, expiry) pairs traded
    pub unique_strikes: BTreeSet<(Decimal, NaiveDate)>,
    pub sweep_trade_count: u64,
    pub first_trade_at: i64,
    pub last_trade_at: i64,
}

impl Bucket {
    /// Create an empty bucket for `slot`.
    pub fn new(symbol: &str, slot: BucketSlot, width_nanos: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            trading_day: slot.trading_day,
            bucket_start: slot.bucket_start,
            width_nanos,
            bucket_of_day: slot.bucket_of_day,
            call_notional: Decimal::ZERO,
            put_notional: Decimal::ZERO,
            total_contracts: 0,
            trade_count: 0,
            unique_strikes: BTreeSet::new(),
            sweep_trade_count: 0,
            first_trade_at: slot.bucket_start,
            last_trade_at: slot.bucket_start,
        }
    }

    /// Exclusive end of the window.
    pub fn bucket_end(&self) -> i64 {
        self.bucket_start + self.width_nanos
    }

    /// Whether `timestamp` falls inside `[bucket_start, bucket_end)`.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.bucket_start && timestamp < self.bucket_end()
    }

    /// Call plus put notional.
    pub fn notional(&self) -> Decimal {
        self.call_notional.saturating_add(self.put_notional)
    }

    pub fn bucket_start_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_nanos(self.bucket_start)
    }

    pub fn bucket_end_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_nanos(self.bucket_end())
    }

    /// Whether adding a print of `notional` keeps every running total in range.
    fn accepts(&self, trade: &Trade, notional: Decimal) -> bool {
        let (side, other) = match trade.right {
            OptionRight::Call => (self.call_notional, self.put_notional),
            OptionRight::Put => (self.put_notional, self.call_notional),
        };
        side.checked_add(notional)
            .and_then(|side| side.checked_add(other))
            .is_some()
            && self.total_contracts.checked_add(trade.size).is_some()
    }

    /// Callers check [`accepts`](Self::accepts) first.
    fn add(&mut self, trade: &Trade, notional: Decimal, sweep_condition: i32) {
        debug_assert!(self.contains(trade.timestamp));

        match trade.right {
            OptionRight::Call => self.call_notional += notional,
            OptionRight::Put => self.put_notional += notional,
        }

        if self.trade_count == 0 {
            self.first_trade_at = trade.timestamp;
            self.last_trade_at = trade.timestamp;
        } else {
            self.first_trade_at = self.first_trade_at.min(trade.timestamp);
            self.last_trade_at = self.last_trade_at.max(trade.timestamp);
        }

        self.total_contracts += trade.size;
        self.trade_count += 1;
        self.unique_strikes.insert((trade.strike, trade.expiry));
        if trade.has_condition(sweep_condition) {
            self.sweep_trade_count += 1;
        }
    }
}

/// A bucket whose window has elapsed. Read-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ClosedBucket(Bucket);

impl ClosedBucket {
    pub(crate) fn seal(bucket: Bucket) -> Self {
        Self(bucket)
    }

    #[cfg(test)]
    pub(crate) fn for_test(bucket: Bucket) -> Self {
        Self(bucket)
    }
}

impl Deref for ClosedBucket {
    type Target = Bucket;

    fn deref(&self) -> &Bucket {
        &self.0
    }
}

/// All closed buckets of one symbol for one completed session.
///
/// Only produced by [`BucketAggregator::end_session`], which is what makes it
/// safe to archive: the session it describes is over.
#[derive(Debug, Clone, PartialEq)]
pub struct DayBuckets {
    symbol: String,
    trading_day: NaiveDate,
    buckets: Vec<ClosedBucket>,
}

impl DayBuckets {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn trading_day(&self) -> NaiveDate {
        self.trading_day
    }

    /// Closed buckets in start order.
    pub fn buckets(&self) -> &[ClosedBucket] {
        &self.buckets
    }
}

/// Outcome of feeding a single trade to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// The trade's own bucket had already closed
    LateDropped,
    /// The print's notional does not fit in its bucket's totals
    NotionalOverflow,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregatorStats {
    pub trades_accepted: u64,
    pub out_of_order_trades: u64,
    pub late_trades_dropped: u64,
    pub notional_overflow_dropped: u64,
    pub buckets_closed: u64,
}

/// Accumulates trades into per-symbol buckets for the current session.
pub struct BucketAggregator {
    clock: SessionClock,
    contract_multiplier: Decimal,
    sweep_condition: i32,
    out_of_order_tolerance_nanos: i64,
    /// At most one open bucket per symbol
    open: BTreeMap<String, Bucket>,
    closed_today: BTreeMap<String, Vec<ClosedBucket>>,
    /// Closed but not yet handed out for evaluation
    ready: Vec<ClosedBucket>,
    watermark: Option<i64>,
    stats: AggregatorStats,
}

impl BucketAggregator {
    /// Create a new aggregator with no open buckets.
    ///
    /// Prints more than `out_of_order_tolerance_ms` behind the watermark are
    /// counted as out of order.
    pub fn new(
        clock: SessionClock,
        contract_multiplier: Decimal,
        sweep_condition: i32,
        out_of_order_tolerance_ms: i64,
    ) -> Self {
        Self {
            clock,
            contract_multiplier,
            sweep_condition,
            out_of_order_tolerance_nanos: out_of_order_tolerance_ms.max(0).saturating_mul(1_000_000),
            open: BTreeMap::new(),
            closed_today: BTreeMap::new(),
            ready: Vec::new(),
            watermark: None,
            stats: AggregatorStats::default(),
        }
    }

    pub fn clock(&self) -> &SessionClock {
        &self.clock
    }

    /// Counters since construction.
    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Latest event time seen, from trades or ticks.
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    /// Open bucket for `symbol`, if it has traded since its last close.
    pub fn open_bucket(&self, symbol: &str) -> Option<&Bucket> {
        self.open.get(symbol)
    }

    /// Number of buckets still open.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Closed buckets of the current session for `symbol`.
    pub fn closed_buckets(&self, symbol: &str) -> &[ClosedBucket] {
        self.closed_today.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add a trade to its bucket, closing any buckets the new watermark passes.
    pub fn ingest(&mut self, trade: &Trade) -> IngestOutcome {
        let Some(notional) = trade.notional(self.contract_multiplier) else {
            return self.drop_overflow(trade);
        };
        let slot = self.clock.locate(trade.timestamp);

        if let Some(watermark) = self.watermark {
            if trade.timestamp < watermark.saturating_sub(self.out_of_order_tolerance_nanos) {
                self.stats.out_of_order_trades += 1;
                warn!(
                    "[DATA] Out-of-order trade for {}: {}ms behind watermark",
                    trade.underlying,
                    (watermark - trade.timestamp) / 1_000_000
                );
            }
        }

        let open_start = self.open.get(&trade.underlying).map(|b| b.bucket_start);
        match open_start {
            Some(start) if slot.bucket_start == start => {
                let fits = self
                    .open
                    .get(&trade.underlying)
                    .is_some_and(|bucket| bucket.accepts(trade, notional));
                if !fits {
                    return self.drop_overflow(trade);
                }
            }
            Some(start) if slot.bucket_start > start => {
                self.close_open(&trade.underlying);
                self.open_new(&trade.underlying, slot);
            }
            Some(_) => return self.drop_late(trade),
            None => {
                let last_closed = self
                    .closed_today
                    .get(&trade.underlying)
                    .and_then(|buckets| buckets.last())
                    .map(|b| b.bucket_start);
                if matches!(last_closed, Some(start) if start >= slot.bucket_start) {
                    return self.drop_late(trade);
                }
                self.open_new(&trade.underlying, slot);
            }
        }

        if let Some(bucket) = self.open.get_mut(&trade.underlying) {
            bucket.add(trade, notional, self.sweep_condition);
        }
        self.stats.trades_accepted += 1;

        self.advance_to(trade.timestamp);
        IngestOutcome::Accepted
    }

    /// Move the watermark forward and close every open bucket that ended at or before it.
    pub fn advance_to(&mut self, timestamp: i64) {
        let watermark = self.watermark.map_or(timestamp, |w| w.max(timestamp));
        self.watermark = Some(watermark);

        let mut expired: Vec<(i64, String)> = self
            .open
            .iter()
            .filter(|(_, bucket)| bucket.bucket_end() <= watermark)
            .map(|(symbol, bucket)| (bucket.bucket_start, symbol.clone()))
            .collect();
        expired.sort();

        for (_, symbol) in expired {
            self.close_open(&symbol);
        }
    }

    /// Explicitly close `symbol`'s open bucket if it starts at `bucket_start`.
    pub fn close_bucket(&mut self, symbol: &str, bucket_start: i64) -> Option<ClosedBucket> {
        if self.open.get(symbol)?.bucket_start != bucket_start {
            return None;
        }
        let bucket = self.open.remove(symbol)?;
        Some(self.record_closed(bucket))
    }

    /// Hand out buckets closed since the last drain, in close order.
    pub fn drain_closed(&mut self) -> Vec<ClosedBucket> {
        std::mem::take(&mut self.ready)
    }

    /// End-of-day: close every open bucket and return everything not yet drained.
    pub fn flush(&mut self) -> Vec<ClosedBucket> {
        let mut remaining: Vec<(i64, String)> = self
            .open
            .iter()
            .map(|(symbol, bucket)| (bucket.bucket_start, symbol.clone()))
            .collect();
        remaining.sort();

        for (_, symbol) in remaining {
            self.close_open(&symbol);
        }
        self.drain_closed()
    }

    /// Finish the session: hand out the day's closed buckets grouped per
    /// symbol and trading day, and clear all session state.
    ///
    /// Callers are expected to [`flush`](Self::flush) and evaluate first;
    /// anything still open or undrained here is archived without evaluation.
    pub fn end_session(&mut self) -> Vec<DayBuckets> {
        if !self.open.is_empty() || !self.ready.is_empty() {
            warn!(
                "[SESSION] Ending session with {} open and {} unevaluated buckets",
                self.open.len(),
                self.ready.len()
            );
            self.flush();
        }

        let mut days = Vec::new();
        for (symbol, buckets) in std::mem::take(&mut self.closed_today) {
            let mut by_day: BTreeMap<NaiveDate, Vec<ClosedBucket>> = BTreeMap::new();
            for bucket in buckets {
                by_day.entry(bucket.trading_day).or_default().push(bucket);
            }
            for (trading_day, buckets) in by_day {
                days.push(DayBuckets {
                    symbol: symbol.clone(),
                    trading_day,
                    buckets,
                });
            }
        }

        self.watermark = None;
        days
    }

    fn open_new(&mut self, symbol: &str, slot: BucketSlot) {
        self.open
            .insert(symbol.to_string(), Bucket::new(symbol, slot, self.clock.width_nanos()));
    }

    fn close_open(&mut self, symbol: &str) {
        if let Some(bucket) = self.open.remove(symbol) {
            let closed = self.record_closed(bucket);
            self.ready.push(closed);
        }
    }

    fn record_closed(&mut self, bucket: Bucket) -> ClosedBucket {
        debug!(
            "[BUCKET] Closed {} {} notional={} trades={}",
            bucket.symbol,
            bucket.bucket_of_day,
            bucket.notional(),
            bucket.trade_count
        );
        let closed = ClosedBucket::seal(bucket);
        self.closed_today
            .entry(closed.symbol.clone())
            .or_default()
            .push(closed.clone());
        self.stats.buckets_closed += 1;
        closed
    }

    fn drop_late(&mut self, trade: &Trade) -> IngestOutcome {
        self.stats.late_trades_dropped += 1;
        warn!(
            "[DATA] Dropping late trade for {} at {}: bucket already closed",
            trade.underlying,
            DateTime::<Utc>::from_timestamp_nanos(trade.timestamp)
        );
        IngestOutcome::LateDropped
    }

    fn drop_overflow(&mut self, trade: &Trade) -> IngestOutcome {
        self.stats.notional_overflow_dropped += 1;
        warn!(
            "[DATA] Dropping {} print for {}: notional out of range",
            trade.size, trade.underlying
        );
        IngestOutcome::NotionalOverflow
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    pub(crate) fn ny_nanos(day: u32, hour: u32, minute: u32, second: u32) -> i64 {
        chrono_tz::America::New_York
            .with_ymd_and_hms(2024, 3, day, hour, minute, second)
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_nanos_opt()
            .unwrap()
    }

    pub(crate) fn trade(symbol: &str, right: OptionRight, strike: Decimal, ts: i64, sweep: bool) -> Trade {
        Trade {
            underlying: symbol.to_string(),
            right,
            strike,
            expiry: NaiveDate::from_ymd_opt(2024, 4, 19).unwrap(),
            price: dec!(2.50),
            size: 10,
            timestamp: ts,
            conditions: if sweep { vec![209] } else { vec![] },
        }
    }

    fn aggregator() -> BucketAggregator {
        BucketAggregator::new(
            SessionClock::new(chrono_tz::America::New_York, 30),
            dec!(100),
            209,
            1_000,
        )
    }

    #[test]
    fn test_bucket_of_day_parse_and_display() {
        let slot: BucketOfDay = "09:30".parse().unwrap();
        assert_eq!(slot.minutes(), 570);
        assert_eq!(slot.to_string(), "09:30");
        assert!("24:00".parse::<BucketOfDay>().is_err());
        assert!("9h30".parse::<BucketOfDay>().is_err());
    }

    #[test]
    fn test_locate_floors_to_local_window() {
        let clock = SessionClock::new(chrono_tz::America::New_York, 30);
        let ts = ny_nanos(12, 9, 47, 13);
        let slot = clock.locate(ts);

        assert_eq!(slot.bucket_of_day.to_string(), "09:30");
        assert_eq!(slot.bucket_start, ny_nanos(12, 9, 30, 0));
        assert_eq!(slot.trading_day, NaiveDate::from_ymd_opt(2024, 3, 12).unwrap());
    }

    #[test]
    fn test_assignment_within_window_and_no_overlap() {
        let clock = SessionClock::new(chrono_tz::America::New_York, 30);
        let width = clock.width_nanos();

        let mut ts = ny_nanos(12, 9, 30, 0);
        let end = ny_nanos(12, 16, 0, 0);
        let mut last_start = None;
        while ts < end {
            let slot = clock.locate(ts);
            assert!(ts >= slot.bucket_start && ts < slot.bucket_start + width);
            if let Some(prev) = last_start {
                assert!(slot.bucket_start == prev || slot.bucket_start >= prev + width);
            }
            last_start = Some(slot.bucket_start);
            ts += 7 * 60 * NANOS_PER_SEC + 123_456_789;
        }

        // Boundary belongs to the next bucket
        let boundary = ny_nanos(12, 10, 0, 0);
        assert_eq!(clock.locate(boundary).bucket_start, boundary);
        assert_eq!(clock.locate(boundary - 1).bucket_start, ny_nanos(12, 9, 30, 0));
    }

    #[test]
    fn test_locate_across_dst_change() {
        // 2024-03-10 is the spring-forward date in New York
        let clock = SessionClock::new(chrono_tz::America::New_York, 30);
        let before = clock.locate(ny_nanos(8, 9, 45, 0));
        let after = clock.locate(ny_nanos(11, 9, 45, 0));

        assert_eq!(before.bucket_of_day, after.bucket_of_day);
    }

    #[test]
    fn test_ingest_accumulates_statistics() {
        let mut agg = aggregator();
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 31, 0), true));
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 35, 0), false));
        agg.ingest(&trade("AAPL", OptionRight::Put, dec!(140), ny_nanos(12, 9, 40, 0), false));

        let bucket = agg.open_bucket("AAPL").unwrap();
        assert_eq!(bucket.call_notional, dec!(5000));
        assert_eq!(bucket.put_notional, dec!(2500));
        assert_eq!(bucket.total_contracts, 30);
        assert_eq!(bucket.trade_count, 3);
        assert_eq!(bucket.unique_strikes.len(), 2);
        assert_eq!(bucket.sweep_trade_count, 1);
        assert_eq!(bucket.first_trade_at, ny_nanos(12, 9, 31, 0));
        assert_eq!(bucket.last_trade_at, ny_nanos(12, 9, 40, 0));
    }

    #[test]
    fn test_next_window_closes_bucket_for_all_symbols() {
        let mut agg = aggregator();
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 31, 0), false));
        agg.ingest(&trade("MSFT", OptionRight::Call, dec!(400), ny_nanos(12, 9, 32, 0), false));
        assert!(agg.drain_closed().is_empty());

        // A later AAPL trade pushes the watermark past both 09:30 buckets
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 10, 1, 0), false));
        let closed = agg.drain_closed();

        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].symbol, "AAPL");
        assert_eq!(closed[1].symbol, "MSFT");
        assert!(agg.open_bucket("MSFT").is_none());
        assert_eq!(agg.open_bucket("AAPL").unwrap().bucket_of_day.to_string(), "10:00");
    }

    #[test]
    fn test_late_trade_for_closed_bucket_is_dropped() {
        let mut agg = aggregator();
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 31, 0), false));
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 10, 5, 0), false));
        let closed = agg.drain_closed();
        assert_eq!(closed.len(), 1);

        let outcome = agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 50, 0), false));

        assert_eq!(outcome, IngestOutcome::LateDropped);
        assert_eq!(agg.stats().late_trades_dropped, 1);
        assert_eq!(agg.stats().out_of_order_trades, 1);
        assert_eq!(agg.closed_buckets("AAPL")[0].trade_count, 1);
    }

    #[test]
    fn test_out_of_order_within_open_bucket_is_accepted() {
        let mut agg = aggregator();
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 45, 0), false));
        let outcome = agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 40, 0), false));

        assert_eq!(outcome, IngestOutcome::Accepted);
        assert_eq!(agg.stats().out_of_order_trades, 1);
        assert_eq!(agg.open_bucket("AAPL").unwrap().trade_count, 2);
        assert_eq!(agg.open_bucket("AAPL").unwrap().first_trade_at, ny_nanos(12, 9, 40, 0));
    }

    #[test]
    fn test_bucket_total_overflow_is_dropped() {
        let mut agg = aggregator();
        let mut big = trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 31, 0), false);
        big.price = dec!(400000000000000000000000);
        big.size = 1000;
        assert_eq!(agg.ingest(&big), IngestOutcome::Accepted);

        // Fits alone, but not on top of the first print
        let mut second = big.clone();
        second.timestamp = ny_nanos(12, 9, 32, 0);
        assert_eq!(agg.ingest(&second), IngestOutcome::NotionalOverflow);

        let bucket = agg.open_bucket("AAPL").unwrap();
        assert_eq!(Some(bucket.call_notional), big.notional(dec!(100)));
        assert_eq!(bucket.trade_count, 1);
        assert_eq!(agg.stats().notional_overflow_dropped, 1);
        assert_eq!(agg.stats().trades_accepted, 1);
    }

    #[test]
    fn test_close_bucket_explicit() {
        let mut agg = aggregator();
        let ts = ny_nanos(12, 9, 31, 0);
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ts, false));

        assert!(agg.close_bucket("AAPL", ts).is_none());
        let closed = agg.close_bucket("AAPL", ny_nanos(12, 9, 30, 0)).unwrap();
        assert_eq!(closed.trade_count, 1);
        assert!(agg.open_bucket("AAPL").is_none());
        assert_eq!(agg.closed_buckets("AAPL").len(), 1);
    }

    #[test]
    fn test_flush_and_end_session() {
        let mut agg = aggregator();
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 31, 0), false));
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 10, 31, 0), false));
        agg.ingest(&trade("MSFT", OptionRight::Put, dec!(400), ny_nanos(12, 15, 55, 0), false));

        let flushed = agg.flush();
        assert_eq!(flushed.len(), 3);
        assert_eq!(agg.open_count(), 0);

        let days = agg.end_session();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].symbol(), "AAPL");
        assert_eq!(days[0].buckets().len(), 2);
        assert_eq!(days[1].symbol(), "MSFT");
        assert!(agg.closed_buckets("AAPL").is_empty());
        assert!(agg.watermark().is_none());
    }

    #[test]
    fn test_closed_bucket_snapshot_is_frozen() {
        let mut agg = aggregator();
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 31, 0), false));
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 10, 1, 0), false));
        let closed = agg.drain_closed().remove(0);
        let snapshot = closed.clone();

        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 10, 2, 0), false));
        agg.ingest(&trade("AAPL", OptionRight::Call, dec!(150), ny_nanos(12, 9, 59, 0), false));

        assert_eq!(agg.closed_buckets("AAPL")[0], snapshot);
    }
}
