//! Detection pipeline and the deterministic replay engine.
//!
//! [`Pipeline`] owns the per-symbol state (open buckets, cooldowns) for one
//! set of symbols and reads baselines from a borrowed [`BaselineManager`].
//! [`ReplayEngine`] wraps a single pipeline with the baseline it archives
//! into; the sharded engine runs one pipeline per shard.

use chrono::NaiveDate;
use common::{BaselineRow, ScoreComponents, TradeRecord, Trigger};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::baseline::BaselineManager;
use crate::bucket::{BucketAggregator, ClosedBucket, DayBuckets, IngestOutcome, SessionClock};
use crate::config::EngineConfig;
use crate::detector::{Detection, Detector, Evaluation};
use crate::metrics::EngineStats;
use crate::scorer::Scorer;
use crate::symbol::SymbolCache;
use crate::trade::Trade;

/// Count one raw record and validate it. Rejections are tallied in `stats`.
pub(crate) fn validate_record(
    record: &TradeRecord,
    symbols: &mut SymbolCache,
    contract_multiplier: Decimal,
    stats: &mut EngineStats,
) -> Option<Trade> {
    stats.trades_received += 1;

    match Trade::from_record(record, symbols, contract_multiplier) {
        Ok(trade) => Some(trade),
        Err(reason) => {
            stats.record_reject(&reason);
            debug!("[DATA] Rejected {}: {}", record.symbol, reason);
            None
        }
    }
}

/// Build the emitted record for a triggered bucket.
///
/// The id is derived from symbol and bucket start, so replays reproduce it.
pub fn build_trigger(bucket: &ClosedBucket, detection: &Detection, components: ScoreComponents) -> Trigger {
    let key = format!("{}:{}", bucket.symbol, bucket.bucket_start);

    Trigger {
        trigger_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
        symbol: bucket.symbol.clone(),
        signal_type: detection.signal_type(),
        trading_day: bucket.trading_day,
        bucket_start: bucket.bucket_start_utc(),
        bucket_of_day: bucket.bucket_of_day.to_string(),
        detection_time: bucket.bucket_end_utc(),
        bucket_notional: bucket.notional(),
        call_notional: bucket.call_notional,
        put_notional: bucket.put_notional,
        trade_count: i64::try_from(bucket.trade_count).unwrap_or(i64::MAX),
        baseline_notional: detection.baseline().map(|b| b.round_dp(2)),
        ratio: detection.ratio().map(|r| r.round_dp(4)),
        score: components.total(),
        score_components: components,
    }
}

/// Aggregation, detection and scoring for one set of symbols.
pub struct Pipeline {
    aggregator: BucketAggregator,
    detector: Detector,
    scorer: Scorer,
    symbols: SymbolCache,
    contract_multiplier: Decimal,
    session_day: Option<NaiveDate>,
    stats: EngineStats,
}

impl Pipeline {
    /// Create a pipeline with no active session.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            aggregator: config.aggregator(),
            detector: Detector::new(config.detector_config()),
            scorer: Scorer::new(config.score_weights.clone()),
            symbols: SymbolCache::new(config.symbol_cache_capacity),
            contract_multiplier: config.contract_multiplier,
            session_day: None,
            stats: EngineStats::default(),
        }
    }

    pub fn clock(&self) -> &SessionClock {
        self.aggregator.clock()
    }

    pub fn session_day(&self) -> Option<NaiveDate> {
        self.session_day
    }

    pub fn aggregator(&self) -> &BucketAggregator {
        &self.aggregator
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    /// Reset cooldowns and make `trading_day` the active session.
    pub fn start_session(&mut self, trading_day: NaiveDate) {
        self.detector.start_session(trading_day);
        self.session_day = Some(trading_day);
    }

    /// Count and validate a raw record. A rejected record touches no
    /// session or bucket state.
    pub fn validate(&mut self, record: &TradeRecord) -> Option<Trade> {
        validate_record(record, &mut self.symbols, self.contract_multiplier, &mut self.stats)
    }

    /// Aggregate a trade that already passed [`validate`](Self::validate)
    /// (here or in a coordinator), returning any triggers from buckets it
    /// caused to close.
    ///
    /// Opens a session for the trade's day if none is active. Trades for a day
    /// before the active session are dropped.
    pub fn ingest_trade(&mut self, trade: &Trade, baseline: &BaselineManager) -> Vec<Trigger> {
        let trading_day = self.clock().trading_day(trade.timestamp);
        match self.session_day {
            None => self.start_session(trading_day),
            Some(current) if trading_day < current => {
                self.stats.stale_day_dropped += 1;
                warn!(
                    "[DATA] Dropping {} trade for {}: session {} already active",
                    trade.underlying, trading_day, current
                );
                return Vec::new();
            }
            Some(_) => {}
        }

        if self.aggregator.ingest(trade) == IngestOutcome::Accepted {
            self.stats.trades_accepted += 1;
        }
        self.evaluate_ready(baseline)
    }

    /// Move event time forward without a trade, closing quiet buckets.
    pub fn advance_to(&mut self, timestamp: i64, baseline: &BaselineManager) -> Vec<Trigger> {
        self.aggregator.advance_to(timestamp);
        self.detector.cleanup_cooldowns(timestamp);
        self.evaluate_ready(baseline)
    }

    /// Close and evaluate every open bucket.
    pub fn flush(&mut self, baseline: &BaselineManager) -> Vec<Trigger> {
        let closed = self.aggregator.flush();
        self.evaluate(closed, baseline)
    }

    /// Flush, evaluate, and hand back the finished session's buckets for archival.
    pub fn end_session(&mut self, baseline: &BaselineManager) -> (Vec<Trigger>, Vec<DayBuckets>) {
        let triggers = self.flush(baseline);
        let days = self.aggregator.end_session();
        if self.session_day.take().is_some() {
            self.stats.sessions_completed += 1;
        }
        (triggers, days)
    }

    /// Counters, including the aggregator's and detector's.
    pub fn stats(&self) -> EngineStats {
        let aggregator = self.aggregator.stats();
        let detector = self.detector.stats();
        EngineStats {
            rejected_notional: self.stats.rejected_notional + aggregator.notional_overflow_dropped,
            late_trades_dropped: aggregator.late_trades_dropped,
            out_of_order_trades: aggregator.out_of_order_trades,
            buckets_closed: aggregator.buckets_closed,
            buckets_evaluated: detector.evaluated,
            triggers_emitted: detector.triggered,
            triggers_suppressed: detector.suppressed,
            ..self.stats.clone()
        }
    }

    fn evaluate_ready(&mut self, baseline: &BaselineManager) -> Vec<Trigger> {
        let closed = self.aggregator.drain_closed();
        if closed.is_empty() {
            return Vec::new();
        }
        self.evaluate(closed, baseline)
    }

    fn evaluate(&mut self, closed: Vec<ClosedBucket>, baseline: &BaselineManager) -> Vec<Trigger> {
        let mut triggers = Vec::new();

        for bucket in closed {
            let value = baseline.get_baseline(&bucket.symbol, bucket.bucket_of_day, bucket.trading_day);
            match self.detector.evaluate(&bucket, &value) {
                Evaluation::Triggered(detection) => {
                    let components = self.scorer.score(&bucket, detection.ratio());
                    let trigger = build_trigger(&bucket, &detection, components);
                    info!(
                        "[TRIGGER] {} {} {} notional={} ratio={} score={}",
                        trigger.symbol,
                        trigger.bucket_of_day,
                        trigger.signal_type,
                        trigger.bucket_notional,
                        trigger
                            .ratio
                            .map_or_else(|| "-".to_string(), |r| r.to_string()),
                        trigger.score
                    );
                    triggers.push(trigger);
                }
                Evaluation::Suppressed(_) | Evaluation::BelowThreshold => {}
            }
        }

        triggers
    }
}

/// Everything a completed session produced.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub trading_day: Option<NaiveDate>,
    /// Triggers from the end-of-day flush
    pub triggers: Vec<Trigger>,
    /// Baseline rows archived for the session, ready to persist
    pub archived: Vec<BaselineRow>,
}

/// Archive a finished session's buckets, skipping days the baseline already holds.
///
/// Returns the rows written and the number of (symbol, day) groups skipped.
pub fn archive_sessions(baseline: &mut BaselineManager, days: &[DayBuckets]) -> (Vec<BaselineRow>, u64) {
    let mut rows = Vec::new();
    let mut skipped = 0;

    for day in days {
        match baseline.archive_day(day) {
            Ok(written) => rows.extend(written),
            Err(e) => {
                skipped += 1;
                warn!("[BASELINE] Skipping archive: {}", e);
            }
        }
    }

    if !rows.is_empty() {
        info!(
            "[BASELINE] Archived {} rows for {} symbol-days",
            rows.len(),
            days.len() as u64 - skipped
        );
    }
    (rows, skipped)
}

/// Single-threaded, deterministic engine for replaying historical days.
///
/// Feed each day's trades in timestamp order. A trade from a later trading
/// day closes the current session first (flush, evaluate, archive).
pub struct ReplayEngine {
    pipeline: Pipeline,
    baseline: BaselineManager,
    /// Rows archived by implicit rollovers, not yet returned
    pending_rows: Vec<BaselineRow>,
    archive_stats: EngineStats,
}

impl ReplayEngine {
    /// Create an engine reading and archiving into `baseline`.
    pub fn new(config: &EngineConfig, baseline: BaselineManager) -> Self {
        Self {
            pipeline: Pipeline::new(config),
            baseline,
            pending_rows: Vec::new(),
            archive_stats: EngineStats::default(),
        }
    }

    pub fn baseline(&self) -> &BaselineManager {
        &self.baseline
    }

    pub fn into_baseline(self) -> BaselineManager {
        self.baseline
    }

    pub fn session_day(&self) -> Option<NaiveDate> {
        self.pipeline.session_day()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Begin a session explicitly. Ends the active one first if it is older.
    pub fn start_session(&mut self, trading_day: NaiveDate) -> Option<SessionReport> {
        let previous = match self.session_day() {
            Some(current) if current == trading_day => return None,
            Some(_) => Some(self.end_session()),
            None => None,
        };
        info!("[SESSION] Starting {}", trading_day);
        self.pipeline.start_session(trading_day);
        previous
    }

    /// Ingest one record. Only a valid trade from a later trading day can
    /// roll the session over.
    pub fn ingest(&mut self, record: &TradeRecord) -> Vec<Trigger> {
        let Some(trade) = self.pipeline.validate(record) else {
            return Vec::new();
        };
        let mut triggers = Vec::new();

        let trading_day = self.pipeline.clock().trading_day(trade.timestamp);
        if matches!(self.session_day(), Some(current) if trading_day > current) {
            let report = self.end_session();
            triggers.extend(report.triggers);
            self.pending_rows.extend(report.archived);
            self.pipeline.start_session(trading_day);
        }

        triggers.extend(self.pipeline.ingest_trade(&trade, &self.baseline));
        triggers
    }

    /// Advance event time without a trade (closes buckets of quiet symbols).
    pub fn advance_to(&mut self, timestamp: i64) -> Vec<Trigger> {
        self.pipeline.advance_to(timestamp, &self.baseline)
    }

    /// Flush and evaluate every open bucket, then archive the day.
    pub fn end_session(&mut self) -> SessionReport {
        let trading_day = self.pipeline.session_day();
        let (triggers, days) = self.pipeline.end_session(&self.baseline);
        let (archived, skipped) = archive_sessions(&mut self.baseline, &days);

        self.archive_stats.baseline_rows_archived += archived.len() as u64;
        self.archive_stats.archive_skipped += skipped;

        if let Some(day) = trading_day {
            info!(
                "[SESSION] Ended {}: {} flush triggers, {} baseline rows",
                day,
                triggers.len(),
                archived.len()
            );
        }

        let mut rows = std::mem::take(&mut self.pending_rows);
        rows.extend(archived);

        SessionReport {
            trading_day,
            triggers,
            archived: rows,
        }
    }

    /// Rows archived by implicit rollovers since the last call.
    pub fn take_archived_rows(&mut self) -> Vec<BaselineRow> {
        std::mem::take(&mut self.pending_rows)
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.pipeline.stats();
        stats.baseline_rows_archived += self.archive_stats.baseline_rows_archived;
        stats.archive_skipped += self.archive_stats.archive_skipped;
        stats
    }
}
