//! Engine counters and run summaries.

use std::collections::BTreeMap;

use common::{Direction, SignalType, Trigger};
use serde::Serialize;

use crate::trade::RejectReason;

/// Ingest and detection counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub trades_received: u64,
    pub trades_accepted: u64,
    pub rejected_symbol: u64,
    pub rejected_price: u64,
    pub rejected_size: u64,
    /// Prints whose notional does not fit, alone or added to their bucket
    pub rejected_notional: u64,
    /// Trades for a trading day that had already ended
    pub stale_day_dropped: u64,
    pub late_trades_dropped: u64,
    pub out_of_order_trades: u64,
    pub buckets_closed: u64,
    pub buckets_evaluated: u64,
    pub triggers_emitted: u64,
    pub triggers_suppressed: u64,
    pub sessions_completed: u64,
    pub baseline_rows_archived: u64,
    pub archive_skipped: u64,
}

impl EngineStats {
    pub fn record_reject(&mut self, reason: &RejectReason) {
        match reason {
            RejectReason::Symbol(_) => self.rejected_symbol += 1,
            RejectReason::NonPositivePrice(_) => self.rejected_price += 1,
            RejectReason::NonPositiveSize(_) => self.rejected_size += 1,
            RejectReason::NotionalOverflow { .. } => self.rejected_notional += 1,
        }
    }

    pub fn rejected(&self) -> u64 {
        self.rejected_symbol + self.rejected_price + self.rejected_size + self.rejected_notional
    }

    /// Add another engine's (or shard's) counters into this one.
    pub fn merge(&mut self, other: &EngineStats) {
        self.trades_received += other.trades_received;
        self.trades_accepted += other.trades_accepted;
        self.rejected_symbol += other.rejected_symbol;
        self.rejected_price += other.rejected_price;
        self.rejected_size += other.rejected_size;
        self.rejected_notional += other.rejected_notional;
        self.stale_day_dropped += other.stale_day_dropped;
        self.late_trades_dropped += other.late_trades_dropped;
        self.out_of_order_trades += other.out_of_order_trades;
        self.buckets_closed += other.buckets_closed;
        self.buckets_evaluated += other.buckets_evaluated;
        self.triggers_emitted += other.triggers_emitted;
        self.triggers_suppressed += other.triggers_suppressed;
        self.sessions_completed += other.sessions_completed;
        self.baseline_rows_archived += other.baseline_rows_archived;
        self.archive_skipped += other.archive_skipped;
    }
}

/// Aggregate view of the triggers a run produced.
#[derive(Debug, Clone)]
pub struct TriggerSummary {
    pub total: usize,
    pub ratio_triggers: usize,
    pub high_absolute_volume: usize,
    pub bullish: usize,
    pub bearish: usize,
    pub neutral: usize,
    pub avg_score: f64,
    pub min_score: i32,
    pub max_score: i32,
    pub p50_score: i32,
    pub p95_score: i32,
    pub p99_score: i32,
    /// Most active symbols, by trigger count then name
    pub top_symbols: Vec<(String, usize)>,
}

impl TriggerSummary {
    pub fn from_triggers(triggers: &[Trigger]) -> Self {
        let mut scores: Vec<i32> = triggers.iter().map(|t| t.score).collect();
        scores.sort();
        let count = scores.len();

        let mut per_symbol: BTreeMap<&str, usize> = BTreeMap::new();
        for trigger in triggers {
            *per_symbol.entry(trigger.symbol.as_str()).or_default() += 1;
        }
        let mut top_symbols: Vec<(String, usize)> = per_symbol
            .into_iter()
            .map(|(symbol, n)| (symbol.to_string(), n))
            .collect();
        top_symbols.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_symbols.truncate(10);

        let by_signal = |signal: SignalType| triggers.iter().filter(|t| t.signal_type == signal).count();
        let by_direction = |direction: Direction| {
            triggers
                .iter()
                .filter(|t| t.score_components.direction == direction)
                .count()
        };

        let total_score: i64 = scores.iter().map(|s| i64::from(*s)).sum();

        Self {
            total: count,
            ratio_triggers: by_signal(SignalType::RatioTrigger),
            high_absolute_volume: by_signal(SignalType::HighAbsoluteVolume),
            bullish: by_direction(Direction::Bullish),
            bearish: by_direction(Direction::Bearish),
            neutral: by_direction(Direction::Neutral),
            avg_score: if count == 0 { 0.0 } else { total_score as f64 / count as f64 },
            min_score: scores.first().copied().unwrap_or(0),
            max_score: scores.last().copied().unwrap_or(0),
            p50_score: scores.get(count / 2).copied().unwrap_or(0),
            p95_score: scores.get(count * 95 / 100).copied().unwrap_or(0),
            p99_score: scores.get(count * 99 / 100).copied().unwrap_or(0),
            top_symbols,
        }
    }

    /// Print a formatted run report.
    pub fn print_report(&self, title: &str, stats: &EngineStats) {
        let top = self
            .top_symbols
            .iter()
            .map(|(symbol, n)| format!("{}({})", symbol, n))
            .collect::<Vec<_>>()
            .join(", ");

        println!(
            r#"
═══════════════════════════════════════════════════════════════
  {}
═══════════════════════════════════════════════════════════════
  Sessions:         {}
  Trades received:  {}
  Trades accepted:  {}
  Rejected:         {} (symbol {}, price {}, size {}, notional {})
  Late / stale:     {} / {}
  Buckets closed:   {}

  Triggers:         {}
    Ratio:          {}
    High volume:    {}
    Suppressed:     {}
    Bull/Bear/Neut: {} / {} / {}

  Score:
    Average:        {:.2}
    Min:            {}
    Max:            {}
    P50:            {}
    P95:            {}
    P99:            {}

  Top symbols:      {}
═══════════════════════════════════════════════════════════════
"#,
            title,
            stats.sessions_completed,
            stats.trades_received,
            stats.trades_accepted,
            stats.rejected(),
            stats.rejected_symbol,
            stats.rejected_price,
            stats.rejected_size,
            stats.rejected_notional,
            stats.late_trades_dropped,
            stats.stale_day_dropped,
            stats.buckets_closed,
            self.total,
            self.ratio_triggers,
            self.high_absolute_volume,
            stats.triggers_suppressed,
            self.bullish,
            self.bearish,
            self.neutral,
            self.avg_score,
            self.min_score,
            self.max_score,
            self.p50_score,
            self.p95_score,
            self.p99_score,
            if top.is_empty() { "-" } else { top.as_str() },
        );
    }
}
