//! Real-time engine: per-symbol state sharded across tokio tasks.
//!
//! Each shard owns a [`Pipeline`] for the underlyings that hash to it and
//! reads from its own bounded channel, so every symbol has a single writer.
//! Shards read baselines from an immutable `Arc<BaselineManager>` snapshot.
//! At rollover the coordinator collects every shard's finished buckets,
//! archives them into a fresh copy of the baseline and hands the new snapshot
//! out with the next session.

use std::sync::Arc;

use chrono::NaiveDate;
use common::{BaselineRow, TradeRecord};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::baseline::BaselineManager;
use crate::bucket::{DayBuckets, SessionClock};
use crate::config::EngineConfig;
use crate::emitter::OutboundQueue;
use crate::engine::{archive_sessions, validate_record, Pipeline};
use crate::metrics::EngineStats;
use crate::symbol::{self, SymbolCache};
use crate::trade::Trade;

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("shard {0} is no longer running")]
    Unavailable(usize),
}

enum ShardCommand {
    Trade(Trade),
    StartSession {
        trading_day: NaiveDate,
        baseline: Arc<BaselineManager>,
    },
    /// Advance event time to the given timestamp
    Tick(i64),
    EndSession(oneshot::Sender<ShardReport>),
    /// Current counters, mid-session
    Stats(oneshot::Sender<EngineStats>),
}

struct ShardReport {
    days: Vec<DayBuckets>,
    stats: EngineStats,
}

/// Outcome of a real-time session rollover. Triggers have already gone to
/// the outbound queue.
#[derive(Debug, Clone, Default)]
pub struct RolloverReport {
    pub trading_day: Option<NaiveDate>,
    /// Baseline rows archived for the ended session, ready to persist
    pub archived: Vec<BaselineRow>,
}

/// Shard index for an option identifier, stable across runs.
pub fn shard_for(identifier: &str, shards: usize) -> usize {
    // FNV-1a over the upper-cased root
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in symbol::root_of(identifier).bytes() {
        hash ^= u64::from(byte.to_ascii_uppercase());
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % shards.max(1) as u64) as usize
}

async fn run_shard(
    id: usize,
    config: EngineConfig,
    mut rx: mpsc::Receiver<ShardCommand>,
    outbound: Arc<OutboundQueue>,
    mut baseline: Arc<BaselineManager>,
) {
    let mut pipeline = Pipeline::new(&config);
    debug!("[SHARD {}] Started", id);

    while let Some(command) = rx.recv().await {
        let triggers = match command {
            ShardCommand::Trade(trade) => pipeline.ingest_trade(&trade, &baseline),
            ShardCommand::Tick(now) => pipeline.advance_to(now, &baseline),
            ShardCommand::StartSession {
                trading_day,
                baseline: snapshot,
            } => {
                baseline = snapshot;
                pipeline.start_session(trading_day);
                Vec::new()
            }
            ShardCommand::EndSession(reply) => {
                let (triggers, days) = pipeline.end_session(&baseline);
                for trigger in triggers {
                    outbound.push(trigger).await;
                }
                let report = ShardReport {
                    days,
                    stats: pipeline.stats(),
                };
                if reply.send(report).is_err() {
                    warn!("[SHARD {}] Coordinator dropped end-of-session reply", id);
                }
                continue;
            }
            ShardCommand::Stats(reply) => {
                if reply.send(pipeline.stats()).is_err() {
                    debug!("[SHARD {}] Stats request dropped", id);
                }
                continue;
            }
        };

        for trigger in triggers {
            outbound.push(trigger).await;
        }
    }

    debug!("[SHARD {}] Stopped", id);
}

/// Coordinator for the sharded real-time engine.
pub struct ShardedEngine {
    config: EngineConfig,
    clock: SessionClock,
    shards: Vec<mpsc::Sender<ShardCommand>>,
    handles: Vec<JoinHandle<()>>,
    baseline: Arc<BaselineManager>,
    /// Validates records before they can move the session
    symbols: SymbolCache,
    session_day: Option<NaiveDate>,
    /// Counters as of the last rollover, per shard
    shard_stats: Vec<EngineStats>,
    coordinator_stats: EngineStats,
}

impl ShardedEngine {
    /// Spawn `shard_count` shard tasks, each with a command channel of
    /// `channel_capacity`.
    pub fn spawn(
        config: EngineConfig,
        baseline: BaselineManager,
        shard_count: usize,
        channel_capacity: usize,
        outbound: Arc<OutboundQueue>,
    ) -> Self {
        let shard_count = shard_count.max(1);
        let baseline = Arc::new(baseline);

        let mut shards = Vec::with_capacity(shard_count);
        let mut handles = Vec::with_capacity(shard_count);
        for id in 0..shard_count {
            let (tx, rx) = mpsc::channel(channel_capacity.max(1));
            handles.push(tokio::spawn(run_shard(
                id,
                config.clone(),
                rx,
                outbound.clone(),
                baseline.clone(),
            )));
            shards.push(tx);
        }

        info!("[ENGINE] Spawned {} shards", shard_count);

        Self {
            clock: config.session_clock(),
            symbols: SymbolCache::new(config.symbol_cache_capacity),
            config,
            shards,
            handles,
            baseline,
            session_day: None,
            shard_stats: vec![EngineStats::default(); shard_count],
            coordinator_stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session_day(&self) -> Option<NaiveDate> {
        self.session_day
    }

    /// Current baseline snapshot.
    pub fn baseline(&self) -> Arc<BaselineManager> {
        self.baseline.clone()
    }

    /// Validate one record and route it to its shard. A valid trade from a
    /// later trading day rolls the session over first; rejected records
    /// never do.
    pub async fn ingest(&mut self, record: TradeRecord) -> Result<Option<RolloverReport>, ShardError> {
        let Some(trade) = validate_record(
            &record,
            &mut self.symbols,
            self.config.contract_multiplier,
            &mut self.coordinator_stats,
        ) else {
            return Ok(None);
        };
        let trading_day = self.clock.trading_day(trade.timestamp);
        let mut rollover = None;

        match self.session_day {
            None => self.start_session(trading_day).await?,
            Some(current) if trading_day > current => {
                rollover = Some(self.end_session().await?);
                self.start_session(trading_day).await?;
            }
            Some(current) if trading_day < current => {
                self.coordinator_stats.stale_day_dropped += 1;
                warn!(
                    "[DATA] Dropping {} for {}: session {} already active",
                    record.symbol, trading_day, current
                );
                return Ok(rollover);
            }
            Some(_) => {}
        }

        let shard = shard_for(&record.symbol, self.shards.len());
        self.send(shard, ShardCommand::Trade(trade)).await?;
        Ok(rollover)
    }

    /// Advance every shard's event time from the wall clock so quiet symbols
    /// close on schedule. The watermark trails `now` by the out-of-order
    /// tolerance, leaving room for prints still in flight.
    pub async fn tick(&self, now: i64) -> Result<(), ShardError> {
        if self.session_day.is_none() {
            return Ok(());
        }
        let tolerance = self.config.out_of_order_tolerance_ms.max(0).saturating_mul(1_000_000);
        let watermark = now.saturating_sub(tolerance);
        for shard in 0..self.shards.len() {
            self.send(shard, ShardCommand::Tick(watermark)).await?;
        }
        Ok(())
    }

    async fn start_session(&mut self, trading_day: NaiveDate) -> Result<(), ShardError> {
        info!("[SESSION] Starting {} on {} shards", trading_day, self.shards.len());
        for shard in 0..self.shards.len() {
            self.send(
                shard,
                ShardCommand::StartSession {
                    trading_day,
                    baseline: self.baseline.clone(),
                },
            )
            .await?;
        }
        self.session_day = Some(trading_day);
        Ok(())
    }

    /// Flush every shard, archive the finished day and publish the new
    /// baseline snapshot. The next session starts with the next trade.
    pub async fn end_session(&mut self) -> Result<RolloverReport, ShardError> {
        let Some(trading_day) = self.session_day.take() else {
            return Ok(RolloverReport::default());
        };

        let mut replies = Vec::with_capacity(self.shards.len());
        for shard in 0..self.shards.len() {
            let (tx, rx) = oneshot::channel();
            self.send(shard, ShardCommand::EndSession(tx)).await?;
            replies.push(rx);
        }

        let mut days = Vec::new();
        for (shard, reply) in replies.into_iter().enumerate() {
            let report = reply.await.map_err(|_| ShardError::Unavailable(shard))?;
            days.extend(report.days);
            self.shard_stats[shard] = report.stats;
        }
        days.sort_by(|a, b| {
            (a.symbol(), a.trading_day()).cmp(&(b.symbol(), b.trading_day()))
        });

        let mut next = (*self.baseline).clone();
        let (archived, skipped) = archive_sessions(&mut next, &days);
        self.baseline = Arc::new(next);
        self.coordinator_stats.baseline_rows_archived += archived.len() as u64;
        self.coordinator_stats.archive_skipped += skipped;
        self.coordinator_stats.sessions_completed += 1;

        info!(
            "[SESSION] Ended {}: {} symbol-days, {} baseline rows",
            trading_day,
            days.len(),
            archived.len()
        );

        Ok(RolloverReport {
            trading_day: Some(trading_day),
            archived,
        })
    }

    /// Counters summed across shards as of the last rollover. Use
    /// [`live_stats`](Self::live_stats) mid-session.
    pub fn stats(&self) -> EngineStats {
        self.combine(&self.shard_stats)
    }

    /// Counters summed across shards right now. Each shard answers after
    /// the commands already queued to it.
    pub async fn live_stats(&self) -> Result<EngineStats, ShardError> {
        let mut replies = Vec::with_capacity(self.shards.len());
        for shard in 0..self.shards.len() {
            let (tx, rx) = oneshot::channel();
            self.send(shard, ShardCommand::Stats(tx)).await?;
            replies.push(rx);
        }

        let mut current = Vec::with_capacity(replies.len());
        for (shard, reply) in replies.into_iter().enumerate() {
            current.push(reply.await.map_err(|_| ShardError::Unavailable(shard))?);
        }
        Ok(self.combine(&current))
    }

    fn combine(&self, shard_stats: &[EngineStats]) -> EngineStats {
        let mut total = EngineStats::default();
        for stats in shard_stats {
            total.merge(stats);
        }
        // Every shard sees every session
        total.sessions_completed = 0;
        total.merge(&self.coordinator_stats);
        total
    }

    /// End the active session and stop every shard.
    pub async fn shutdown(mut self) -> Result<(RolloverReport, EngineStats), ShardError> {
        let report = self.end_session().await?;
        let stats = self.stats();

        self.shards.clear();
        for (id, handle) in self.handles.into_iter().enumerate() {
            if handle.await.is_err() {
                warn!("[SHARD {}] Task panicked", id);
            }
        }
        info!("[ENGINE] All shards stopped");
        Ok((report, stats))
    }

    async fn send(&self, shard: usize, command: ShardCommand) -> Result<(), ShardError> {
        self.shards[shard]
            .send(command)
            .await
            .map_err(|_| ShardError::Unavailable(shard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::tests::ny_nanos;
    use crate::emitter::OverflowPolicy;
    use crate::engine::tests::{active_bucket, quiet_day, record};
    use crate::engine::ReplayEngine;
    use common::Trigger;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    /// Pop everything from a closed queue.
    async fn drain(queue: &OutboundQueue) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        while let Some(trigger) = queue.pop().await {
            triggers.push(trigger);
        }
        triggers
    }

    /// Three days across several symbols: two quiet days then a spike.
    fn input() -> Vec<TradeRecord> {
        let mut trades = Vec::new();
        for d in [11, 12] {
            trades.extend(quiet_day(d));
            trades.push(record("O:MSFT240419P00400000", dec!(4.00), 30, ny_nanos(d, 9, 50, 0), false));
            trades.push(record("O:TSLA240419C00200000", dec!(3.00), 20, ny_nanos(d, 14, 5, 0), false));
        }
        trades.extend(active_bucket(13));
        for i in 0..24u32 {
            trades.push(record("O:NVDA240419C00900000", dec!(2.50), 10, ny_nanos(13, 11, 2, i), true));
        }
        trades.push(record("O:MSFT240419P00400000", dec!(12.00), 100, ny_nanos(13, 9, 55, 0), false));
        trades.push(record("O:1234", dec!(1.00), 1, ny_nanos(13, 12, 0, 0), false));
        trades.sort_by_key(|t| t.timestamp);
        trades
    }

    fn sorted(mut triggers: Vec<Trigger>) -> Vec<Trigger> {
        triggers.sort_by(|a, b| (a.bucket_start, &a.symbol).cmp(&(b.bucket_start, &b.symbol)));
        triggers
    }

    #[test]
    fn test_shard_for_is_stable_and_in_range() {
        let a = shard_for("O:AAPL250117C00150000", 8);
        assert_eq!(a, shard_for("O:AAPL240419P00100000", 8));
        assert_eq!(a, shard_for("aapl250117C00150000", 8));
        assert!(a < 8);
        assert_eq!(shard_for("O:AAPL250117C00150000", 1), 0);
    }

    #[tokio::test]
    async fn test_sharded_matches_replay() {
        let config = EngineConfig::default();

        let mut replay = ReplayEngine::new(&config, config.baseline_manager());
        let mut expected = Vec::new();
        for trade in input() {
            expected.extend(replay.ingest(&trade));
        }
        expected.extend(replay.end_session().triggers);

        let queue = Arc::new(OutboundQueue::new(1024, OverflowPolicy::DropOldest));
        let mut engine = ShardedEngine::spawn(
            config.clone(),
            config.baseline_manager(),
            3,
            64,
            queue.clone(),
        );
        let mut rollovers = 0;
        for trade in input() {
            if engine.ingest(trade).await.unwrap().is_some() {
                rollovers += 1;
            }
        }
        let (last, stats) = engine.shutdown().await.unwrap();
        queue.close();
        let actual = drain(&queue).await;

        assert_eq!(rollovers, 2);
        assert_eq!(last.trading_day, Some(day(13)));
        assert!(!expected.is_empty());
        assert_eq!(sorted(actual), sorted(expected));
        assert_eq!(stats.rejected_symbol, 1);
        assert_eq!(stats.sessions_completed, 3);
    }

    #[tokio::test]
    async fn test_rollover_publishes_new_baseline() {
        let config = EngineConfig::default();
        let queue = Arc::new(OutboundQueue::new(16, OverflowPolicy::DropOldest));
        let mut engine = ShardedEngine::spawn(config.clone(), config.baseline_manager(), 2, 16, queue);

        for trade in quiet_day(11) {
            engine.ingest(trade).await.unwrap();
        }
        assert_eq!(engine.session_day(), Some(day(11)));
        assert_eq!(engine.baseline().symbol_count(), 0);

        let report = engine
            .ingest(quiet_day(12).remove(0))
            .await
            .unwrap()
            .expect("new day rolls the session over");

        assert_eq!(report.trading_day, Some(day(11)));
        assert_eq!(report.archived.len(), 1);
        assert_eq!(engine.baseline().last_archived("AAPL"), Some(day(11)));
        assert_eq!(engine.session_day(), Some(day(12)));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_closes_quiet_buckets() {
        let config = EngineConfig::default();
        let queue = Arc::new(OutboundQueue::new(16, OverflowPolicy::DropOldest));
        let mut engine = ShardedEngine::spawn(config.clone(), config.baseline_manager(), 1, 16, queue.clone());

        let mut trades = Vec::new();
        for i in 0..24u32 {
            trades.push(record("O:NEWCO240419C00020000", dec!(2.50), 10, ny_nanos(12, 11, 5, i), false));
        }
        for trade in trades {
            engine.ingest(trade).await.unwrap();
        }
        assert!(queue.is_empty());

        // Watermark trails the wall clock by the one second tolerance
        engine.tick(ny_nanos(12, 11, 30, 1)).await.unwrap();
        let trigger = tokio::time::timeout(std::time::Duration::from_secs(5), queue.pop())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(trigger.symbol, "NEWCO");
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_leaves_room_for_in_flight_prints() {
        let config = EngineConfig::default();
        let queue = Arc::new(OutboundQueue::new(16, OverflowPolicy::DropOldest));
        let mut engine = ShardedEngine::spawn(config.clone(), config.baseline_manager(), 1, 16, queue.clone());

        for i in 0..24u32 {
            let trade = record("O:NEWCO240419C00020000", dec!(2.50), 10, ny_nanos(12, 11, 5, i), false);
            engine.ingest(trade).await.unwrap();
        }

        // Wall clock reaches the bucket end before the last print arrives
        engine.tick(ny_nanos(12, 11, 30, 0)).await.unwrap();
        let straggler = record("O:NEWCO240419C00020000", dec!(2.50), 10, ny_nanos(12, 11, 29, 59), false);
        engine.ingest(straggler).await.unwrap();
        engine.tick(ny_nanos(12, 11, 30, 1)).await.unwrap();

        let trigger = tokio::time::timeout(std::time::Duration::from_secs(5), queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trigger.symbol, "NEWCO");
        assert_eq!(trigger.trade_count, 25);

        let stats = engine.live_stats().await.unwrap();
        assert_eq!(stats.trades_accepted, 25);
        assert_eq!(stats.late_trades_dropped, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_next_day_record_does_not_roll_session() {
        let config = EngineConfig::default();
        let queue = Arc::new(OutboundQueue::new(16, OverflowPolicy::DropOldest));
        let mut engine = ShardedEngine::spawn(config.clone(), config.baseline_manager(), 2, 16, queue);

        for trade in quiet_day(11) {
            engine.ingest(trade).await.unwrap();
        }

        let malformed = record("O:1234", dec!(1.00), 1, ny_nanos(12, 9, 31, 0), false);
        let zero_price = record("O:AAPL240419C00150000", dec!(0), 10, ny_nanos(12, 9, 32, 0), false);
        assert!(engine.ingest(malformed).await.unwrap().is_none());
        assert!(engine.ingest(zero_price).await.unwrap().is_none());

        assert_eq!(engine.session_day(), Some(day(11)));
        assert_eq!(engine.baseline().symbol_count(), 0);

        let stats = engine.live_stats().await.unwrap();
        assert_eq!(stats.rejected_symbol, 1);
        assert_eq!(stats.rejected_price, 1);
        assert_eq!(stats.stale_day_dropped, 0);

        let report = engine.ingest(quiet_day(12).remove(0)).await.unwrap();
        assert_eq!(report.map(|r| r.trading_day), Some(Some(day(11))));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_stats_reflect_current_session() {
        let config = EngineConfig::default();
        let queue = Arc::new(OutboundQueue::new(16, OverflowPolicy::DropOldest));
        let mut engine = ShardedEngine::spawn(config.clone(), config.baseline_manager(), 2, 16, queue);

        for trade in quiet_day(11) {
            engine.ingest(trade).await.unwrap();
        }

        // Snapshot counters only move at rollover
        assert_eq!(engine.stats().trades_accepted, 0);
        assert_eq!(engine.stats().trades_received, 2);

        let live = engine.live_stats().await.unwrap();
        assert_eq!(live.trades_received, 2);
        assert_eq!(live.trades_accepted, 2);
        assert_eq!(live.sessions_completed, 0);
        engine.shutdown().await.unwrap();
    }
}
