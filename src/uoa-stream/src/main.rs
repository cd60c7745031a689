//! UOA Stream
//!
//! Real-time unusual options activity detection. Reads option trades as
//! JSON lines on stdin, shards them across tokio tasks and emits triggers
//! through a bounded outbound queue.
//!
//! Usage:
//!   feed | cargo run -p uoa-stream -- --shards 8 --output triggers.jsonl

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{load_baseline_rows, upsert_baseline_rows, BaselineRow, Config, Database, TradeRecord};
use uoa_engine::{
    run_dispatcher, BaselineManager, ConfigProfile, EngineConfig, FanoutSink, JsonlSink,
    OutboundQueue, OverflowPolicy, PostgresSink, RolloverReport, ShardedEngine, TriggerSink,
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Overflow {
    /// Evict the oldest queued trigger
    DropOldest,
    /// Wait up to --block-timeout-ms for room, then drop the new trigger
    Block,
}

/// UOA Stream - real-time unusual options activity detection
#[derive(Parser, Debug)]
#[command(name = "uoa-stream")]
#[command(about = "Detects unusual options activity in a live trade feed (JSON lines on stdin)")]
struct Args {
    /// Number of shard tasks
    #[arg(long, default_value = "4")]
    shards: usize,

    /// Per-shard command channel capacity
    #[arg(long, default_value = "10000")]
    channel_capacity: usize,

    /// Outbound trigger queue capacity
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,

    /// What to do when the outbound queue is full
    #[arg(long, value_enum, default_value = "drop-oldest")]
    overflow: Overflow,

    /// Max wait for queue space with --overflow block
    #[arg(long, default_value = "500")]
    block_timeout_ms: u64,

    /// Write triggers as JSON lines to this file (default: stdout)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Threshold profile: live, backtest or rolling (default: UOA_PROFILE or live)
    #[arg(long)]
    profile: Option<ConfigProfile>,

    /// Warm-start baselines from a JSON lines file of baseline rows
    #[arg(long)]
    baseline_file: Option<PathBuf>,

    /// Write the final baseline window to this file on shutdown
    #[arg(long)]
    save_baseline: Option<PathBuf>,

    /// Warm-start baselines from the database
    #[arg(long)]
    load_baseline: bool,

    /// Store triggers and archived baselines in the database
    #[arg(long)]
    persist: bool,

    /// Wall-clock tick closing buckets of quiet symbols (0 disables; use 0
    /// when piping historical data)
    #[arg(long, default_value = "1000")]
    tick_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with RUST_LOG env var support (default: info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    info!("UOA Stream starting...");

    let config = EngineConfig::from_env_with_profile(args.profile)?;
    info!(
        "Profile: {} | width {}m | lookback {}d | ratio >= {} | min ${} | cooldown {}",
        config.profile,
        config.bucket_width_minutes,
        config.baseline_lookback_days,
        config.detection_ratio_threshold,
        config.min_notional,
        config.cooldown_policy
    );
    info!(
        "Shards: {} | queue {} ({:?}) | tick {}ms",
        args.shards, args.queue_capacity, args.overflow, args.tick_ms
    );

    let db = if args.load_baseline || args.persist {
        let base_config = Config::from_env()?;
        let db = Database::connect(&base_config)
            .await
            .context("--load-baseline/--persist need DATABASE_URL")?;
        db.health_check().await?;
        info!("Database connected");
        Some(db)
    } else {
        None
    };

    let baseline = warm_start(&args, &config, db.as_ref()).await?;

    // Outbound queue and dispatcher
    let policy = match args.overflow {
        Overflow::DropOldest => OverflowPolicy::DropOldest,
        Overflow::Block => OverflowPolicy::Block {
            timeout: Duration::from_millis(args.block_timeout_ms),
        },
    };
    let queue = Arc::new(OutboundQueue::new(args.queue_capacity, policy));
    let sink = build_sink(&args, db.as_ref()).await?;
    let dispatcher = tokio::spawn(run_dispatcher(queue.clone(), sink));

    let mut engine = ShardedEngine::spawn(
        config,
        baseline,
        args.shards,
        args.channel_capacity,
        queue.clone(),
    );

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut unreadable: u64 = 0;

    let tick_enabled = args.tick_ms > 0;
    let mut tick_interval = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(60));
    heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting...");
                break;
            }
            _ = heartbeat_interval.tick() => {
                let stats = engine.live_stats().await?;
                info!(
                    "[ALIVE] Session {:?} | accepted {} | triggers {} | queued {} | dropped {} | unreadable {}",
                    engine.session_day(),
                    stats.trades_accepted,
                    stats.triggers_emitted,
                    queue.len(),
                    queue.dropped(),
                    unreadable
                );
            }
            _ = tick_interval.tick(), if tick_enabled => {
                if let Some(now) = Utc::now().timestamp_nanos_opt() {
                    engine.tick(now).await?;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let record = match serde_json::from_str::<TradeRecord>(&line) {
                            Ok(record) => record,
                            Err(e) => {
                                unreadable += 1;
                                warn!("[DATA] Unreadable line: {}", e);
                                continue;
                            }
                        };
                        if let Some(report) = engine.ingest(record).await? {
                            persist_rollover(db.as_ref(), &report).await;
                        }
                    }
                    Ok(None) => {
                        info!("Input closed, shutting down...");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                }
            }
        }
    }

    let baseline = engine.baseline();
    let (report, stats) = engine.shutdown().await?;
    persist_rollover(db.as_ref(), &report).await;

    queue.close();
    let dispatched = dispatcher.await.context("Dispatcher task failed")?;

    // The final session was archived into a snapshot taken before shutdown,
    // so fold its rows in before saving.
    if let Some(path) = &args.save_baseline {
        let mut rows = baseline.to_rows();
        rows.extend(report.archived.iter().cloned());
        write_baseline_file(path, &rows)?;
        info!("[BASELINE] Saved {} rows to {}", rows.len(), path.display());
    }

    info!(
        "Stream finished: {} emitted, {} failed, {} dropped, {} unreadable lines",
        dispatched.emitted,
        dispatched.failed,
        queue.dropped(),
        unreadable
    );
    info!("[ENGINE] Final stats: {}", serde_json::to_string(&stats)?);

    Ok(())
}

/// Build the starting baseline from the file and/or database sources.
async fn warm_start(args: &Args, config: &EngineConfig, db: Option<&Database>) -> Result<BaselineManager> {
    let mut baseline = config.baseline_manager();

    if let Some(path) = &args.baseline_file {
        let rows = read_baseline_file(path)?;
        let applied = baseline.load_rows(rows)?;
        info!("[BASELINE] Loaded {} rows from {}", applied, path.display());
    }

    if let (true, Some(db)) = (args.load_baseline, db) {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .context("System clock out of range")?;
        let today = config.session_clock().trading_day(now);
        let since = today - chrono::Duration::days(config.baseline_lookback_days as i64 * 2 + 7);
        let rows = load_baseline_rows(db.pool(), since, today).await?;
        let applied = baseline.load_rows(rows)?;
        info!("[BASELINE] Loaded {} rows from database", applied);
    }

    info!("[BASELINE] Warm start covers {} symbols", baseline.symbol_count());
    Ok(baseline)
}

async fn build_sink(args: &Args, db: Option<&Database>) -> Result<Arc<dyn TriggerSink>> {
    let output: Arc<dyn TriggerSink> = match &args.output {
        Some(path) => {
            let sink = JsonlSink::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            info!("Writing triggers to {}", path.display());
            Arc::new(sink)
        }
        None => Arc::new(JsonlSink::stdout()),
    };

    Ok(match (args.persist, db) {
        (true, Some(db)) => Arc::new(FanoutSink::new(vec![
            output,
            Arc::new(PostgresSink::new(db.pool().clone())),
        ])),
        _ => output,
    })
}

/// Store a finished session's baseline rows. Failures are logged; the
/// in-memory baseline already has them.
async fn persist_rollover(db: Option<&Database>, report: &RolloverReport) {
    let Some(db) = db else { return };
    if report.archived.is_empty() {
        return;
    }

    match upsert_baseline_rows(db.pool(), &report.archived).await {
        Ok(written) => info!(
            "[BASELINE] Persisted {} rows for {:?}",
            written, report.trading_day
        ),
        Err(e) => error!("[BASELINE] Failed to persist rows: {}", e),
    }
}

fn read_baseline_file(path: &Path) -> Result<Vec<BaselineRow>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: bad baseline row", path.display(), line_no + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

fn write_baseline_file(path: &Path, rows: &[BaselineRow]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
