//! UOA Backtest
//!
//! Replays per-day option trade files through the deterministic engine,
//! building baselines day by day and reporting the triggers it would have
//! emitted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use clap::Parser;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{load_baseline_rows, upsert_baseline_rows, Config, Database, Trigger};
use uoa_engine::{
    ConfigProfile, CooldownPolicy, EngineConfig, FanoutSink, JsonlSink, PostgresSink, ReplayEngine,
    TriggerSink, TriggerSummary,
};

mod flatfile;

use flatfile::DayFile;

/// UOA Backtest - replay historical option trades through the detector
#[derive(Parser, Debug)]
#[command(name = "uoa-backtest")]
#[command(about = "Replays per-day option trade files through the UOA engine")]
struct Args {
    /// Directory of YYYY-MM-DD.csv / .jsonl trade files
    #[arg(long)]
    data_dir: PathBuf,

    /// First day to report triggers for (default: first file)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day to replay (default: last file)
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Files before --start replayed only to build baselines
    #[arg(long, default_value = "0")]
    warmup_days: usize,

    /// Threshold profile: live, backtest or rolling (default: UOA_PROFILE or backtest)
    #[arg(long)]
    profile: Option<ConfigProfile>,

    /// Write triggers as JSON lines to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Warm-start baselines from the database
    #[arg(long)]
    load_baseline: bool,

    /// Store triggers and archived baselines in the database
    #[arg(long)]
    persist: bool,

    /// Override the detection ratio threshold
    #[arg(long)]
    ratio_threshold: Option<Decimal>,

    /// Override the minimum bucket notional for ratio triggers
    #[arg(long)]
    min_notional: Option<Decimal>,

    /// Override the cold-start absolute notional floor
    #[arg(long)]
    absolute_floor: Option<Decimal>,

    /// Override the cooldown policy (per_day or minutes:N)
    #[arg(long)]
    cooldown: Option<CooldownPolicy>,
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

    info!("UOA Backtest starting...");

    let config = build_config(&args)?;
    info!(
        "Profile: {} | width {}m | lookback {}d | ratio >= {} | min ${} | floor ${} | cooldown {}",
        config.profile,
        config.bucket_width_minutes,
        config.baseline_lookback_days,
        config.detection_ratio_threshold,
        config.min_notional,
        config.absolute_notional_floor,
        config.cooldown_policy
    );

    let (warmup, replay) = select_days(flatfile::discover(&args.data_dir)?, &args);
    let Some(first_day) = warmup.first().or(replay.first()).map(|f| f.day) else {
        warn!("No day files selected in {}", args.data_dir.display());
        return Ok(());
    };
    info!(
        "Replaying {} days ({} warmup) from {}",
        replay.len(),
        warmup.len(),
        first_day
    );

    // Database only when asked for
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

    let mut baseline = config.baseline_manager();
    if let (true, Some(db)) = (args.load_baseline, &db) {
        let since = first_day - Duration::days(config.baseline_lookback_days as i64 * 2 + 7);
        let rows = load_baseline_rows(db.pool(), since, first_day).await?;
        let applied = baseline.load_rows(rows)?;
        info!(
            "[BASELINE] Loaded {} rows for {} symbols",
            applied,
            baseline.symbol_count()
        );
    }

    let sink = build_sink(&args, db.as_ref()).await?;
    let mut engine = ReplayEngine::new(&config, baseline);
    let mut all_triggers: Vec<Trigger> = Vec::new();
    let mut unreadable = 0u64;
    let started = Instant::now();

    let days = warmup
        .iter()
        .map(|f| (f, true))
        .chain(replay.iter().map(|f| (f, false)));
    for (file, is_warmup) in days {
        let trades = match flatfile::read_day(file) {
            Ok(trades) => trades,
            Err(e) => {
                error!("Skipping {}: {}", file.day, e);
                continue;
            }
        };
        unreadable += trades.unreadable;

        engine.start_session(file.day);
        let mut triggers = Vec::new();
        for record in &trades.records {
            triggers.extend(engine.ingest(record));
        }
        let report = engine.end_session();
        triggers.extend(report.triggers);

        if let Some(db) = &db {
            if args.persist && !report.archived.is_empty() {
                let written = upsert_baseline_rows(db.pool(), &report.archived)
                    .await
                    .context("Failed to persist baseline rows")?;
                info!("[BASELINE] Persisted {} rows for {}", written, file.day);
            }
        }

        if is_warmup {
            info!(
                "[WARMUP] {}: {} trades, {} triggers discarded",
                file.day,
                trades.records.len(),
                triggers.len()
            );
            continue;
        }

        info!(
            "{}: {} trades, {} triggers",
            file.day,
            trades.records.len(),
            triggers.len()
        );
        if let Some(sink) = &sink {
            for trigger in &triggers {
                if let Err(e) = sink.emit(trigger).await {
                    error!("[EMIT] Failed to emit {}: {}", trigger.trigger_id, e);
                }
            }
        }
        all_triggers.extend(triggers);
    }

    if let Some(sink) = &sink {
        sink.flush().await.context("Failed to flush trigger output")?;
    }

    info!(
        "Backtest finished in {:.1}s ({} unreadable rows)",
        started.elapsed().as_secs_f64(),
        unreadable
    );
    TriggerSummary::from_triggers(&all_triggers).print_report("UOA BACKTEST SUMMARY", &engine.stats());

    Ok(())
}

/// Env config with CLI overrides on top.
fn build_config(args: &Args) -> Result<EngineConfig> {
    let profile = args.profile.or_else(|| {
        // Backtests default to the backtest profile unless the env says otherwise
        std::env::var("UOA_PROFILE")
            .is_err()
            .then_some(ConfigProfile::Backtest)
    });
    let mut config = EngineConfig::from_env_with_profile(profile)?;

    if let Some(v) = args.ratio_threshold {
        config.detection_ratio_threshold = v;
    }
    if let Some(v) = args.min_notional {
        config.min_notional = v;
    }
    if let Some(v) = args.absolute_floor {
        config.absolute_notional_floor = v;
    }
    if let Some(v) = args.cooldown {
        config.cooldown_policy = v;
    }

    config.validate()?;
    Ok(config)
}

/// Split discovered files into (warmup, replay) according to the CLI range.
fn select_days(files: Vec<DayFile>, args: &Args) -> (Vec<DayFile>, Vec<DayFile>) {
    let in_range = |day: NaiveDate| {
        args.start.map_or(true, |s| day >= s) && args.end.map_or(true, |e| day <= e)
    };

    let first_replay = files
        .iter()
        .position(|f| in_range(f.day))
        .unwrap_or(files.len());
    let warmup_start = first_replay.saturating_sub(args.warmup_days);

    let warmup = files[warmup_start..first_replay].to_vec();
    let replay = files[first_replay..]
        .iter()
        .filter(|f| in_range(f.day))
        .cloned()
        .collect();
    (warmup, replay)
}

async fn build_sink(args: &Args, db: Option<&Database>) -> Result<Option<Arc<dyn TriggerSink>>> {
    let mut sinks: Vec<Arc<dyn TriggerSink>> = Vec::new();

    if let Some(path) = &args.output {
        let sink = JsonlSink::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        info!("Writing triggers to {}", path.display());
        sinks.push(Arc::new(sink));
    }
    if let (true, Some(db)) = (args.persist, db) {
        sinks.push(Arc::new(PostgresSink::new(db.pool().clone())));
    }

    Ok(match sinks.len() {
        0 => None,
        1 => sinks.pop(),
        _ => Some(Arc::new(FanoutSink::new(sinks))),
    })
}
