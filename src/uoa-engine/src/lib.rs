//! Unusual options activity detection engine.
//!
//! Trades flow `symbol -> trade -> bucket -> detector -> scorer -> emitter`.
//! Baselines are owned by [`BaselineManager`] and only grow from completed
//! sessions, so detection never sees the day it is evaluating.
//!
//! - [`ReplayEngine`]: single-threaded, deterministic historical replay
//! - [`ShardedEngine`]: real-time mode, symbols sharded across tokio tasks

pub mod baseline;
pub mod bucket;
pub mod config;
pub mod detector;
pub mod emitter;
pub mod engine;
pub mod metrics;
pub mod scorer;
pub mod sharded;
pub mod symbol;
pub mod trade;

pub use baseline::{BaselineError, BaselineManager, BaselineValue, TimeOfDayCurve};
pub use bucket::{BucketAggregator, BucketOfDay, ClosedBucket, DayBuckets, SessionClock};
pub use config::{ConfigProfile, EngineConfig};
pub use detector::{CooldownPolicy, Detection, Detector, Evaluation};
pub use emitter::{
    run_dispatcher, EmitError, FanoutSink, JsonlSink, OutboundQueue, OverflowPolicy, PostgresSink,
    TriggerSink,
};
pub use engine::{Pipeline, ReplayEngine, SessionReport};
pub use metrics::{EngineStats, TriggerSummary};
pub use scorer::{ScoreWeights, Scorer, SkewScoring};
pub use sharded::{RolloverReport, ShardError, ShardedEngine};
pub use symbol::{OptionContract, ParseError, SymbolCache};
pub use trade::{RejectReason, Trade};
