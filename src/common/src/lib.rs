//! Common library for the UOA services.
//!
//! Provides shared functionality:
//! - Configuration loading from .env
//! - Database connection pooling
//! - Baseline and trigger repository functions
//! - Shared data models

pub mod config;
pub mod db;
pub mod models;
pub mod repository;

pub use config::{Config, ConfigError};
pub use db::{Database, DbError};
pub use models::{
    BaselineRow, Direction, OptionRight, ScoreComponents, SignalType, TradeRecord, Trigger,
};
pub use repository::{insert_trigger, load_baseline_rows, upsert_baseline_rows};
