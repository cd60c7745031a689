//! Database repository functions for baselines and triggers.
//!
//! Queries are checked at runtime so the crates build without a live
//! database. Table layout lives in `migrations/0001_uoa_tables.sql`.

use chrono::NaiveDate;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::{BaselineRow, Trigger};

/// Load archived baseline rows for days in `[since, until)`.
///
/// `until` is exclusive so a caller preparing day D never receives D's own rows.
pub async fn load_baseline_rows(
    pool: &PgPool,
    since: NaiveDate,
    until: NaiveDate,
) -> Result<Vec<BaselineRow>, sqlx::Error> {
    sqlx::query_as::<_, BaselineRow>(
        r#"
        SELECT symbol, bucket_of_day, day, notional
        FROM uoa_baseline
        WHERE day >= $1 AND day < $2
        ORDER BY symbol, bucket_of_day, day
        "#,
    )
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await
}

/// Upsert archived baseline rows. Returns the number of rows written.
pub async fn upsert_baseline_rows(pool: &PgPool, rows: &[BaselineRow]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut written = 0;

    for row in rows {
        let result = sqlx::query(
            r#"
            INSERT INTO uoa_baseline (symbol, bucket_of_day, day, notional)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (symbol, bucket_of_day, day) DO UPDATE SET
                notional = EXCLUDED.notional
            "#,
        )
        .bind(&row.symbol)
        .bind(row.bucket_of_day)
        .bind(row.day)
        .bind(row.notional)
        .execute(&mut *tx)
        .await?;

        written += result.rows_affected();
    }

    tx.commit().await?;
    Ok(written)
}

/// Insert a trigger. Re-inserting the same trigger_id is a no-op.
pub async fn insert_trigger(pool: &PgPool, trigger: &Trigger) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO uoa_triggers (
            trigger_id, symbol, signal_type, trading_day, bucket_start, bucket_of_day,
            detection_time, bucket_notional, call_notional, put_notional, trade_count,
            baseline_notional, ratio, score, score_components
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (trigger_id) DO NOTHING
        "#,
    )
    .bind(trigger.trigger_id)
    .bind(&trigger.symbol)
    .bind(trigger.signal_type.as_str())
    .bind(trigger.trading_day)
    .bind(trigger.bucket_start)
    .bind(&trigger.bucket_of_day)
    .bind(trigger.detection_time)
    .bind(trigger.bucket_notional)
    .bind(trigger.call_notional)
    .bind(trigger.put_notional)
    .bind(trigger.trade_count)
    .bind(trigger.baseline_notional)
    .bind(trigger.ratio)
    .bind(trigger.score)
    .bind(Json(&trigger.score_components))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
