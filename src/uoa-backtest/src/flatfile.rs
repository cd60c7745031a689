//! Per-day trade flat files.
//!
//! A data directory holds one file per trading day named `YYYY-MM-DD.csv`
//! (options trades layout) or `YYYY-MM-DD.jsonl` (one `TradeRecord` per line).

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use common::TradeRecord;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FlatFileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error on {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayFile {
    pub day: NaiveDate,
    pub path: PathBuf,
    pub format: FileFormat,
}

/// One CSV row in the options trades layout. `correction` and `exchange`
/// columns are present in the files but unused.
#[derive(Debug, Deserialize)]
struct CsvTradeRow {
    ticker: String,
    /// Comma-separated condition codes, possibly empty
    #[serde(default)]
    conditions: String,
    price: Decimal,
    sip_timestamp: i64,
    size: i64,
}

impl CsvTradeRow {
    fn into_record(self) -> Result<TradeRecord, String> {
        let conditions = self
            .conditions
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| c.parse::<i32>().map_err(|_| format!("bad condition code {:?}", c)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TradeRecord {
            symbol: self.ticker,
            price: self.price,
            size: self.size,
            timestamp: self.sip_timestamp,
            conditions,
        })
    }
}

/// A day's decoded trades, sorted by timestamp.
#[derive(Debug, Default)]
pub struct DayTrades {
    pub records: Vec<TradeRecord>,
    /// Rows that could not be decoded
    pub unreadable: u64,
}

impl DayTrades {
    fn into_sorted(mut self) -> Self {
        // Stable, so equal timestamps keep file order
        self.records.sort_by_key(|r| r.timestamp);
        self
    }
}

/// List day files in `dir`, ascending by day. Other files are ignored.
pub fn discover(dir: &Path) -> Result<Vec<DayFile>, FlatFileError> {
    let io_err = |source| FlatFileError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => FileFormat::Csv,
            Some("jsonl") | Some("json") => FileFormat::Jsonl,
            _ => continue,
        };
        let Ok(day) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
            continue;
        };
        files.push(DayFile { day, path, format });
    }

    files.sort_by(|a, b| a.day.cmp(&b.day).then_with(|| a.path.cmp(&b.path)));
    Ok(files)
}

pub fn read_day(file: &DayFile) -> Result<DayTrades, FlatFileError> {
    let io_err = |source| FlatFileError::Io {
        path: file.path.clone(),
        source,
    };

    let handle = File::open(&file.path).map_err(io_err)?;
    let trades = match file.format {
        FileFormat::Csv => read_csv(handle).map_err(|source| FlatFileError::Csv {
            path: file.path.clone(),
            source,
        })?,
        FileFormat::Jsonl => read_jsonl(BufReader::new(handle)).map_err(io_err)?,
    };

    if trades.unreadable > 0 {
        warn!(
            "[DATA] {}: skipped {} unreadable rows",
            file.path.display(),
            trades.unreadable
        );
    }
    Ok(trades)
}

/// Decode CSV rows. Only a missing or broken header is fatal.
pub fn read_csv<R: Read>(reader: R) -> Result<DayTrades, csv::Error> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    rdr.headers()?;

    let mut trades = DayTrades::default();
    for (line, row) in rdr.deserialize::<CsvTradeRow>().enumerate() {
        match row.map_err(|e| e.to_string()).and_then(CsvTradeRow::into_record) {
            Ok(record) => trades.records.push(record),
            Err(e) => {
                trades.unreadable += 1;
                warn!("[DATA] CSV row {}: {}", line + 2, e);
            }
        }
    }
    Ok(trades.into_sorted())
}

/// Decode one `TradeRecord` per line; blank lines are skipped.
pub fn read_jsonl<R: BufRead>(reader: R) -> std::io::Result<DayTrades> {
    let mut trades = DayTrades::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TradeRecord>(&line) {
            Ok(record) => trades.records.push(record),
            Err(e) => {
                trades.unreadable += 1;
                warn!("[DATA] JSONL line {}: {}", line_no + 1, e);
            }
        }
    }
    Ok(trades.into_sorted())
}
