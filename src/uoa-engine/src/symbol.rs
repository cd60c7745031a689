//! OCC option symbol parsing.
//!
//! Layout after the optional `O:` prefix:
//! `<ROOT letters><YYMMDD><C|P><strike x 1000, 8 digits>`,
//! e.g. `O:AAPL250117C00150000` = AAPL 2025-01-17 150 call.

use std::collections::HashMap;

use chrono::NaiveDate;
use common::OptionRight;
use rust_decimal::Decimal;
use thiserror::Error;

/// Prefix used by the options feed and flat files.
pub const OCC_PREFIX: &str = "O:";

const EXPIRY_LEN: usize = 6;
const STRIKE_LEN: usize = 8;
/// Expiry + right + strike
const SUFFIX_LEN: usize = EXPIRY_LEN + 1 + STRIKE_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty option symbol")]
    Empty,

    #[error("no underlying root before the expiry in {0:?}")]
    MissingUnderlying(String),

    #[error("underlying root {0:?} is not letters only")]
    InvalidUnderlying(String),

    #[error("symbol {symbol:?} has {len} characters after the root, expected 15")]
    InvalidLength { symbol: String, len: usize },

    #[error("invalid expiry {0:?}")]
    InvalidExpiry(String),

    #[error("invalid right code {0:?}")]
    InvalidRight(char),

    #[error("invalid strike {0:?}")]
    InvalidStrike(String),
}

/// A decoded option contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OptionContract {
    pub underlying: String,
    pub expiry: NaiveDate,
    pub right: OptionRight,
    pub strike: Decimal,
}

/// Parse an OCC-style option identifier.
pub fn parse(identifier: &str) -> Result<OptionContract, ParseError> {
    let body = identifier.strip_prefix(OCC_PREFIX).unwrap_or(identifier);
    if body.is_empty() {
        return Err(ParseError::Empty);
    }

    let root_len = body
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| ParseError::InvalidLength {
            symbol: identifier.to_string(),
            len: 0,
        })?;

    if root_len == 0 {
        return Err(ParseError::MissingUnderlying(identifier.to_string()));
    }

    let root = &body[..root_len];
    if !root.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ParseError::InvalidUnderlying(root.to_string()));
    }

    // The root is ASCII and ends on a digit, so this slice is on a char boundary.
    let rest = &body[root_len..];
    if !rest.is_ascii() || rest.len() != SUFFIX_LEN {
        return Err(ParseError::InvalidLength {
            symbol: identifier.to_string(),
            len: rest.chars().count(),
        });
    }

    let expiry_str = &rest[..EXPIRY_LEN];
    if !expiry_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidExpiry(expiry_str.to_string()));
    }
    let expiry = NaiveDate::parse_from_str(expiry_str, "%y%m%d")
        .map_err(|_| ParseError::InvalidExpiry(expiry_str.to_string()))?;

    let right = match rest.as_bytes()[EXPIRY_LEN] {
        b'C' => OptionRight::Call,
        b'P' => OptionRight::Put,
        other => return Err(ParseError::InvalidRight(other as char)),
    };

    let strike_str = &rest[EXPIRY_LEN + 1..];
    if !strike_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidStrike(strike_str.to_string()));
    }
    let strike_thousandths: i64 = strike_str
        .parse()
        .map_err(|_| ParseError::InvalidStrike(strike_str.to_string()))?;

    Ok(OptionContract {
        underlying: root.to_ascii_uppercase(),
        expiry,
        right,
        strike: Decimal::new(strike_thousandths, 3).normalize(),
    })
}

/// Underlying root of an identifier without validating the rest, for routing.
/// Returns the whole prefix-stripped body when it has no digit.
pub fn root_of(identifier: &str) -> &str {
    let body = identifier.strip_prefix(OCC_PREFIX).unwrap_or(identifier);
    let end = body.find(|c: char| c.is_ascii_digit()).unwrap_or(body.len());
    &body[..end]
}

/// Memoizes parse results (successes and failures) by raw symbol string.
///
/// Cleared wholesale once `capacity` distinct symbols have been seen.
pub struct SymbolCache {
    entries: HashMap<String, Result<OptionContract, ParseError>>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl SymbolCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
        }
    }

    pub fn parse(&mut self, identifier: &str) -> Result<OptionContract, ParseError> {
        if let Some(cached) = self.entries.get(identifier) {
            self.hits += 1;
            return cached.clone();
        }

        self.misses += 1;
        if self.entries.len() >= self.capacity {
            self.entries.clear();
        }

        let parsed = parse(identifier);
        self.entries.insert(identifier.to_string(), parsed.clone());
        parsed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl Default for SymbolCache {
    fn default() -> Self {
        Self::new(200_000)
    }
}
