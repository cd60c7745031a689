//! Normalization of raw trade records into validated trades.

use chrono::NaiveDate;
use common::{OptionRight, TradeRecord};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::symbol::{ParseError, SymbolCache};

/// Why a raw trade record was dropped before aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("unparseable symbol: {0}")]
    Symbol(#[from] ParseError),

    #[error("non-positive price {0}")]
    NonPositivePrice(Decimal),

    #[error("non-positive size {0}")]
    NonPositiveSize(i64),

    #[error("notional of {price} x {size} is out of range")]
    NotionalOverflow { price: Decimal, size: i64 },
}

/// A validated option trade print.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub underlying: String,
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub price: Decimal,
    pub size: i64,
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
    pub conditions: Vec<i32>,
}

impl Trade {
    /// Validate a raw record. Price, size and notional are checked before
    /// the symbol so obviously bad prints never touch the symbol cache.
    pub fn from_record(
        record: &TradeRecord,
        symbols: &mut SymbolCache,
        contract_multiplier: Decimal,
    ) -> Result<Self, RejectReason> {
        if record.price <= Decimal::ZERO {
            return Err(RejectReason::NonPositivePrice(record.price));
        }
        if record.size <= 0 {
            return Err(RejectReason::NonPositiveSize(record.size));
        }
        if notional_of(record.price, record.size, contract_multiplier).is_none() {
            return Err(RejectReason::NotionalOverflow {
                price: record.price,
                size: record.size,
            });
        }

        let contract = symbols.parse(&record.symbol)?;

        Ok(Self {
            underlying: contract.underlying,
            right: contract.right,
            strike: contract.strike,
            expiry: contract.expiry,
            price: record.price,
            size: record.size,
            timestamp: record.timestamp,
            conditions: record.conditions.clone(),
        })
    }

    /// Dollar value of the print: price x size x contract multiplier.
    /// `None` when it does not fit in a `Decimal`.
    pub fn notional(&self, contract_multiplier: Decimal) -> Option<Decimal> {
        notional_of(self.price, self.size, contract_multiplier)
    }

    pub fn has_condition(&self, code: i32) -> bool {
        self.conditions.contains(&code)
    }
}

fn notional_of(price: Decimal, size: i64, contract_multiplier: Decimal) -> Option<Decimal> {
    price
        .checked_mul(Decimal::from(size))?
        .checked_mul(contract_multiplier)
}
