//! Multi-factor conviction score for a triggered bucket.

use common::{Direction, ScoreComponents};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::bucket::Bucket;

/// `threshold -> points` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub threshold: Decimal,
    pub points: i32,
}

impl Tier {
    pub const fn new(threshold: Decimal, points: i32) -> Self {
        Self { threshold, points }
    }
}

/// Points of the highest tier whose threshold `value` reaches.
fn at_or_above(tiers: &[Tier], value: Decimal) -> i32 {
    tiers
        .iter()
        .filter(|t| value >= t.threshold)
        .max_by_key(|t| t.threshold)
        .map_or(0, |t| t.points)
}

/// Points of the tightest tier whose threshold `value` stays under.
fn at_or_below(tiers: &[Tier], value: Decimal) -> i32 {
    tiers
        .iter()
        .filter(|t| value <= t.threshold)
        .min_by_key(|t| t.threshold)
        .map_or(0, |t| t.points)
}

/// How put-dominated buckets are scored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkewScoring {
    /// Either side's dominance earns the skew points
    #[default]
    Directional,
    /// Call dominance earns points, put dominance costs them
    BullishOnly,
}

/// Score tier tables. Missing JSON fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub ratio: Vec<Tier>,
    /// Dominant side's share of notional
    pub skew: Vec<Tier>,
    pub sweep: Vec<Tier>,
    /// unique_strikes / trade_count, lower is better
    pub strike_ratio: Vec<Tier>,
    /// Strike concentration is meaningless on a handful of prints
    pub strike_min_trades: u64,
    pub notional: Vec<Tier>,
    pub skew_scoring: SkewScoring,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            ratio: vec![
                Tier::new(dec!(5), 5),
                Tier::new(dec!(4), 4),
                Tier::new(dec!(3), 3),
            ],
            skew: vec![Tier::new(dec!(0.8), 3), Tier::new(dec!(0.7), 2)],
            sweep: vec![Tier::new(dec!(0.3), 2)],
            strike_ratio: vec![Tier::new(dec!(0.10), 2), Tier::new(dec!(0.25), 1)],
            strike_min_trades: 5,
            notional: vec![Tier::new(dec!(250000), 2), Tier::new(dec!(100000), 1)],
            skew_scoring: SkewScoring::Directional,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scorer {
    weights: ScoreWeights,
}

impl Scorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Score a bucket. `ratio` is `None` for high-absolute-volume triggers,
    /// which skip the ratio tier.
    pub fn score(&self, bucket: &Bucket, ratio: Option<Decimal>) -> ScoreComponents {
        let w = &self.weights;
        let notional = bucket.notional();

        let ratio_points = ratio.map_or(0, |r| at_or_above(&w.ratio, r));

        let call_pct = if notional > Decimal::ZERO {
            bucket.call_notional / notional
        } else {
            dec!(0.5)
        };
        let put_pct = Decimal::ONE - call_pct;
        let call_points = at_or_above(&w.skew, call_pct);
        let put_points = at_or_above(&w.skew, put_pct);
        let (skew_points, direction) = if call_points > 0 {
            (call_points, Direction::Bullish)
        } else if put_points > 0 {
            match w.skew_scoring {
                SkewScoring::Directional => (put_points, Direction::Bearish),
                SkewScoring::BullishOnly => (-put_points, Direction::Bearish),
            }
        } else {
            (0, Direction::Neutral)
        };

        let (sweep_pct, strike_ratio) = if bucket.trade_count > 0 {
            let trades = Decimal::from(bucket.trade_count);
            (
                Decimal::from(bucket.sweep_trade_count) / trades,
                Decimal::from(bucket.unique_strikes.len()) / trades,
            )
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        };
        let sweep_points = at_or_above(&w.sweep, sweep_pct);
        let strike_points = if bucket.trade_count >= w.strike_min_trades {
            at_or_below(&w.strike_ratio, strike_ratio)
        } else {
            0
        };

        let notional_points = at_or_above(&w.notional, notional);

        ScoreComponents {
            ratio_points,
            skew_points,
            sweep_points,
            strike_points,
            notional_points,
            call_pct: call_pct.round_dp(4),
            sweep_pct: sweep_pct.round_dp(4),
            strike_ratio: strike_ratio.round_dp(4),
            direction,
        }
    }
}
