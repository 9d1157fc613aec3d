// SPDX-License-Identifier: MIT OR Apache-2.0
//! Money arithmetic with deterministic 6-decimal rounding.
//!
//! Costs are `tokens × price-per-1k / 1000`. Every amount that is stored,
//! compared, or summed passes through [`round6`] first, so aggregates stay
//! consistent to the 6th decimal regardless of evaluation order.

use serde::{Deserialize, Serialize};

/// Scale factor for 6-decimal fixed-point rounding (micro-dollars).
const MICRO: f64 = 1_000_000.0;

/// Round to 6 decimal digits, ties to even.
///
/// Works over scaled integers so `0.0000005` and `0.0000015` both land on
/// an even micro-dollar.
#[must_use]
pub fn round6(value: f64) -> f64 {
    let scaled = value * MICRO;
    let floor = scaled.floor();
    let frac = scaled - floor;
    let micros = if frac > 0.5 {
        floor + 1.0
    } else if frac < 0.5 {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    };
    micros / MICRO
}

/// Per-1k-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price per 1 000 input tokens.
    pub input_per_1k: f64,
    /// Price per 1 000 output tokens.
    pub output_per_1k: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_1k: 0.015,
            output_per_1k: 0.045,
        }
    }
}

/// The priced components of one executed turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Cost attributed to input tokens.
    pub input_cost: f64,
    /// Cost attributed to output tokens.
    pub output_cost: f64,
    /// Sum of the rounded components.
    pub total_cost: f64,
}

impl Pricing {
    /// Price a turn. Components are rounded individually; the total is the
    /// rounded sum of the rounded components.
    #[must_use]
    pub fn cost_of(&self, input_tokens: u64, output_tokens: u64) -> CostBreakdown {
        let input_cost = round6(input_tokens as f64 * self.input_per_1k / 1000.0);
        let output_cost = round6(output_tokens as f64 * self.output_per_1k / 1000.0);
        CostBreakdown {
            input_cost,
            output_cost,
            total_cost: round6(input_cost + output_cost),
        }
    }
}
