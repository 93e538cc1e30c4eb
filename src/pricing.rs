//! Pricing engine
//!
//! Pure functions over cell prices. The store is the authority on the price a
//! conquest actually pays; everything here is an estimate for quoting and display.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Floor price every cell starts at (in settlement token units)
pub const FLOOR_PRICE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// 20% escalation per committed conquest
pub const PRICE_MULTIPLIER: Decimal = Decimal::from_parts(12, 0, 0, false, 1);

/// Previous owner's principal plus 10%
pub const SELLER_PAYOUT_RATE: Decimal = Decimal::from_parts(11, 0, 0, false, 1);

/// Platform share of a conquest
pub const PLATFORM_TAX_RATE: Decimal = Decimal::from_parts(1, 0, 0, false, 1);

/// Settlement token decimals (USDC-style)
pub const SETTLEMENT_DECIMALS: u32 = 6;

/// Decimal places kept on stored prices so repeated escalation can't grow the scale unbounded
pub const PRICE_SCALE: u32 = 9;

/// Price of a cell after one more conquest
pub fn next_price(current: Decimal) -> Decimal {
    (current * PRICE_MULTIPLIER).round_dp(PRICE_SCALE)
}

/// Informational seller share of a conquest at `current`
pub fn seller_payout(current: Decimal) -> Decimal {
    (current * SELLER_PAYOUT_RATE).round_dp(PRICE_SCALE)
}

/// Informational platform share of a conquest at `current`
pub fn platform_tax(current: Decimal) -> Decimal {
    (current * PLATFORM_TAX_RATE).round_dp(PRICE_SCALE)
}

/// Price after `conquests` successive conquests starting from `initial`
pub fn price_after_conquests(initial: Decimal, conquests: u32) -> Decimal {
    (0..conquests).fold(initial, |price, _| next_price(price))
}

/// Total paid to conquer the same cell `conquests` times in a row
pub fn total_cost(initial: Decimal, conquests: u32) -> Decimal {
    let mut total = Decimal::ZERO;
    let mut price = initial;
    for _ in 0..conquests {
        total += price;
        price = next_price(price);
    }
    total
}

/// Convert a token amount to integer minor units, truncating sub-unit dust
pub fn to_minor_units(amount: Decimal) -> Option<u64> {
    let scale = Decimal::from(10u64.pow(SETTLEMENT_DECIMALS));
    (amount * scale).trunc().to_u64()
}

/// Display formatting with magnitude-dependent precision and K/M suffixes
pub fn format_amount(value: Decimal) -> String {
    let thousand = Decimal::from(1_000);
    let million = Decimal::from(1_000_000);

    if value < Decimal::new(1, 2) {
        format!("{:.4}", value)
    } else if value < Decimal::ONE {
        format!("{:.3}", value)
    } else if value < thousand {
        format!("{:.2}", value)
    } else if value < million {
        format!("{:.2}K", value / thousand)
    } else {
        format!("{:.2}M", value / million)
    }
}
