//! Exact-decimal helpers for money and probability paths.
//!
//! Every quantity that touches price, size, fees, gas, P&L, or capital uses
//! [`rust_decimal::Decimal`]. Native floating-point is forbidden on those
//! paths; the only crossing point is [`try_from_f64`], which refuses NaN and
//! infinity at the boundary.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::CoreError;

/// Digits kept after the decimal point on money paths.
pub const MONEY_SCALE: u32 = 20;

/// Rounds a money amount to [`MONEY_SCALE`] digits, half-up.
#[must_use]
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts an untrusted float into an exact decimal.
///
/// # Errors
/// Returns [`CoreError::InvalidDecimal`] for NaN, infinity, or values outside
/// the representable range.
pub fn try_from_f64(value: f64) -> Result<Decimal, CoreError> {
    if !value.is_finite() {
        return Err(CoreError::InvalidDecimal(format!(
            "non-finite value: {value}"
        )));
    }
    Decimal::from_f64(value)
        .ok_or_else(|| CoreError::InvalidDecimal(format!("unrepresentable value: {value}")))
}

/// Converts a percentage (e.g. `2` for 2%) into a fraction (`0.02`).
#[must_use]
pub fn pct(percent: Decimal) -> Decimal {
    percent / Decimal::ONE_HUNDRED
}

/// Returns true if the value is a valid implied probability in `[0, 1]`.
#[must_use]
pub fn is_probability(value: Decimal) -> bool {
    value >= Decimal::ZERO && value <= Decimal::ONE
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_money_half_up() {
        // 21st digit is exactly 5: rounds away from zero.
        let x = dec!(0.000000000000000000015);
        assert_eq!(round_money(x), dec!(0.00000000000000000002));
        let neg = dec!(-0.000000000000000000015);
        assert_eq!(round_money(neg), dec!(-0.00000000000000000002));
    }

    #[test]
    fn test_round_money_passthrough() {
        assert_eq!(round_money(dec!(0.52)), dec!(0.52));
        assert_eq!(round_money(Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_try_from_f64_rejects_nan_and_infinity() {
        assert!(try_from_f64(f64::NAN).is_err());
        assert!(try_from_f64(f64::INFINITY).is_err());
        assert!(try_from_f64(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn test_try_from_f64_accepts_finite() {
        assert_eq!(try_from_f64(0.5).unwrap(), dec!(0.5));
        assert_eq!(try_from_f64(-12.25).unwrap(), dec!(-12.25));
    }

    #[test]
    fn test_pct() {
        assert_eq!(pct(dec!(2)), dec!(0.02));
        assert_eq!(pct(dec!(0.7)), dec!(0.007));
        assert_eq!(pct(Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_is_probability_bounds() {
        assert!(is_probability(Decimal::ZERO));
        assert!(is_probability(Decimal::ONE));
        assert!(is_probability(dec!(0.52)));
        assert!(!is_probability(dec!(1.01)));
        assert!(!is_probability(dec!(-0.01)));
    }
}
