//! Parsing monetary inputs into integer cents.
//!
//! API callers send dollar amounts and vCPU hours as JSON numbers or
//! strings. Both are parsed through [`rust_decimal::Decimal`] so no float
//! ever touches money, and rounding to cents is half-up.

use std::str::FromStr;

use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde_json::Value;

use crate::LedgerError;

/// Parse a dollar amount into non-negative integer cents, half-up.
pub fn parse_cents(value: Option<&Value>) -> Result<i64, LedgerError> {
    let decimal = parse_decimal(value, LedgerError::MissingAmount, LedgerError::InvalidAmount)?;
    if decimal.is_sign_negative() {
        return Err(LedgerError::InvalidAmount);
    }
    (decimal * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or(LedgerError::InvalidAmount)
}

/// Parse a strictly-positive vCPU-hours figure.
pub fn parse_vcpu_hours(value: Option<&Value>) -> Result<Decimal, LedgerError> {
    let decimal = parse_decimal(
        value,
        LedgerError::MissingVcpuHours,
        LedgerError::InvalidVcpuHours,
    )?;
    if decimal <= Decimal::ZERO {
        return Err(LedgerError::InvalidVcpuHours);
    }
    Ok(decimal)
}

/// Round `price_cents * vcpu_hours` half-up to whole cents.
pub fn usage_amount_cents(
    price_cents: i64,
    vcpu_hours: Decimal,
) -> Result<i64, LedgerError> {
    let amount = Decimal::from(price_cents) * vcpu_hours;
    let cents = amount
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or(LedgerError::InvalidAmount)?;
    if cents <= 0 {
        return Err(LedgerError::InvalidAmount);
    }
    Ok(cents)
}

fn parse_decimal(
    value: Option<&Value>,
    missing: LedgerError,
    invalid: LedgerError,
) -> Result<Decimal, LedgerError> {
    let value = value.ok_or_else(|| missing.clone())?;
    let text = match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Null => return Err(missing),
        _ => return Err(invalid),
    };
    Decimal::from_str(text.trim()).map_err(|_| invalid)
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn cents_from_strings_and_numbers() {
        assert_eq!(parse_cents(Some(&json!("10.00"))).unwrap(), 1000);
        assert_eq!(parse_cents(Some(&json!(10))).unwrap(), 1000);
        assert_eq!(parse_cents(Some(&json!(0.005))).unwrap(), 1);
        assert_eq!(parse_cents(Some(&json!("0.004"))).unwrap(), 0);
    }

    #[test]
    fn cents_rejections() {
        assert_eq!(parse_cents(None), Err(LedgerError::MissingAmount));
        assert_eq!(
            parse_cents(Some(&json!(null))),
            Err(LedgerError::MissingAmount)
        );
        assert_eq!(
            parse_cents(Some(&json!("-1"))),
            Err(LedgerError::InvalidAmount)
        );
        assert_eq!(
            parse_cents(Some(&json!("ten dollars"))),
            Err(LedgerError::InvalidAmount)
        );
    }

    #[test]
    fn vcpu_hours_must_be_positive() {
        assert_eq!(
            parse_vcpu_hours(Some(&json!(0))),
            Err(LedgerError::InvalidVcpuHours)
        );
        assert_eq!(
            parse_vcpu_hours(Some(&json!(-2))),
            Err(LedgerError::InvalidVcpuHours)
        );
        assert_eq!(
            parse_vcpu_hours(Some(&json!("nope"))),
            Err(LedgerError::InvalidVcpuHours)
        );
        assert_eq!(parse_vcpu_hours(None), Err(LedgerError::MissingVcpuHours));
        assert_eq!(
            parse_vcpu_hours(Some(&json!("2"))).unwrap(),
            Decimal::from(2)
        );
    }

    #[test]
    fn usage_rounding_is_half_up() {
        // 50c/h * 2h = $1.00
        assert_eq!(
            usage_amount_cents(50, Decimal::from(2)).unwrap(),
            100
        );
        // 33c/h * 0.5h = 16.5c -> 17c
        assert_eq!(
            usage_amount_cents(33, Decimal::from_str("0.5").unwrap()).unwrap(),
            17
        );
        assert_eq!(
            usage_amount_cents(0, Decimal::from(5)),
            Err(LedgerError::InvalidAmount)
        );
    }
}
