// src/money.rs
//! Exact currency handling. Amounts are `Decimal` end to end; rounding only
//! happens in [`usd`], which is for display.

use crate::error::{AppError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Parses a user-supplied positive amount such as `"12.50"`.
pub fn parse_amount(input: &str, label: &str) -> Result<Decimal> {
    let raw = input.trim();
    let invalid = || AppError::Validation(format!("Invalid {} Amount", label));

    if raw.is_empty()
        || raw.chars().filter(|c| *c == '.').count() > 1
        || !raw.chars().all(|c| c.is_ascii_digit() || c == '.')
        || !raw.chars().any(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }

    let normalized = format!("0{}", raw.trim_end_matches('.'));
    let amount = Decimal::from_str(&normalized).map_err(|_| invalid())?;
    if amount <= Decimal::ZERO || !is_exact(&normalized, amount) {
        return Err(invalid());
    }
    Ok(amount)
}

/// `Decimal::from_str` rounds past 28 significant digits; the parsed value
/// must carry every digit of the text.
fn is_exact(text: &str, amount: Decimal) -> bool {
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
    let digits = format!("{}{}", whole, fraction);
    let digits = match digits.trim_start_matches('0') {
        "" => "0",
        significant => significant,
    };
    amount.scale() as usize == fraction.len() && amount.mantissa().to_string() == digits
}

/// Formats an amount as US dollars, e.g. `$1,234.56`.
pub fn usd(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() {
        "-"
    } else {
        ""
    };
    let text = format!("{:.2}", rounded.abs());
    let (whole, cents) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    format!("{}${}.{}", sign, grouped, cents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_plain_amounts() {
        assert_eq!(parse_amount("12.50", "Deposit").unwrap(), dec!(12.50));
        assert_eq!(parse_amount(" 7 ", "Deposit").unwrap(), dec!(7));
        assert_eq!(parse_amount(".01", "Deposit").unwrap(), dec!(0.01));
    }

    #[test]
    fn rejects_non_numeric_and_non_positive() {
        for bad in ["", "abc", "-5", "0", "0.00", "1e3", "inf", "NaN", "1.2.3", ".", "+4"] {
            let err = parse_amount(bad, "Withdrawal").unwrap_err();
            assert!(
                matches!(err, AppError::Validation(ref m) if m == "Invalid Withdrawal Amount"),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn keeps_full_precision() {
        assert_eq!(parse_amount("0.105", "Deposit").unwrap(), dec!(0.105));
        assert_eq!(parse_amount("007.50", "Deposit").unwrap(), dec!(7.50));
        assert_eq!(
            parse_amount("79228162514264337593543950335", "Deposit").unwrap(),
            Decimal::MAX
        );
    }

    #[test]
    fn rejects_amounts_that_would_round() {
        for input in [
            "1.00000000000000000000000000001",
            "0.00000000000000000000000000001",
            "79228162514264337593543950336",
        ] {
            assert!(parse_amount(input, "Deposit").is_err(), "{}", input);
        }
    }

    #[test]
    fn formats_usd() {
        assert_eq!(usd(dec!(0)), "$0.00");
        assert_eq!(usd(dec!(5.5)), "$5.50");
        assert_eq!(usd(dec!(999.999)), "$1,000.00");
        assert_eq!(usd(dec!(1234567.891)), "$1,234,567.89");
        assert_eq!(usd(dec!(-1.505)), "-$1.51");
        assert_eq!(usd(dec!(-0.001)), "$0.00");
    }
}
