// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integer money helpers. All amounts are minor units (cents).

use crate::error::{Error, Result};

/// Scale of every `*_permille` discount value: 10000 means 100 % off.
pub const PERMILLE_SCALE: i64 = 10_000;

/// Round to the nearest integer, ties to even.
pub fn round_half_even(value: f64) -> i64 {
    value.round_ties_even() as i64
}

/// `num / den` rounded half away from zero. `den` must be non-zero.
pub fn div_round_half_away(num: i128, den: i128) -> i64 {
    if den == 0 {
        return 0;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let q = num / den;
    let r = num % den;
    let rounded = if r.abs() * 2 >= den {
        if num < 0 { q - 1 } else { q + 1 }
    } else {
        q
    };
    rounded as i64
}

/// `amount * remain / total`, half away from zero. A non-positive total yields 0.
pub fn prorate(amount: i64, remain: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    div_round_half_away(amount as i128 * remain as i128, total as i128)
}

/// Apply a permille discount (clamped to `0..=10000`).
pub fn apply_permille_discount(value: i64, permille: i64) -> i64 {
    let p = permille.clamp(0, PERMILLE_SCALE);
    div_round_half_away(
        value as i128 * (PERMILLE_SCALE - p) as i128,
        PERMILLE_SCALE as i128,
    )
}

/// Format cents as a decimal string, e.g. `-1234` as `-12.34`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Format a fractional major-unit amount with banker's rounding to cents.
pub fn format_major(amount: f64) -> String {
    format_cents(round_half_even(amount * 100.0))
}

/// Parse `"12"`, `"12.3"`, `"-0.05"` into cents. More than two decimals is rejected.
pub fn parse_amount_to_cents(raw: &str) -> Result<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::invalid("amount is empty"));
    }
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    let valid_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    if whole.is_empty() && frac.is_empty() || !valid_digits(whole) || !valid_digits(frac) {
        return Err(Error::invalid(format!("invalid amount `{raw}`")));
    }
    if frac.len() > 2 {
        return Err(Error::invalid(format!(
            "amount `{raw}` has more than two decimals"
        )));
    }
    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| Error::invalid(format!("amount `{raw}` out of range")))?
    };
    let mut frac_cents: i64 = if frac.is_empty() {
        0
    } else {
        frac.parse()
            .map_err(|_| Error::invalid(format!("invalid amount `{raw}`")))?
    };
    if frac.len() == 1 {
        frac_cents *= 10;
    }
    let cents = whole
        .checked_mul(100)
        .and_then(|v| v.checked_add(frac_cents))
        .ok_or_else(|| Error::invalid(format!("amount `{raw}` out of range")))?;
    Ok(if neg { -cents } else { cents })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_half_even(2.5), 2);
        assert_eq!(round_half_even(3.5), 4);
        assert_eq!(round_half_even(-2.5), -2);
        assert_eq!(round_half_even(2.4999), 2);
    }

    #[test]
    fn test_prorate_is_symmetric_on_negatives() {
        assert_eq!(prorate(1000, 1, 3), 333);
        assert_eq!(prorate(-1000, 1, 3), -333);
        assert_eq!(prorate(1, 1, 2), 1);
        assert_eq!(prorate(-1, 1, 2), -1);
        assert_eq!(prorate(500, 10, 0), 0);
    }

    #[test]
    fn test_apply_permille_discount() {
        assert_eq!(apply_permille_discount(1000, 0), 1000);
        assert_eq!(apply_permille_discount(1000, 10_000), 0);
        assert_eq!(apply_permille_discount(1000, 1500), 850);
        assert_eq!(apply_permille_discount(999, 5000), 500);
        assert_eq!(apply_permille_discount(1000, 20_000), 0);
    }

    #[test]
    fn test_format_and_parse() {
        assert_eq!(format_cents(1234), "12.34");
        assert_eq!(format_cents(-5), "-0.05");
        assert_eq!(format_major(0.125), "0.12");
        assert_eq!(parse_amount_to_cents("12.3").unwrap(), 1230);
        assert_eq!(parse_amount_to_cents("-0.05").unwrap(), -5);
        assert_eq!(parse_amount_to_cents("7").unwrap(), 700);
        assert!(parse_amount_to_cents("1.234").is_err());
        assert!(parse_amount_to_cents("abc").is_err());
        assert!(parse_amount_to_cents(".").is_err());
    }
}
