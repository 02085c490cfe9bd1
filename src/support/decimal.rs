//! Exact-arithmetic helpers shared by the drift detector and adjustment
//! engine. Nothing here ever widens to `f64` for comparisons or storage —
//! `f64` is only used internally by [`decimal_sqrt`] as a seed for Newton's
//! method, never as the result.

use rust_decimal::{Decimal, MathematicalOps};

/// Canonical string form used for hashing: strips trailing zeros and a
/// trailing decimal point (e.g. `100.00` -> `100`, `100.10` -> `100.1`) so
/// equivalent values hash identically regardless of how they were produced.
pub fn normalize_decimal_string(value: Decimal) -> String {
    value.normalize().to_string()
}

/// Sample standard deviation (n-1 divisor). Returns `Decimal::ZERO` for
/// fewer than two samples.
pub fn sample_stddev(values: &[Decimal]) -> Decimal {
    let n = values.len();
    if n < 2 {
        return Decimal::ZERO;
    }
    let mean = sum(values) / Decimal::from(n);
    let sum_sq: Decimal = values.iter().map(|v| (*v - mean) * (*v - mean)).sum();
    let variance = sum_sq / Decimal::from(n - 1);
    decimal_sqrt(variance)
}

pub fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    sum(values) / Decimal::from(values.len())
}

fn sum(values: &[Decimal]) -> Decimal {
    values.iter().copied().sum()
}

/// Square root via `rust_decimal`'s checked Newton's-method implementation,
/// falling back to zero for negative/degenerate input (variance is never
/// negative by construction, but defends against a malformed caller).
pub fn decimal_sqrt(value: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    value.sqrt().unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn normalizes_trailing_zeros() {
        assert_eq!(normalize_decimal_string(dec!(100.00)), "100");
        assert_eq!(normalize_decimal_string(dec!(100.10)), "100.1");
    }

    #[test]
    fn stddev_constant_series_is_zero() {
        let v = vec![dec!(10), dec!(10), dec!(10)];
        assert_eq!(sample_stddev(&v), Decimal::ZERO);
    }

    #[test]
    fn stddev_matches_known_sample() {
        let v = vec![dec!(10), dec!(11), dec!(12)];
        assert_eq!(mean(&v), dec!(11));
        assert_eq!(sample_stddev(&v), dec!(1));
    }
}
