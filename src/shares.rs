//! Conversions between the two CPU entitlement scales: legacy hierarchy
//! `cpu.shares` (2..=262144, default 1024) and unified hierarchy
//! `cpu.weight` (1..=10000, default 100).
//!
//! The forward direction is the kernel's own piecewise mapping: clamped
//! at the scale boundaries, quadratic in log2(shares) in between, so
//! that 2 -> 1, 1024 -> 100 and 262144 -> 10000. The inverse is the
//! algebraic inverse of that formula rounded to the nearest share
//! count; it is monotonic and range-bounded but does not round-trip
//! exactly.

pub const MIN_SHARES: u64 = 2;
pub const MAX_SHARES: u64 = 262_144;
pub const MIN_WEIGHT: u64 = 1;
pub const MAX_WEIGHT: u64 = 10_000;

/// Legacy `cpu.shares` value to unified `cpu.weight` value. Zero means
/// "unset" on both scales.
pub fn shares_to_weight(shares: u64) -> u64 {
    if shares == 0 {
        return 0;
    }
    if shares <= MIN_SHARES {
        return MIN_WEIGHT;
    }
    if shares >= MAX_SHARES {
        return MAX_WEIGHT;
    }
    let l = (shares as f64).log2();
    let exponent = (l * l + 125.0 * l) / 612.0 - 7.0 / 34.0;
    10f64.powf(exponent).ceil() as u64
}

/// Unified `cpu.weight` value back to legacy `cpu.shares`. Inverts the
/// forward formula: l = (sqrt(16129 + 2448 * log10(weight)) - 125) / 2,
/// shares = round(2^l).
pub fn weight_to_shares(weight: u64) -> u64 {
    if weight == 0 {
        return 0;
    }
    if weight <= MIN_WEIGHT {
        return MIN_SHARES;
    }
    if weight >= MAX_WEIGHT {
        return MAX_SHARES;
    }
    let l = ((16129.0 + 2448.0 * (weight as f64).log10()).sqrt() - 125.0) / 2.0;
    2f64.powf(l).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_landmarks() {
        assert_eq!(shares_to_weight(0), 0);
        assert_eq!(shares_to_weight(1), 1);
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(1024), 100);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(u64::max_value()), 10_000);
    }

    #[test]
    fn inverse_landmarks() {
        assert_eq!(weight_to_shares(0), 0);
        assert_eq!(weight_to_shares(1), 2);
        assert_eq!(weight_to_shares(100), 1024);
        assert_eq!(weight_to_shares(10_000), 262_144);
        assert_eq!(weight_to_shares(20_000), 262_144);
    }

    #[test]
    fn inverse_is_monotonic_and_bounded_over_full_range() {
        let mut prev = 0;
        for weight in 1..=MAX_WEIGHT {
            let shares = weight_to_shares(weight);
            assert!(
                shares >= prev,
                "weight {} produced {} after {}",
                weight,
                shares,
                prev
            );
            assert!((MIN_SHARES..=MAX_SHARES).contains(&shares));
            prev = shares;
        }
    }

    #[test]
    fn forward_is_monotonic_and_bounded() {
        let mut prev = 0;
        for shares in (MIN_SHARES..=MAX_SHARES).step_by(97) {
            let weight = shares_to_weight(shares);
            assert!(weight >= prev);
            assert!((MIN_WEIGHT..=MAX_WEIGHT).contains(&weight));
            prev = weight;
        }
    }

    #[test]
    fn round_trip_is_close_but_not_contractual() {
        // The inverse is approximate; it only has to land near the
        // original value, inside the legal range. The low end of the
        // shares scale maps to very few distinct weights, so the
        // tolerance is loose there.
        for &shares in &[2u64, 10, 1024, 4096, 100_000, 262_144] {
            let back = weight_to_shares(shares_to_weight(shares));
            let ratio = back as f64 / shares as f64;
            assert!(
                (0.5..=2.0).contains(&ratio),
                "{} round-tripped to {}",
                shares,
                back
            );
        }
    }
}
