//! Fixed-point U256 arithmetic for health evaluation.
//!
//! Everything that feeds an eligibility decision stays in integers scaled to
//! WAD (1e18). Products are taken in 512 bits so `a * b / d` never overflows
//! in the intermediate step. Floats appear only in [`wad_to_f64`], for
//! reporting.

use alloy::primitives::{U256, U512};

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// WAD decimals
pub const WAD_DECIMALS: u8 = 18;

/// Basis points denominator (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000u64, 0, 0, 0]);

/// Largest power of ten that fits in a U256.
const MAX_POW10: u32 = 77;

/// Pre-computed powers of 10 for fast decimal conversion
const POW10: [u128; 39] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
    100_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000_000,
];

/// Power of 10, or `None` above 10^77.
#[inline(always)]
pub fn pow10(exp: u32) -> Option<U256> {
    if exp < POW10.len() as u32 {
        Some(U256::from(POW10[exp as usize]))
    } else if exp <= MAX_POW10 {
        U256::from(10u64).checked_pow(U256::from(exp))
    } else {
        None
    }
}

fn widen(x: U256) -> U512 {
    let l = x.as_limbs();
    U512::from_limbs([l[0], l[1], l[2], l[3], 0, 0, 0, 0])
}

fn narrow(x: U512) -> Option<U256> {
    let l = x.as_limbs();
    if l[4..].iter().any(|limb| *limb != 0) {
        return None;
    }
    Some(U256::from_limbs([l[0], l[1], l[2], l[3]]))
}

/// `a * b / d` with a 512-bit intermediate, rounding down.
///
/// Returns `None` when `d` is zero or the quotient does not fit in 256 bits.
#[inline]
pub fn mul_div(a: U256, b: U256, d: U256) -> Option<U256> {
    if d.is_zero() {
        return None;
    }
    narrow(widen(a) * widen(b) / widen(d))
}

/// Scale a raw amount with `decimals` to 18 decimals.
///
/// Saturates at `U256::MAX` when upscaling overflows; amounts with more than
/// 95 decimals round to zero.
pub fn normalize_to_wad(raw: U256, decimals: u8) -> U256 {
    let decimals = decimals as u32;
    let wad = WAD_DECIMALS as u32;
    if decimals <= wad {
        pow10(wad - decimals).map_or(U256::MAX, |f| raw.saturating_mul(f))
    } else {
        pow10(decimals - wad).map_or(U256::ZERO, |f| raw / f)
    }
}

/// Value of a token amount in WAD.
///
/// `amount * price * 1e18 / 10^(decimals + price_decimals)`, computed in 512
/// bits and saturating at `U256::MAX`.
pub fn value_wad(amount: U256, price: U256, decimals: u8, price_decimals: u8) -> U256 {
    if amount.is_zero() || price.is_zero() {
        return U256::ZERO;
    }
    let scale = decimals as u32 + price_decimals as u32;
    let wad = WAD_DECIMALS as u32;
    if scale >= wad {
        match pow10(scale - wad) {
            Some(divisor) => mul_div(amount, price, divisor).unwrap_or(U256::MAX),
            None => U256::ZERO,
        }
    } else {
        let factor = pow10(wad - scale).unwrap_or(U256::MAX);
        mul_div(amount, price, U256::from(1u8))
            .and_then(|product| product.checked_mul(factor))
            .unwrap_or(U256::MAX)
    }
}

/// `value * bps / 10000`, rounding down.
#[inline(always)]
pub fn apply_bps(value: U256, bps: u16) -> U256 {
    mul_div(value, U256::from(bps), BPS_DENOMINATOR).unwrap_or(U256::MAX)
}

/// `value * (10000 + bps) / 10000`, rounding down.
#[inline(always)]
pub fn apply_bps_up(value: U256, bps: u16) -> U256 {
    let factor = U256::from(10_000u32 + bps as u32);
    mul_div(value, factor, BPS_DENOMINATOR).unwrap_or(U256::MAX)
}

/// Convert WAD (18 decimals) to f64.
/// Use only for display/logging, not for computation.
#[inline(always)]
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let whole = wad / WAD;
        let frac: u128 = (wad % WAD).to();
        let whole_f = whole
            .as_limbs()
            .iter()
            .rev()
            .fold(0.0f64, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64);
        whole_f + frac as f64 / 1e18
    }
}

/// Safe minimum of two U256 values
#[inline(always)]
pub fn min(a: U256, b: U256) -> U256 {
    if a < b {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_div_wide_intermediate() {
        // (2^255 * 4) / 8 overflows a naive 256-bit product.
        let big = U256::from(1u8) << 255;
        assert_eq!(mul_div(big, U256::from(4u8), U256::from(8u8)), Some(big / U256::from(2u8)));
        assert_eq!(mul_div(big, U256::from(4u8), U256::from(1u8)), None);
        assert_eq!(mul_div(U256::from(1u8), U256::from(1u8), U256::ZERO), None);
    }

    #[test]
    fn test_normalize_to_wad() {
        // 1000 USDC
        assert_eq!(normalize_to_wad(U256::from(1_000_000_000u64), 6), U256::from(1000u64) * WAD);
        assert_eq!(normalize_to_wad(WAD, 18), WAD);
        // 1 RAD
        let rad = pow10(45).unwrap();
        assert_eq!(normalize_to_wad(rad, 45), WAD);
        assert_eq!(normalize_to_wad(U256::from(5u8), 200), U256::ZERO);
    }

    #[test]
    fn test_value_wad() {
        // 1000 USDC (6 decimals) at $1.00 (8 decimals)
        let v = value_wad(U256::from(1_000_000_000u64), U256::from(100_000_000u64), 6, 8);
        assert_eq!(v, U256::from(1000u64) * WAD);

        // 1.5 ETH at $2000 (8 decimals)
        let v = value_wad(
            U256::from(1_500_000_000_000_000_000u128),
            U256::from(200_000_000_000u64),
            18,
            8,
        );
        assert_eq!(v, U256::from(3000u64) * WAD);

        // Comptroller price scaled by 1e(36 - 8) for an 8-decimal token
        let price = U256::from(60_000u64) * pow10(28).unwrap();
        let v = value_wad(U256::from(100_000_000u64), price, 8, 28);
        assert_eq!(v, U256::from(60_000u64) * WAD);
    }

    #[test]
    fn test_apply_bps() {
        let value = U256::from(1000u64);
        assert_eq!(apply_bps(value, 8000), U256::from(800u64));
        assert_eq!(apply_bps(value, 0), U256::ZERO);
        assert_eq!(apply_bps_up(value, 500), U256::from(1050u64));
    }

    #[test]
    fn test_wad_to_f64() {
        assert!((wad_to_f64(U256::from(1000u64) * WAD) - 1000.0).abs() < 0.001);
        let huge = U256::from(u128::MAX) * U256::from(4u8);
        assert!(wad_to_f64(huge) > 1e20);
    }

    #[test]
    fn test_pow10_lookup() {
        assert_eq!(pow10(0), Some(U256::from(1u64)));
        assert_eq!(pow10(6), Some(U256::from(1_000_000u64)));
        assert_eq!(pow10(45), Some(U256::from(10u64).pow(U256::from(45u64))));
        assert_eq!(pow10(78), None);
    }
}
