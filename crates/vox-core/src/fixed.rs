//! 16.16 fixed-point values
//!
//! VM registers and wire-format API arguments are signed 16.16 fixed-point
//! integers. Addition and subtraction wrap; multiplication and division go
//! through 64-bit intermediates and report overflow or division by zero to
//! the caller so the VM can fault the offending voice.

use serde::{Deserialize, Serialize};

use crate::error::{VoxError, VoxResult};

/// Signed 16.16 fixed-point value
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Fx(pub i32);

impl Fx {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(1 << 16);

    #[inline]
    pub fn from_int(v: i32) -> Self {
        Self(v.saturating_mul(1 << 16))
    }

    /// Convert from float, saturating at the representable range
    #[inline]
    pub fn from_f32(v: f32) -> Self {
        let scaled = (v as f64) * 65536.0;
        Self(scaled.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
    }

    #[inline]
    pub fn to_f32(self) -> f32 {
        self.0 as f32 / 65536.0
    }

    /// Truncate toward negative infinity to a whole number
    #[inline]
    pub fn floor_int(self) -> i32 {
        self.0 >> 16
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Checked multiply; `Overflow` when the product leaves the range
    pub fn mul(self, rhs: Self) -> VoxResult<Self> {
        let p = (self.0 as i64 * rhs.0 as i64) >> 16;
        if p > i32::MAX as i64 || p < i32::MIN as i64 {
            return Err(VoxError::Overflow);
        }
        Ok(Self(p as i32))
    }

    /// Checked divide; `DivByZero` on a zero divisor
    pub fn div(self, rhs: Self) -> VoxResult<Self> {
        if rhs.0 == 0 {
            return Err(VoxError::DivByZero);
        }
        let q = ((self.0 as i64) << 16) / rhs.0 as i64;
        if q > i32::MAX as i64 || q < i32::MIN as i64 {
            return Err(VoxError::Overflow);
        }
        Ok(Self(q as i32))
    }

    /// Checked remainder; `DivByZero` on a zero divisor
    pub fn rem(self, rhs: Self) -> VoxResult<Self> {
        if rhs.0 == 0 {
            return Err(VoxError::DivByZero);
        }
        Ok(Self(self.0.wrapping_rem(rhs.0)))
    }
}

impl std::ops::Add for Fx {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl std::ops::Sub for Fx {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl std::ops::Neg for Fx {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Self(self.0.wrapping_neg())
    }
}

impl std::fmt::Display for Fx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_f32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_conversion() {
        assert_eq!(Fx::from_f32(1.0), Fx::ONE);
        assert_eq!(Fx::from_f32(-0.5).0, -(1 << 15));
        assert!((Fx::from_f32(0.25).to_f32() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_saturating_from_f32() {
        assert_eq!(Fx::from_f32(1e9), Fx(i32::MAX));
        assert_eq!(Fx::from_f32(-1e9), Fx(i32::MIN));
    }

    #[test]
    fn test_mul_div() {
        let half = Fx::from_f32(0.5);
        let two = Fx::from_int(2);
        assert_eq!(half.mul(two).unwrap(), Fx::ONE);
        assert_eq!(Fx::ONE.div(two).unwrap(), half);
        assert_eq!(Fx::ONE.div(Fx::ZERO), Err(VoxError::DivByZero));
        assert_eq!(Fx::from_int(30000).mul(Fx::from_int(30000)), Err(VoxError::Overflow));
    }

    #[test]
    fn test_floor_int() {
        assert_eq!(Fx::from_f32(2.75).floor_int(), 2);
        assert_eq!(Fx::from_f32(-0.25).floor_int(), -1);
    }
}
