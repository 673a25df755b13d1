//! Engine timestamps
//!
//! Timestamps are unsigned 32-bit modular counters in 24.8 fixed-point
//! audio-frame units. Differences use wrapping signed subtraction: a
//! difference larger than half the modulus denotes the past, which is what
//! lets late messages be detected across the wrap.

use serde::{Deserialize, Serialize};

/// 24.8 fixed-point modular timestamp in audio frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u32);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Construct from whole audio frames
    #[inline]
    pub fn from_frames(frames: u32) -> Self {
        Self(frames << 8)
    }

    /// Whole-frame part
    #[inline]
    pub fn frames(self) -> u32 {
        self.0 >> 8
    }

    /// Sub-frame part (0..256)
    #[inline]
    pub fn frac(self) -> u32 {
        self.0 & 0xff
    }

    /// Wrapped difference `self - other` in 24.8 sub-frames.
    ///
    /// Positive means `self` is later. `other` is assumed to be BEFORE
    /// `self` when the difference is less than half the wrap period.
    #[inline]
    pub fn diff(self, other: Self) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Advance by a signed amount of sub-frames, wrapping
    #[inline]
    pub fn offset(self, dt: i32) -> Self {
        Self(self.0.wrapping_add(dt as u32))
    }

    /// Advance by whole frames, wrapping
    #[inline]
    pub fn add_frames(self, frames: u32) -> Self {
        Self(self.0.wrapping_add(frames << 8))
    }
}

impl std::ops::Add<u32> for Timestamp {
    type Output = Self;

    /// Add sub-frames, wrapping
    fn add(self, rhs: u32) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

/// Convert milliseconds to a timestamp delta (24.8 sub-frames)
#[inline]
pub fn ms_to_ts(ms: f64, samplerate: u32) -> i32 {
    (ms * 0.001 * samplerate as f64 * 256.0).round() as i32
}

/// Convert a timestamp delta (24.8 sub-frames) to milliseconds
#[inline]
pub fn ts_to_ms(ts: i32, samplerate: u32) -> f64 {
    ts as f64 * 1000.0 / (samplerate as f64 * 256.0)
}
