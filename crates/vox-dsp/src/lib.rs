//! vox-dsp: DSP layer for the VOX audio engine
//!
//! ## Core modules
//! - `ramper` - per-parameter linear interpolator with sub-sample timing
//! - `wave` - mipmapped wave store and the wave preparation pipeline
//! - `unit` - the unit framework: descriptors, instances, io plumbing
//!
//! ## Built-in units
//! - `wtosc` - mipmapped wavetable/noise oscillator
//! - `panmix` - ramped volume/pan mixer (1..2 in, 1..2 out)
//! - `env` - LUT-shaped envelope generator with one control output
//! - `dc` - ramping DC generator
//! - `dcblock` - 12 dB/oct DC blocker
//! - `fbdelay` - cross-feedback stereo delay
//! - `limiter` - peak-following limiter with smart stereo weighting
//! - `waveshaper` - rational-transfer waveshaper
//! - `xsink`/`xinsert` - audio tap units feeding sink clients

mod ramper;
mod unit;
mod wave;

pub mod units;

pub use ramper::*;
pub use unit::*;
pub use wave::*;
