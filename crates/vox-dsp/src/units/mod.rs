//! Built-in unit classes

pub mod dc;
pub mod dcblock;
pub mod env;
pub mod fbdelay;
pub mod limiter;
pub mod panmix;
pub mod waveshaper;
pub mod wtosc;
pub mod xsink;
