//! vox-audio: driver contracts and built-in drivers
//!
//! Thin contracts between the engine and the platform:
//! - `SystemDriver` supplies realtime-safe allocation;
//! - `AudioDriver` supplies channel buffers, a coarse lock, and either an
//!   externally scheduled callback or a pull-mode `run` entry point;
//! - `MidiDriver` supplies event polling and channel→voice wiring.
//!
//! Platform backends live outside this crate; the built-ins here are the
//! dummy driver (discards output), the pull driver (renders into readable
//! buffers), and the null/buffer MIDI drivers. A configuration that names
//! no driver gets a default instead of failing to open.

mod driver;
mod dummy;
mod midi;
mod pull;

pub use driver::*;
pub use dummy::*;
pub use midi::*;
pub use pull::*;
