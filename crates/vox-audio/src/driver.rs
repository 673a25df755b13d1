//! Driver contracts and the driver registry

use parking_lot::MutexGuard;

use vox_core::{RtAlloc, Sample, VoxError, VoxResult};

// ═══════════════════════════════════════════════════════════════════════════
// SYSTEM DRIVER
// ═══════════════════════════════════════════════════════════════════════════

/// Memory management contract for realtime-visible storage.
///
/// The allocator is used during engine open and voice/unit
/// initialization. It may use the host allocator as long as it does not
/// block unboundedly; there are no concurrent calls within one engine
/// state.
pub trait SystemDriver: RtAlloc {
    fn name(&self) -> &'static str;
}

/// Default system driver backed by the host allocator
pub struct HostSystemDriver;

impl RtAlloc for HostSystemDriver {
    fn alloc_samples(&self, n: usize) -> Box<[Sample]> {
        vec![0.0; n].into_boxed_slice()
    }
}

impl SystemDriver for HostSystemDriver {
    fn name(&self) -> &'static str {
        "host"
    }
}

/// Adapter exposing a shared system driver as a plain allocator
#[derive(Clone)]
pub struct SysAlloc(pub std::sync::Arc<dyn SystemDriver>);

impl RtAlloc for SysAlloc {
    fn alloc_samples(&self, n: usize) -> Box<[Sample]> {
        self.0.alloc_samples(n)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// AUDIO DRIVER
// ═══════════════════════════════════════════════════════════════════════════

/// The engine's per-buffer render callback installed into a driver
pub type ProcessFn = Box<dyn FnMut(&mut [Box<[Sample]>], usize) + Send>;

/// Audio I/O contract
///
/// A driver owns one buffer per channel. Pull-mode drivers render on
/// [`run`](AudioDriver::run); callback-driven backends would invoke the
/// installed process function from their own scheduling instead.
///
/// [`lock`](AudioDriver::lock) provides the coarse critical section used
/// by API calls that must observe engine state consistently. While the
/// lock is held a driver may skip processing rather than block the
/// realtime context; skipped frames must come out zeroed, never garbage.
pub trait AudioDriver: Send {
    fn name(&self) -> &'static str;

    /// Allocate channel buffers and get ready to run
    fn open(&mut self, samplerate: u32, buffer: u32, channels: u32) -> VoxResult<()>;

    /// Install the engine's render callback
    fn set_process(&mut self, process: ProcessFn);

    /// Render `frames` frames (pull mode). `frames` must not exceed the
    /// opened buffer size.
    fn run(&mut self, frames: usize) -> VoxResult<()>;

    /// Coarse API/engine serialization
    fn lock(&self) -> MutexGuard<'_, ()>;

    /// The channel buffers as of the last `run`
    fn buffers(&self) -> &[Box<[Sample]>];

    fn channels(&self) -> usize;
}

// ═══════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

/// Create a built-in audio driver by name; `None` yields the default
/// (dummy) driver rather than failing.
pub fn new_audio_driver(name: Option<&str>) -> VoxResult<Box<dyn AudioDriver>> {
    match name {
        None | Some("dummy") => Ok(Box::new(crate::DummyAudioDriver::new())),
        Some("pull") | Some("stream") => Ok(Box::new(crate::PullAudioDriver::new())),
        Some(_) => Err(VoxError::DriverNotFound),
    }
}

/// Create a built-in MIDI driver by name; `None` yields the null driver.
pub fn new_midi_driver(name: Option<&str>) -> VoxResult<Box<dyn crate::MidiDriver>> {
    match name {
        None | Some("null") => Ok(Box::new(crate::NullMidiDriver::default())),
        Some("buffer") => Ok(Box::new(crate::BufferMidiDriver::new())),
        Some(_) => Err(VoxError::DriverNotFound),
    }
}

/// Create a system driver by name; `None` yields the host driver.
pub fn new_system_driver(name: Option<&str>) -> VoxResult<std::sync::Arc<dyn SystemDriver>> {
    match name {
        None | Some("host") => Ok(std::sync::Arc::new(HostSystemDriver)),
        Some(_) => Err(VoxError::DriverNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        assert_eq!(new_audio_driver(None).unwrap().name(), "dummy");
        assert_eq!(new_audio_driver(Some("pull")).unwrap().name(), "pull");
        assert!(new_audio_driver(Some("jack")).is_err());
        assert!(new_midi_driver(None).is_ok());
        assert_eq!(new_system_driver(None).unwrap().name(), "host");
    }
}
