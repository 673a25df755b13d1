//! Dummy audio driver
//!
//! Renders into internal buffers and discards the result. Useful for
//! opening an engine with no audio hardware at all, and as the default
//! when a configuration names no audio driver.

use parking_lot::{Mutex, MutexGuard};

use vox_core::{Sample, VoxError, VoxResult};

use crate::driver::{AudioDriver, ProcessFn};

pub struct DummyAudioDriver {
    buffers: Vec<Box<[Sample]>>,
    buffer_frames: usize,
    process: Option<ProcessFn>,
    lock: Mutex<()>,
    open: bool,
}

impl DummyAudioDriver {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            buffer_frames: 0,
            process: None,
            lock: Mutex::new(()),
            open: false,
        }
    }
}

impl Default for DummyAudioDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDriver for DummyAudioDriver {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn open(&mut self, samplerate: u32, buffer: u32, channels: u32) -> VoxResult<()> {
        if self.open {
            return Err(VoxError::AlreadyOpen);
        }
        log::debug!("dummy audio driver: {samplerate} Hz, {buffer} frames, {channels} channels");
        self.buffers = (0..channels)
            .map(|_| vec![0.0; buffer as usize].into_boxed_slice())
            .collect();
        self.buffer_frames = buffer as usize;
        self.open = true;
        Ok(())
    }

    fn set_process(&mut self, process: ProcessFn) {
        self.process = Some(process);
    }

    fn run(&mut self, frames: usize) -> VoxResult<()> {
        if !self.open {
            return Err(VoxError::DeviceOpen);
        }
        if frames > self.buffer_frames {
            return Err(VoxError::BadBufSize);
        }
        match self.process.as_mut() {
            Some(process) => process(&mut self.buffers, frames),
            None => {
                for ch in &mut self.buffers {
                    ch[..frames].fill(0.0);
                }
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    fn buffers(&self) -> &[Box<[Sample]>] {
        &self.buffers
    }

    fn channels(&self) -> usize {
        self.buffers.len()
    }
}
