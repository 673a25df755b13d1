//! Pull-mode audio driver
//!
//! Renders on demand into readable channel buffers, for callers that
//! consume engine output themselves: offline rendering, piping into a
//! file writer, or feeding another audio system's callback. This is the
//! "stream" role; channel buffers are torn down by `Drop`.

use parking_lot::{Mutex, MutexGuard};

use vox_core::{Sample, VoxError, VoxResult};

use crate::driver::{AudioDriver, ProcessFn};

pub struct PullAudioDriver {
    buffers: Vec<Box<[Sample]>>,
    buffer_frames: usize,
    /// Valid frames from the last run
    rendered: usize,
    process: Option<ProcessFn>,
    lock: Mutex<()>,
    open: bool,
}

impl PullAudioDriver {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            buffer_frames: 0,
            rendered: 0,
            process: None,
            lock: Mutex::new(()),
            open: false,
        }
    }

    /// Frames rendered by the last [`run`](AudioDriver::run)
    pub fn available(&self) -> usize {
        self.rendered
    }

    /// Copy the last rendered frames out interleaved. Returns the number
    /// of frames written.
    pub fn read_interleaved(&self, out: &mut [Sample]) -> usize {
        let channels = self.buffers.len();
        if channels == 0 {
            return 0;
        }
        let frames = (out.len() / channels).min(self.rendered);
        for f in 0..frames {
            for (c, ch) in self.buffers.iter().enumerate() {
                out[f * channels + c] = ch[f];
            }
        }
        frames
    }
}

impl Default for PullAudioDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDriver for PullAudioDriver {
    fn name(&self) -> &'static str {
        "pull"
    }

    fn open(&mut self, samplerate: u32, buffer: u32, channels: u32) -> VoxResult<()> {
        if self.open {
            return Err(VoxError::AlreadyOpen);
        }
        log::debug!("pull audio driver: {samplerate} Hz, {buffer} frames, {channels} channels");
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
        self.rendered = frames;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_and_read_interleaved() {
        let mut d = PullAudioDriver::new();
        d.open(48000, 64, 2).unwrap();
        d.set_process(Box::new(|bufs, frames| {
            bufs[0][..frames].fill(1.0);
            bufs[1][..frames].fill(-1.0);
        }));
        d.run(16).unwrap();
        assert_eq!(d.available(), 16);

        let mut out = vec![0.0; 32];
        let frames = d.read_interleaved(&mut out);
        assert_eq!(frames, 16);
        assert_eq!(out[0], 1.0);
        assert_eq!(out[1], -1.0);
        assert_eq!(out[30], 1.0);
        assert_eq!(out[31], -1.0);
    }
}
