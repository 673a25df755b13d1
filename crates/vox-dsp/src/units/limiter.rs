//! Compressor/limiter unit
//!
//! A peak-following limiter. The stereo version takes both channels into
//! account in a way that reduces the effect of the center appearing to
//! have more power after compression of signals with unbalanced stereo
//! images: a dead center signal can only get 3 dB louder than the same
//! signal in one channel only, as opposed to the usual 6 dB of a limiter
//! that only looks at max(L, R).

use vox_core::{VoxError, VoxResult};

use crate::unit::{
    CoutQueue, ProcessCtx, Unit, UnitCtx, UnitDesc, UnitFlags, UnitIo, WriteCtx,
};

const R_RELEASE: usize = 0;
const R_THRESHOLD: usize = 1;

const DEFAULT_RELEASE: f32 = 64.0;
const MIN_THRESHOLD: f32 = 0.001;

pub static LIMITER_DESC: UnitDesc = UnitDesc {
    name: "limiter",
    flags: UnitFlags::MATCHIO,
    registers: &["release", "threshold"],
    coutputs: &[],
    constants: &[],
    min_inputs: 1,
    max_inputs: 2,
    min_outputs: 1,
    max_outputs: 2,
    create: Limiter::create,
};

pub struct Limiter {
    samplerate: u32,
    /// Reaction threshold
    threshold: f32,
    /// Release "speed" (per sample)
    release: f32,
    /// Filtered peak value
    peak: f32,
    stereo: bool,
    add: bool,
}

impl Limiter {
    fn create(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        if ctx.ninputs != ctx.noutputs {
            return Err(VoxError::IoDontMatch);
        }
        Ok(Box::new(Self {
            samplerate: ctx.samplerate,
            threshold: 1.0,
            release: DEFAULT_RELEASE / ctx.samplerate as f32,
            peak: 1.0,
            stereo: ctx.ninputs == 2,
            add: ctx.add,
        }))
    }

    #[inline]
    fn follow(&mut self, p: f32) -> f32 {
        if p > self.peak {
            self.peak = p;
            p
        } else {
            self.peak -= self.release;
            if self.peak < self.threshold {
                self.peak = self.threshold;
            }
            self.peak
        }
    }

    fn process_mono(&mut self, io: &mut UnitIo, offset: usize, frames: usize) {
        let add = self.add;
        for s in offset..offset + frames {
            let v = io.inputs[0][s];
            let p = self.follow(v.abs());
            let gain = 1.0 / p;
            if add {
                io.outputs[0][s] += v * gain;
            } else {
                io.outputs[0][s] = v * gain;
            }
        }
    }

    fn process_stereo(&mut self, io: &mut UnitIo, offset: usize, frames: usize) {
        let add = self.add;
        for s in offset..offset + frames {
            let l = io.inputs[0][s];
            let r = io.inputs[1][s];
            let lp = l.abs();
            let rp = r.abs();
            let mut p = lp.max(rp);
            p += 0.5 * (p - (lp - rp).abs());
            let p = self.follow(p);
            let gain = 1.0 / p;
            if add {
                io.outputs[0][s] += l * gain;
                io.outputs[1][s] += r * gain;
            } else {
                io.outputs[0][s] = l * gain;
                io.outputs[1][s] = r * gain;
            }
        }
    }
}

impl Unit for Limiter {
    fn process(
        &mut self,
        _ctx: &ProcessCtx,
        io: &mut UnitIo,
        _couts: &mut CoutQueue,
        offset: usize,
        frames: usize,
    ) {
        if self.stereo {
            self.process_stereo(io, offset, frames);
        } else {
            self.process_mono(io, offset, frames);
        }
    }

    fn set_register(&mut self, reg: usize, value: f32, _start: u32, _dur: u32, _wctx: &WriteCtx) {
        match reg {
            R_RELEASE => self.release = value / self.samplerate as f32,
            R_THRESHOLD => {
                self.threshold = value.max(MIN_THRESHOLD);
                // Reset the follower so the new floor takes effect at once
                self.peak = self.threshold;
            }
            _ => {}
        }
    }
}
