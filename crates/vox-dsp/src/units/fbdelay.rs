//! Cross-feedback stereo delay unit
//!
//! The feedback path swaps channels, bouncing echoes across the stereo
//! field. Delay buffers are pre-allocated at unit initialization through
//! the system driver's realtime allocator.

use vox_core::{Sample, VoxResult};

use crate::unit::{
    CoutQueue, ProcessCtx, Unit, UnitCtx, UnitDesc, UnitFlags, UnitIo, WriteCtx,
};

const R_FBDELAY: usize = 0;
const R_LDELAY: usize = 1;
const R_RDELAY: usize = 2;
const R_DRYGAIN: usize = 3;
const R_FBGAIN: usize = 4;
const R_LGAIN: usize = 5;
const R_RGAIN: usize = 6;

/// Ring buffer size in samples (power of two)
const BUF_SIZE: usize = 131072;

pub static FBDELAY_DESC: UnitDesc = UnitDesc {
    name: "fbdelay",
    flags: UnitFlags::NONE,
    registers: &[
        "fbdelay", "ldelay", "rdelay", "drygain", "fbgain", "lgain", "rgain",
    ],
    coutputs: &[],
    constants: &[],
    min_inputs: 1,
    max_inputs: 2,
    min_outputs: 1,
    max_outputs: 2,
    create: FbDelay::create,
};

pub struct FbDelay {
    samplerate: u32,

    // Timings (sample frames)
    fbdelay: f32,
    ldelay: f32,
    rdelay: f32,

    // Gains
    drygain: f32,
    fbgain: f32,
    lgain: f32,
    rgain: f32,

    lbuf: Box<[Sample]>,
    rbuf: Box<[Sample]>,
    bufpos: usize,

    stereo_in: bool,
    stereo_out: bool,
    add: bool,
}

impl FbDelay {
    fn create(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        let ms = ctx.samplerate as f32 * 0.001;
        Ok(Box::new(Self {
            samplerate: ctx.samplerate,
            fbdelay: 400.0 * ms,
            ldelay: 280.0 * ms,
            rdelay: 320.0 * ms,
            drygain: 1.0,
            fbgain: 0.25,
            lgain: 0.5,
            rgain: 0.5,
            lbuf: ctx.alloc.alloc_samples(BUF_SIZE),
            rbuf: ctx.alloc.alloc_samples(BUF_SIZE),
            bufpos: 0,
            stereo_in: ctx.ninputs == 2,
            stereo_out: ctx.noutputs == 2,
            add: ctx.add,
        }))
    }

    #[inline]
    fn tap(&self, back: f32) -> usize {
        self.bufpos.wrapping_sub(back as usize) & (BUF_SIZE - 1)
    }
}

impl Unit for FbDelay {
    fn process(
        &mut self,
        _ctx: &ProcessCtx,
        io: &mut UnitIo,
        _couts: &mut CoutQueue,
        offset: usize,
        frames: usize,
    ) {
        let add = self.add;
        let stereo_in = self.stereo_in;
        let stereo_out = self.stereo_out;
        for s in offset..offset + frames {
            let i0 = io.inputs[0][s];
            let i1 = io.inputs[if stereo_in { 1 } else { 0 }][s];

            // Feedback delay taps (reverse stereo)
            let fb = self.tap(self.fbdelay);
            let mut o0 = self.rbuf[fb] * self.fbgain;
            let mut o1 = self.lbuf[fb] * self.fbgain;

            // Inject input + feedback into the buffers
            let w = self.tap(0.0);
            self.lbuf[w] = i0 + o0;
            self.rbuf[w] = i1 + o1;

            // Delay taps
            o0 += self.lbuf[self.tap(self.ldelay)] * self.lgain;
            o1 += self.rbuf[self.tap(self.rdelay)] * self.rgain;

            // Dry bypass
            o0 += i0 * self.drygain;
            o1 += i1 * self.drygain;

            if stereo_out {
                if add {
                    io.outputs[0][s] += o0;
                    io.outputs[1][s] += o1;
                } else {
                    io.outputs[0][s] = o0;
                    io.outputs[1][s] = o1;
                }
            } else if add {
                io.outputs[0][s] += (o0 + o1) * 0.5;
            } else {
                io.outputs[0][s] = (o0 + o1) * 0.5;
            }
            self.bufpos = self.bufpos.wrapping_add(1);
        }
    }

    fn set_register(&mut self, reg: usize, value: f32, _start: u32, _dur: u32, _wctx: &WriteCtx) {
        let ms = self.samplerate as f32 * 0.001;
        match reg {
            R_FBDELAY => self.fbdelay = value * ms,
            R_LDELAY => self.ldelay = value * ms,
            R_RDELAY => self.rdelay = value * ms,
            R_DRYGAIN => self.drygain = value,
            R_FBGAIN => self.fbgain = value,
            R_LGAIN => self.lgain = value,
            R_RGAIN => self.rgain = value,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::SharedDsp;
    use crate::wave::WaveTable;
    use approx::assert_relative_eq;
    use vox_core::HostAlloc;

    fn make() -> Box<dyn Unit> {
        let shared = SharedDsp::new(48000);
        let ctx = UnitCtx {
            samplerate: 48000,
            ninputs: 2,
            noutputs: 2,
            add: false,
            shared: &shared,
            alloc: &HostAlloc,
            cout_wiring: &[],
        };
        FbDelay::create(&ctx).unwrap()
    }

    #[test]
    fn test_dry_passthrough() {
        let mut u = make();
        let wctx = WriteCtx::default();
        // Kill all wet paths
        u.set_register(R_FBGAIN, 0.0, 0, 0, &wctx);
        u.set_register(R_LGAIN, 0.0, 0, 0, &wctx);
        u.set_register(R_RGAIN, 0.0, 0, 0, &wctx);

        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();
        let in0 = [0.5f32; 16];
        let in1 = [-0.25f32; 16];
        let mut out0 = [0.0f32; 16];
        let mut out1 = [0.0f32; 16];
        let mut io = UnitIo {
            inputs: [&in0, &in1],
            outputs: [&mut out0, &mut out1],
            ninputs: 2,
            noutputs: 2,
        };
        u.process(&ctx, &mut io, &mut couts, 0, 16);
        assert_relative_eq!(out0[8], 0.5);
        assert_relative_eq!(out1[8], -0.25);
    }

    #[test]
    fn test_left_tap_appears_after_delay() {
        let mut u = make();
        let wctx = WriteCtx::default();
        u.set_register(R_DRYGAIN, 0.0, 0, 0, &wctx);
        u.set_register(R_FBGAIN, 0.0, 0, 0, &wctx);
        u.set_register(R_RGAIN, 0.0, 0, 0, &wctx);
        u.set_register(R_LGAIN, 1.0, 0, 0, &wctx);
        // 1 ms = 48 frames at 48 kHz
        u.set_register(R_LDELAY, 1.0, 0, 0, &wctx);

        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();

        // Impulse on the left channel
        let mut in0 = [0.0f32; 128];
        in0[0] = 1.0;
        let in1 = [0.0f32; 128];
        let mut out0 = [0.0f32; 128];
        let mut out1 = [0.0f32; 128];
        let mut io = UnitIo {
            inputs: [&in0, &in1],
            outputs: [&mut out0, &mut out1],
            ninputs: 2,
            noutputs: 2,
        };
        u.process(&ctx, &mut io, &mut couts, 0, 128);

        assert_relative_eq!(out0[48], 1.0, epsilon = 1e-6);
        assert!(out0[..48].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_feedback_swaps_channels() {
        let mut u = make();
        let wctx = WriteCtx::default();
        u.set_register(R_DRYGAIN, 0.0, 0, 0, &wctx);
        u.set_register(R_LGAIN, 0.0, 0, 0, &wctx);
        u.set_register(R_RGAIN, 0.0, 0, 0, &wctx);
        u.set_register(R_FBGAIN, 0.5, 0, 0, &wctx);
        u.set_register(R_FBDELAY, 1.0, 0, 0, &wctx); // 48 frames

        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();

        let mut in0 = [0.0f32; 128];
        in0[0] = 1.0;
        let in1 = [0.0f32; 128];
        let mut out0 = [0.0f32; 128];
        let mut out1 = [0.0f32; 128];
        let mut io = UnitIo {
            inputs: [&in0, &in1],
            outputs: [&mut out0, &mut out1],
            ninputs: 2,
            noutputs: 2,
        };
        u.process(&ctx, &mut io, &mut couts, 0, 128);

        // First bounce of a left impulse lands on the right
        assert_relative_eq!(out1[48], 0.5, epsilon = 1e-6);
        assert_relative_eq!(out0[48], 0.0, epsilon = 1e-6);
    }
}
