//! PanMix unit
//!
//! Ramped volume and horizontal pan over four (in, out) channel layouts.
//! Pan magnitudes above 1.0 are legal; per-side gain is then clamped to
//! 2 * vol to keep the energy bounded.

use vox_core::VoxResult;

use crate::ramper::Ramper;
use crate::unit::{
    CoutQueue, ProcessCtx, Unit, UnitCtx, UnitDesc, UnitFlags, UnitIo, WriteCtx,
};

const R_VOL: usize = 0;
const R_PAN: usize = 1;

pub static PANMIX_DESC: UnitDesc = UnitDesc {
    name: "panmix",
    flags: UnitFlags::NONE,
    registers: &["vol", "pan"],
    coutputs: &[],
    constants: &[("CENTER", 0.0), ("LEFT", -1.0), ("RIGHT", 1.0)],
    min_inputs: 1,
    max_inputs: 2,
    min_outputs: 1,
    max_outputs: 2,
    create: PanMix::create,
};

pub struct PanMix {
    vol: Ramper,
    pan: Ramper,
    ninputs: usize,
    noutputs: usize,
    add: bool,
}

impl PanMix {
    fn create(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        Ok(Box::new(Self {
            vol: Ramper::new(1.0),
            pan: Ramper::new(0.0),
            ninputs: ctx.ninputs,
            noutputs: ctx.noutputs,
            add: ctx.add,
        }))
    }

    #[inline]
    fn needs_clamp(&self) -> bool {
        self.pan.target > 1.0
            || self.pan.target < -1.0
            || self.pan.value > 1.0
            || self.pan.value < -1.0
    }

    /// Left/right gains for the current ramper values
    #[inline]
    fn gains(&self, clamp: bool) -> (f32, f32) {
        let vol = self.vol.value;
        let vp = self.pan.value * vol;
        let mut v0 = vol - vp;
        let mut v1 = vol + vp;
        if clamp {
            let lim = vol * 2.0;
            if v0 > lim {
                v0 = lim;
            }
            if v1 > lim {
                v1 = lim;
            }
        }
        (v0, v1)
    }

    fn process_11(&mut self, io: &mut UnitIo, offset: usize, frames: usize) {
        self.vol.prepare(frames);
        let add = self.add;
        for s in offset..offset + frames {
            let v = io.inputs[0][s] * self.vol.value;
            if add {
                io.outputs[0][s] += v;
            } else {
                io.outputs[0][s] = v;
            }
            self.vol.run(1);
        }
    }

    fn process_12(&mut self, io: &mut UnitIo, offset: usize, frames: usize, clamp: bool) {
        self.vol.prepare(frames);
        self.pan.prepare(frames);
        let add = self.add;
        for s in offset..offset + frames {
            let (v0, v1) = self.gains(clamp);
            let ins = io.inputs[0][s];
            if add {
                io.outputs[0][s] += ins * v0;
                io.outputs[1][s] += ins * v1;
            } else {
                io.outputs[0][s] = ins * v0;
                io.outputs[1][s] = ins * v1;
            }
            self.vol.run(1);
            self.pan.run(1);
        }
    }

    fn process_21(&mut self, io: &mut UnitIo, offset: usize, frames: usize, clamp: bool) {
        self.vol.prepare(frames);
        self.pan.prepare(frames);
        let add = self.add;
        for s in offset..offset + frames {
            let (v0, v1) = self.gains(clamp);
            let v = io.inputs[0][s] * v0 + io.inputs[1][s] * v1;
            if add {
                io.outputs[0][s] += v;
            } else {
                io.outputs[0][s] = v;
            }
            self.vol.run(1);
            self.pan.run(1);
        }
    }

    fn process_22(&mut self, io: &mut UnitIo, offset: usize, frames: usize, clamp: bool) {
        self.vol.prepare(frames);
        self.pan.prepare(frames);
        let add = self.add;
        for s in offset..offset + frames {
            let (v0, v1) = self.gains(clamp);
            let in0 = io.inputs[0][s];
            let in1 = io.inputs[1][s];
            if add {
                io.outputs[0][s] += in0 * v0;
                io.outputs[1][s] += in1 * v1;
            } else {
                io.outputs[0][s] = in0 * v0;
                io.outputs[1][s] = in1 * v1;
            }
            self.vol.run(1);
            self.pan.run(1);
        }
    }
}

impl Unit for PanMix {
    fn process(
        &mut self,
        _ctx: &ProcessCtx,
        io: &mut UnitIo,
        _couts: &mut CoutQueue,
        offset: usize,
        frames: usize,
    ) {
        let clamp = self.needs_clamp();
        match (self.ninputs, self.noutputs) {
            (1, 1) => self.process_11(io, offset, frames),
            (1, 2) => self.process_12(io, offset, frames, clamp),
            (2, 1) => self.process_21(io, offset, frames, clamp),
            _ => self.process_22(io, offset, frames, clamp),
        }
    }

    fn set_register(&mut self, reg: usize, value: f32, start: u32, dur: u32, _wctx: &WriteCtx) {
        match reg {
            R_VOL => self.vol.set(value, start, dur),
            R_PAN => self.pan.set(value, start, dur),
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

    fn make(ninputs: usize, noutputs: usize) -> Box<dyn Unit> {
        let shared = SharedDsp::new(48000);
        let ctx = UnitCtx {
            samplerate: 48000,
            ninputs,
            noutputs,
            add: false,
            shared: &shared,
            alloc: &HostAlloc,
            cout_wiring: &[],
        };
        PanMix::create(&ctx).unwrap()
    }

    fn run(pm: &mut Box<dyn Unit>, io: &mut UnitIo, frames: usize) {
        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();
        pm.process(&ctx, io, &mut couts, 0, frames);
    }

    #[test]
    fn test_center_pan_splits_equally() {
        let mut pm = make(1, 2);
        let inp = [0.5f32; 8];
        let mut out0 = [0.0f32; 8];
        let mut out1 = [0.0f32; 8];
        let mut io = UnitIo {
            inputs: [&inp, &[]],
            outputs: [&mut out0, &mut out1],
            ninputs: 1,
            noutputs: 2,
        };
        run(&mut pm, &mut io, 8);
        // vol 1, pan 0: both sides get the input as-is
        assert_relative_eq!(out0[4], 0.5);
        assert_relative_eq!(out1[4], 0.5);
    }

    #[test]
    fn test_hard_right() {
        let mut pm = make(1, 2);
        pm.set_register(R_PAN, 1.0, 0, 0, &WriteCtx::default());
        let inp = [0.5f32; 8];
        let mut out0 = [0.0f32; 8];
        let mut out1 = [0.0f32; 8];
        let mut io = UnitIo {
            inputs: [&inp, &[]],
            outputs: [&mut out0, &mut out1],
            ninputs: 1,
            noutputs: 2,
        };
        run(&mut pm, &mut io, 8);
        assert_relative_eq!(out0[4], 0.0);
        assert_relative_eq!(out1[4], 1.0);
    }

    #[test]
    fn test_overdriven_pan_clamps() {
        let mut pm = make(1, 2);
        pm.set_register(R_PAN, 3.0, 0, 0, &WriteCtx::default());
        let inp = [1.0f32; 8];
        let mut out0 = [0.0f32; 8];
        let mut out1 = [0.0f32; 8];
        let mut io = UnitIo {
            inputs: [&inp, &[]],
            outputs: [&mut out0, &mut out1],
            ninputs: 1,
            noutputs: 2,
        };
        run(&mut pm, &mut io, 8);
        // v1 would be vol + 3*vol = 4; clamp keeps it at 2 * vol
        assert_relative_eq!(out1[4], 2.0);
        // v0 = vol - 3*vol = -2 is left alone (phase-inverted bleed)
        assert_relative_eq!(out0[4], -2.0);
    }

    #[test]
    fn test_vol_ramp_is_applied_per_sample() {
        let mut pm = make(1, 1);
        pm.set_register(R_VOL, 0.0, 0, 8 << 8, &WriteCtx::default());
        let inp = [1.0f32; 8];
        let mut out = [0.0f32; 8];
        let mut io = UnitIo {
            inputs: [&inp, &[]],
            outputs: [&mut out, &mut []],
            ninputs: 1,
            noutputs: 1,
        };
        run(&mut pm, &mut io, 8);
        // Monotonically falling toward 0
        for s in 1..8 {
            assert!(out[s] <= out[s - 1]);
        }
        assert!(out[7] < 0.2);
    }

    #[test]
    fn test_stereo_downmix() {
        let mut pm = make(2, 1);
        let in0 = [0.25f32; 4];
        let in1 = [0.75f32; 4];
        let mut out = [0.0f32; 4];
        let mut io = UnitIo {
            inputs: [&in0, &in1],
            outputs: [&mut out, &mut []],
            ninputs: 2,
            noutputs: 1,
        };
        run(&mut pm, &mut io, 4);
        // vol 1, pan 0: plain sum
        assert_relative_eq!(out[2], 1.0);
    }
}
