//! 12 dB/oct DC blocker filter unit
//!
//! A state-variable filter whose highpass output removes DC and subsonics.
//! The cutoff register is linear pitch, offset by the voice transpose.

use std::f32::consts::PI;

use vox_core::{VoxError, VoxResult, pitch_to_hz};

use crate::unit::{
    CoutQueue, MAX_UNIT_IO, ProcessCtx, Unit, UnitCtx, UnitDesc, UnitFlags, UnitIo, WriteCtx,
};

const R_CUTOFF: usize = 0;

/// Default cutoff: -5.0 linear pitch = 8.175813 Hz
const DEFAULT_CUTOFF: f32 = -5.0;

pub static DCBLOCK_DESC: UnitDesc = UnitDesc {
    name: "dcblock",
    flags: UnitFlags::MATCHIO,
    registers: &["cutoff"],
    coutputs: &[],
    constants: &[],
    min_inputs: 1,
    max_inputs: 2,
    min_outputs: 1,
    max_outputs: 2,
    create: DcBlock::create,
};

pub struct DcBlock {
    samplerate: u32,
    /// Filter f0 (linear pitch)
    cutoff: f32,
    /// Current pitch coefficient
    f1: f32,
    d1: [f32; MAX_UNIT_IO],
    d2: [f32; MAX_UNIT_IO],
    channels: usize,
    add: bool,
}

impl DcBlock {
    fn create(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        if ctx.ninputs != ctx.noutputs {
            return Err(VoxError::IoDontMatch);
        }
        let mut u = Self {
            samplerate: ctx.samplerate,
            cutoff: DEFAULT_CUTOFF,
            f1: 0.0,
            d1: [0.0; MAX_UNIT_IO],
            d2: [0.0; MAX_UNIT_IO],
            channels: ctx.ninputs,
            add: ctx.add,
        };
        u.f1 = u.pitch2coeff();
        Ok(Box::new(u))
    }

    fn pitch2coeff(&self) -> f32 {
        let mut f = pitch_to_hz(self.cutoff);
        // This filter explodes above Nyquist / 2
        if f > self.samplerate as f32 * 0.25 {
            f = self.samplerate as f32 * 0.25;
        }
        2.0 * (PI * f / self.samplerate as f32).sin()
    }
}

impl Unit for DcBlock {
    fn process(
        &mut self,
        _ctx: &ProcessCtx,
        io: &mut UnitIo,
        _couts: &mut CoutQueue,
        offset: usize,
        frames: usize,
    ) {
        let f = self.f1;
        let add = self.add;
        for s in offset..offset + frames {
            for c in 0..self.channels {
                let d1 = self.d1[c];
                let low = self.d2[c] + f * d1;
                let high = io.inputs[c][s] * 0.5 - low - d1;
                let band = f * high + d1;
                if add {
                    io.outputs[c][s] += high;
                } else {
                    io.outputs[c][s] = high;
                }
                self.d1[c] = band;
                self.d2[c] = low;
            }
        }
    }

    fn set_register(&mut self, reg: usize, value: f32, _start: u32, _dur: u32, wctx: &WriteCtx) {
        if reg == R_CUTOFF {
            self.cutoff = value + wctx.transpose;
            self.f1 = self.pitch2coeff();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::SharedDsp;
    use crate::wave::WaveTable;
    use vox_core::HostAlloc;

    fn make() -> Box<dyn Unit> {
        let shared = SharedDsp::new(48000);
        let ctx = UnitCtx {
            samplerate: 48000,
            ninputs: 1,
            noutputs: 1,
            add: false,
            shared: &shared,
            alloc: &HostAlloc,
            cout_wiring: &[],
        };
        DcBlock::create(&ctx).unwrap()
    }

    #[test]
    fn test_dc_is_removed() {
        let mut u = make();
        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();

        let inp = [1.0f32; 64];
        let mut last = 0.0;
        // Feed a constant for a while; the output must decay toward zero
        for _ in 0..200 {
            let mut out = [0.0f32; 64];
            let mut io = UnitIo {
                inputs: [&inp, &[]],
                outputs: [&mut out, &mut []],
                ninputs: 1,
                noutputs: 1,
            };
            u.process(&ctx, &mut io, &mut couts, 0, 64);
            last = out[63];
        }
        assert!(last.abs() < 0.01, "residual DC {last}");
    }

    #[test]
    fn test_cutoff_clamped_for_stability() {
        let mut u = make();
        // An absurd cutoff must not blow the filter up
        u.set_register(R_CUTOFF, 12.0, 0, 0, &WriteCtx::default());

        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();
        let inp: Vec<f32> = (0..256).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let mut out = vec![0.0f32; 256];
        let mut io = UnitIo {
            inputs: [&inp, &[]],
            outputs: [&mut out, &mut []],
            ninputs: 1,
            noutputs: 1,
        };
        u.process(&ctx, &mut io, &mut couts, 0, 256);
        assert!(out.iter().all(|s| s.is_finite() && s.abs() < 4.0));
    }
}
