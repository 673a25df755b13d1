//! Waveshaper unit
//!
//! Transfer function:
//!   y = ((3a + 1)x - 2a * x|x|) / (a²x² + 1)
//!
//! Maintains a fairly constant perceived output power regardless of the
//! shaping amount for input in the [-0.5, 0.5] range. Output can peak
//! around ±1.5, which is the price of keeping a unity transfer function at
//! amount 0.

use vox_core::{VoxResult, VoxError};

use crate::ramper::Ramper;
use crate::unit::{
    CoutQueue, ProcessCtx, Unit, UnitCtx, UnitDesc, UnitFlags, UnitIo, WriteCtx,
};

const R_AMOUNT: usize = 0;

pub static WAVESHAPER_DESC: UnitDesc = UnitDesc {
    name: "waveshaper",
    flags: UnitFlags::MATCHIO,
    registers: &["amount"],
    coutputs: &[],
    constants: &[],
    min_inputs: 1,
    max_inputs: 2,
    min_outputs: 1,
    max_outputs: 2,
    create: Waveshaper::create,
};

pub struct Waveshaper {
    amount: Ramper,
    channels: usize,
    add: bool,
}

impl Waveshaper {
    fn create(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        if ctx.ninputs != ctx.noutputs {
            return Err(VoxError::IoDontMatch);
        }
        Ok(Box::new(Self {
            amount: Ramper::new(0.0),
            channels: ctx.ninputs,
            add: ctx.add,
        }))
    }

    #[inline]
    fn shape(a: f32, v: f32) -> f32 {
        let mut out = v * (3.0 * a + 1.0);
        let sqrsub = a * v * v;
        if v >= 0.0 {
            out -= sqrsub;
        } else {
            out += sqrsub;
        }
        out / (a * a * v * v + 1.0)
    }
}

impl Unit for Waveshaper {
    fn process(
        &mut self,
        _ctx: &ProcessCtx,
        io: &mut UnitIo,
        _couts: &mut CoutQueue,
        offset: usize,
        frames: usize,
    ) {
        self.amount.prepare(frames);
        let add = self.add;
        for s in offset..offset + frames {
            let a = self.amount.value;
            for c in 0..self.channels {
                let out = Self::shape(a, io.inputs[c][s]);
                if add {
                    io.outputs[c][s] += out;
                } else {
                    io.outputs[c][s] = out;
                }
            }
            self.amount.run(1);
        }
    }

    fn set_register(&mut self, reg: usize, value: f32, start: u32, dur: u32, _wctx: &WriteCtx) {
        if reg == R_AMOUNT {
            self.amount.set(value, start, dur);
        }
    }
}
