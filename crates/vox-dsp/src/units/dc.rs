//! Ramping DC generator unit
//!
//! STEP mode holds the old value until the switch point, emits one
//! transient sample blending old and new, then holds the new value.
//! LINEAR mode ramps per sample.

use vox_core::VoxResult;

use crate::ramper::Ramper;
use crate::unit::{
    CoutQueue, ProcessCtx, Unit, UnitCtx, UnitDesc, UnitFlags, UnitIo, WriteCtx,
};

const R_VALUE: usize = 0;
const R_MODE: usize = 1;

pub const MODE_STEP: f32 = 0.0;
pub const MODE_LINEAR: f32 = 1.0;

const ONE_DIV_256: f32 = 1.0 / 256.0;

pub static DC_DESC: UnitDesc = UnitDesc {
    name: "dc",
    flags: UnitFlags::NONE,
    registers: &["value", "mode"],
    coutputs: &[],
    constants: &[("STEP", MODE_STEP), ("LINEAR", MODE_LINEAR)],
    min_inputs: 0,
    max_inputs: 0,
    min_outputs: 1,
    max_outputs: 2,
    create: Dc::create,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RampMode {
    Step,
    Linear,
}

pub struct Dc {
    value: Ramper,
    mode: RampMode,
    noutputs: usize,
    add: bool,
}

impl Dc {
    fn create(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        Ok(Box::new(Self {
            value: Ramper::new(0.0),
            mode: RampMode::Linear,
            noutputs: ctx.noutputs,
            add: ctx.add,
        }))
    }

    #[inline]
    fn emit(&self, io: &mut UnitIo, s: usize, v: f32) {
        for o in 0..self.noutputs {
            if self.add {
                io.outputs[o][s] += v;
            } else {
                io.outputs[o][s] = v;
            }
        }
    }

    fn process_step(&mut self, io: &mut UnitIo, offset: usize, frames: usize) {
        let end = offset + frames;
        let mut s = offset;
        let v = &mut self.value;

        // Hold the old value until the switch point
        if v.timer >= 256 {
            let e2;
            if (v.timer >> 8) as usize >= frames {
                e2 = end;
                v.timer -= (frames as u32) << 8;
            } else {
                e2 = s + (v.timer >> 8) as usize;
                v.timer &= 0xff;
            }
            let hold = v.value;
            while s < e2 {
                for o in 0..self.noutputs {
                    if self.add {
                        io.outputs[o][s] += hold;
                    } else {
                        io.outputs[o][s] = hold;
                    }
                }
                s += 1;
            }
        }

        // One transient sample at the switch
        if self.value.timer < 256 && s < end {
            // TODO: minBLEP or similar
            let v = &mut self.value;
            let x = v.timer as f32 * ONE_DIV_256;
            let tv = v.value * x + v.target * (1.0 - x);
            v.timer = 0;
            v.value = v.target;
            self.emit(io, s, tv);
            s += 1;
        }

        // Hold the new value from the switch point on
        let tv = self.value.target;
        while s < end {
            self.emit(io, s, tv);
            s += 1;
        }
    }

    fn process_linear(&mut self, io: &mut UnitIo, offset: usize, frames: usize) {
        self.value.prepare(frames);
        for s in offset..offset + frames {
            let v = self.value.value;
            self.emit(io, s, v);
            self.value.run(1);
        }
    }
}

impl Unit for Dc {
    fn process(
        &mut self,
        _ctx: &ProcessCtx,
        io: &mut UnitIo,
        _couts: &mut CoutQueue,
        offset: usize,
        frames: usize,
    ) {
        match self.mode {
            RampMode::Step => self.process_step(io, offset, frames),
            RampMode::Linear => self.process_linear(io, offset, frames),
        }
    }

    fn set_register(&mut self, reg: usize, value: f32, start: u32, dur: u32, _wctx: &WriteCtx) {
        match reg {
            R_VALUE => match self.mode {
                RampMode::Step => {
                    // Switch point at the midpoint of the requested ramp
                    self.value.target = value;
                    let timer = (dur as i64 >> 1) - start as i64;
                    if timer <= 0 {
                        self.value.value = self.value.target;
                        self.value.timer = 0;
                    } else {
                        self.value.timer = timer as u32;
                    }
                }
                RampMode::Linear => self.value.set(value, start, dur),
            },
            R_MODE => {
                self.mode = if value == MODE_LINEAR {
                    RampMode::Linear
                } else {
                    RampMode::Step
                };
            }
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

    fn make(noutputs: usize) -> Box<dyn Unit> {
        let shared = SharedDsp::new(48000);
        let ctx = UnitCtx {
            samplerate: 48000,
            ninputs: 0,
            noutputs,
            add: false,
            shared: &shared,
            alloc: &HostAlloc,
            cout_wiring: &[],
        };
        Dc::create(&ctx).unwrap()
    }

    fn run(dc: &mut Box<dyn Unit>, io: &mut UnitIo, frames: usize) {
        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();
        dc.process(&ctx, io, &mut couts, 0, frames);
    }

    #[test]
    fn test_step_immediate_settles() {
        let mut dc = make(2);
        let wctx = WriteCtx::default();
        dc.set_register(R_MODE, MODE_STEP, 0, 0, &wctx);
        dc.set_register(R_VALUE, 0.5, 0, 0, &wctx);

        let mut out0 = [0.0f32; 16];
        let mut out1 = [0.0f32; 16];
        let mut io = UnitIo {
            inputs: [&[], &[]],
            outputs: [&mut out0, &mut out1],
            ninputs: 0,
            noutputs: 2,
        };
        run(&mut dc, &mut io, 16);

        for s in 0..16 {
            assert_relative_eq!(out0[s], 0.5);
            assert_relative_eq!(out1[s], 0.5);
        }
    }

    #[test]
    fn test_step_switch_midway() {
        let mut dc = make(1);
        let wctx = WriteCtx::default();
        dc.set_register(R_MODE, MODE_STEP, 0, 0, &wctx);
        // 16-frame ramp: switch point lands at frame 8
        dc.set_register(R_VALUE, 1.0, 0, 16 << 8, &wctx);

        let mut out = [0.0f32; 16];
        let mut io = UnitIo {
            inputs: [&[], &[]],
            outputs: [&mut out, &mut []],
            ninputs: 0,
            noutputs: 1,
        };
        run(&mut dc, &mut io, 16);

        assert_relative_eq!(out[3], 0.0);
        assert_relative_eq!(out[12], 1.0);
        // Exactly one transient sample at the switch
        let transitions = (1..16).filter(|&s| out[s] != out[s - 1]).count();
        assert!(transitions <= 2);
    }

    #[test]
    fn test_linear_ramp() {
        let mut dc = make(1);
        let wctx = WriteCtx::default();
        dc.set_register(R_VALUE, 1.0, 0, 16 << 8, &wctx);

        let mut out = [0.0f32; 16];
        let mut io = UnitIo {
            inputs: [&[], &[]],
            outputs: [&mut out, &mut []],
            ninputs: 0,
            noutputs: 1,
        };
        run(&mut dc, &mut io, 16);

        for s in 1..16 {
            assert!(out[s] >= out[s - 1]);
        }
    }

    #[test]
    fn test_step_holds_across_blocks() {
        let mut dc = make(1);
        let wctx = WriteCtx::default();
        dc.set_register(R_MODE, MODE_STEP, 0, 0, &wctx);
        // Switch point beyond the first block
        dc.set_register(R_VALUE, 1.0, 0, 64 << 8, &wctx);

        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();

        let mut out = [9.0f32; 16];
        let mut io = UnitIo {
            inputs: [&[], &[]],
            outputs: [&mut out, &mut []],
            ninputs: 0,
            noutputs: 1,
        };
        dc.process(&ctx, &mut io, &mut couts, 0, 16);
        assert_relative_eq!(out[15], 0.0);

        // Second block of 16 still holds; switch lands in block 3
        let mut out2 = [9.0f32; 16];
        let mut io2 = UnitIo {
            inputs: [&[], &[]],
            outputs: [&mut out2, &mut []],
            ninputs: 0,
            noutputs: 1,
        };
        dc.process(&ctx, &mut io2, &mut couts, 0, 16);
        assert_relative_eq!(out2[15], 0.0);
    }
}
