//! Audio tap units
//!
//! `xsink` terminates a chain and pushes its input frames into a sink
//! client's ring; `xinsert` does the same while passing audio through, so
//! it can sit in the middle of a chain. Sink clients pull interleaved
//! frames from the other end of the ring on the API side (visualization,
//! capture).
//!
//! With no client attached, both units are inert taps; xinsert still
//! passes audio through.

use vox_core::{Sample, VoxError, VoxResult};

use crate::unit::{
    CoutQueue, ProcessCtx, SinkTap, Unit, UnitCtx, UnitDesc, UnitFlags, UnitIo, WriteCtx,
};

pub static XSINK_DESC: UnitDesc = UnitDesc {
    name: "xsink",
    flags: UnitFlags::NONE,
    registers: &[],
    coutputs: &[],
    constants: &[],
    min_inputs: 1,
    max_inputs: 2,
    min_outputs: 0,
    max_outputs: 0,
    create: Tap::create_sink,
};

pub static XINSERT_DESC: UnitDesc = UnitDesc {
    name: "xinsert",
    flags: UnitFlags::MATCHIO,
    registers: &[],
    coutputs: &[],
    constants: &[],
    min_inputs: 1,
    max_inputs: 2,
    min_outputs: 1,
    max_outputs: 2,
    create: Tap::create_insert,
};

pub struct Tap {
    ninputs: usize,
    passthrough: bool,
    add: bool,
    tap: Option<SinkTap>,
    /// Frames dropped because the client ring was full
    overruns: u64,
}

impl Tap {
    fn create_sink(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        Ok(Box::new(Self {
            ninputs: ctx.ninputs,
            passthrough: false,
            add: ctx.add,
            tap: None,
            overruns: 0,
        }))
    }

    fn create_insert(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        if ctx.ninputs != ctx.noutputs {
            return Err(VoxError::IoDontMatch);
        }
        Ok(Box::new(Self {
            ninputs: ctx.ninputs,
            passthrough: true,
            add: ctx.add,
            tap: None,
            overruns: 0,
        }))
    }

    fn push_frames(&mut self, io: &UnitIo, offset: usize, frames: usize) {
        let Some(tap) = self.tap.as_mut() else {
            return;
        };
        let channels = tap.channels.min(self.ninputs).max(1);
        for s in offset..offset + frames {
            if tap.ring.slots() < channels {
                // Client is not keeping up; count and move on. The audio
                // thread never blocks on a slow reader.
                self.overruns += 1;
                continue;
            }
            for c in 0..channels {
                let v: Sample = io.inputs[c.min(self.ninputs - 1)][s];
                let _ = tap.ring.push(v);
            }
        }
    }
}

impl Unit for Tap {
    fn process(
        &mut self,
        _ctx: &ProcessCtx,
        io: &mut UnitIo,
        _couts: &mut CoutQueue,
        offset: usize,
        frames: usize,
    ) {
        self.push_frames(io, offset, frames);
        if self.passthrough {
            for c in 0..self.ninputs {
                for s in offset..offset + frames {
                    if self.add {
                        io.outputs[c][s] += io.inputs[c][s];
                    } else {
                        io.outputs[c][s] = io.inputs[c][s];
                    }
                }
            }
        }
    }

    fn set_register(&mut self, _reg: usize, _value: f32, _start: u32, _dur: u32, _wctx: &WriteCtx) {}

    fn attach_sink(&mut self, tap: SinkTap) -> Result<(), SinkTap> {
        self.tap = Some(tap);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::SharedDsp;
    use crate::wave::WaveTable;
    use vox_core::HostAlloc;

    fn make(insert: bool) -> Box<dyn Unit> {
        let shared = SharedDsp::new(48000);
        let ctx = UnitCtx {
            samplerate: 48000,
            ninputs: if insert { 1 } else { 2 },
            noutputs: if insert { 1 } else { 0 },
            add: false,
            shared: &shared,
            alloc: &HostAlloc,
            cout_wiring: &[],
        };
        if insert {
            Tap::create_insert(&ctx).unwrap()
        } else {
            Tap::create_sink(&ctx).unwrap()
        }
    }

    #[test]
    fn test_sink_delivers_frames() {
        let mut tap = make(false);
        let (prod, mut cons) = rtrb::RingBuffer::new(1024);
        assert!(
            tap.attach_sink(SinkTap {
                ring: prod,
                channels: 2,
            })
            .is_ok()
        );

        let in0 = [0.5f32; 8];
        let in1 = [-0.5f32; 8];
        let mut io = UnitIo {
            inputs: [&in0, &in1],
            outputs: [&mut [], &mut []],
            ninputs: 2,
            noutputs: 0,
        };
        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();
        tap.process(&ctx, &mut io, &mut couts, 0, 8);

        // 8 interleaved stereo frames
        assert_eq!(cons.slots(), 16);
        assert_eq!(cons.pop().unwrap(), 0.5);
        assert_eq!(cons.pop().unwrap(), -0.5);
    }

    #[test]
    fn test_insert_passes_through() {
        let mut tap = make(true);
        let inp = [0.25f32; 8];
        let mut out = [0.0f32; 8];
        let mut io = UnitIo {
            inputs: [&inp, &[]],
            outputs: [&mut out, &mut []],
            ninputs: 1,
            noutputs: 1,
        };
        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();
        tap.process(&ctx, &mut io, &mut couts, 0, 8);
        assert_eq!(out, inp);
    }

    #[test]
    fn test_full_ring_never_blocks() {
        let mut tap = make(false);
        let (prod, _cons) = rtrb::RingBuffer::new(4);
        assert!(
            tap.attach_sink(SinkTap {
                ring: prod,
                channels: 2,
            })
            .is_ok()
        );

        let in0 = [1.0f32; 64];
        let in1 = [1.0f32; 64];
        let mut io = UnitIo {
            inputs: [&in0, &in1],
            outputs: [&mut [], &mut []],
            ninputs: 2,
            noutputs: 0,
        };
        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let mut couts = CoutQueue::default();
        // Must complete despite the tiny ring
        tap.process(&ctx, &mut io, &mut couts, 0, 64);
    }
}
