//! Voices: VM execution context plus an ordered unit chain
//!
//! A voice owns its VM state, a message inbox, an ordered chain of unit
//! instances, and the audio buses the chain runs over:
//!
//! - an input bus, where subvoices mix their output;
//! - two scratch banks, ping-ponged between chain stages so a unit's
//!   inputs never alias its outputs;
//! - an output accumulator, which the parent (or the engine, for the
//!   root) mixes upward after the chain has run.
//!
//! Voices form a tree; ids are generational so stale references from
//! in-flight commands can never reach a recycled slot.

use std::collections::VecDeque;
use std::sync::Arc;

use vox_core::{BufferPool, Handle, MAX_FRAG, RtAlloc, Sample, Timestamp, VoxError, VoxResult};
use vox_dsp::{
    CoutQueue, ProcessCtx, SharedDsp, Unit, UnitCtx, UnitDesc, UnitIo, WriteCtx,
};

use crate::program::{MAX_SUBSLOTS, OutputMode, Program};
use crate::vm::{ArgVec, RunState, UnitRegs, VmState, VoiceMessage};

/// Maximum voice tree depth
pub const VOICE_NEST_MAX: u32 = 32;

/// Per-voice inbox capacity; messages beyond this are dropped with a
/// logged error
pub const INBOX_CAP: usize = 32;

// ═══════════════════════════════════════════════════════════════════════════
// IDS
// ═══════════════════════════════════════════════════════════════════════════

/// Generational voice reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId {
    pub index: u32,
    pub generation: u32,
}

// ═══════════════════════════════════════════════════════════════════════════
// UNIT SLOTS AND BUS WIRING
// ═══════════════════════════════════════════════════════════════════════════

/// Where a unit reads its audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufSrc {
    None,
    /// The voice input bus (subvoice mix)
    InputBus,
    /// Scratch bank A (false) or B (true)
    Scratch(bool),
}

/// Where a unit writes its audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufDst {
    None,
    Scratch(bool),
    /// The voice output accumulator
    VoiceOut,
}

/// One instantiated unit in the chain
pub struct UnitSlot {
    pub unit: Box<dyn Unit>,
    pub desc: &'static UnitDesc,
    pub ninputs: usize,
    pub noutputs: usize,
    src: BufSrc,
    dst: BufDst,
}

/// The audio buses backing one voice, assembled by the caller.
///
/// Command-started voices get freshly allocated buses on the API side;
/// VM-spawned subvoices draw recycled buffers from the engine's
/// realtime pool. Every buffer is `MAX_FRAG` frames.
pub struct VoiceBuses {
    pub input: Vec<Box<[Sample]>>,
    pub output: Vec<Box<[Sample]>>,
    pub scratch_a: Vec<Box<[Sample]>>,
    pub scratch_b: Vec<Box<[Sample]>>,
}

impl VoiceBuses {
    /// Allocate fresh buses through the system driver (API side)
    pub fn allocate(channels: usize, alloc: &dyn RtAlloc) -> Self {
        let bus = |n: usize| -> Vec<Box<[Sample]>> {
            (0..n).map(|_| alloc.alloc_samples(MAX_FRAG)).collect()
        };
        Self {
            input: bus(channels),
            output: bus(channels),
            scratch_a: bus(vox_dsp::MAX_UNIT_IO),
            scratch_b: bus(vox_dsp::MAX_UNIT_IO),
        }
    }

    /// Assemble buses from the realtime pool, falling back to the
    /// system driver only if the pool has run dry. Recycled buffers
    /// carry stale samples, so everything is zeroed here.
    pub fn from_pool(channels: usize, pool: &mut BufferPool, alloc: &dyn RtAlloc) -> Self {
        let mut bus = |n: usize| -> Vec<Box<[Sample]>> {
            (0..n)
                .map(|_| {
                    let mut b = pool
                        .take()
                        .unwrap_or_else(|| alloc.alloc_samples(MAX_FRAG));
                    b.fill(0.0);
                    b
                })
                .collect()
        };
        Self {
            input: bus(channels),
            output: bus(channels),
            scratch_a: bus(vox_dsp::MAX_UNIT_IO),
            scratch_b: bus(vox_dsp::MAX_UNIT_IO),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// THE VOICE
// ═══════════════════════════════════════════════════════════════════════════

pub struct Voice {
    pub vm: VmState,
    pub program: Arc<Program>,
    pub units: Vec<UnitSlot>,
    pub inbox: VecDeque<VoiceMessage>,

    /// Local subvoice slots addressed by VM instructions
    pub subslots: [Option<VoiceId>; MAX_SUBSLOTS],
    /// All children, slot-addressed and detached alike
    pub children: Vec<VoiceId>,

    /// Attached handle, or -1 for detached voices
    pub handle: Handle,
    pub nest: u32,
    pub channels: usize,
    /// Subtree marked for teardown at the next fragment boundary
    pub killed: bool,
    /// Frames into the current fragment where this voice starts playing
    /// (nonzero right after a mid-fragment spawn)
    pub start_offset: usize,
    /// Consecutive output frames below the silence level
    pub silent_frames: u32,

    input_bus: Vec<Box<[Sample]>>,
    out_acc: Vec<Box<[Sample]>>,
    scratch_a: Vec<Box<[Sample]>>,
    scratch_b: Vec<Box<[Sample]>>,
    couts: CoutQueue,
}

impl Voice {
    /// Instantiate a voice for `program`, entering its main entry point
    /// at `when`. The caller supplies the audio buses; unit construction
    /// failures unwind cleanly.
    pub fn new(
        program: Arc<Program>,
        args: &ArgVec,
        when: Timestamp,
        channels: usize,
        handle: Handle,
        shared: &SharedDsp,
        alloc: &dyn RtAlloc,
        buses: VoiceBuses,
    ) -> VoxResult<Self> {
        let ep0 = program.entry(0)?;
        if args.len() > ep0.argc {
            return Err(VoxError::ManyArgs);
        }
        if program.chain.is_empty() {
            return Err(VoxError::NoUnits);
        }

        let units = build_chain(&program, channels, shared, alloc)?;

        let mut vm = VmState::new();
        vm.enter(ep0, args, when);

        Ok(Self {
            vm,
            program,
            units,
            inbox: VecDeque::with_capacity(INBOX_CAP),
            subslots: [None; MAX_SUBSLOTS],
            children: Vec::new(),
            handle,
            nest: 0,
            channels,
            killed: false,
            start_offset: 0,
            silent_frames: 0,
            input_bus: buses.input,
            out_acc: buses.output,
            scratch_a: buses.scratch_a,
            scratch_b: buses.scratch_b,
            couts: CoutQueue::with_capacity(16),
        })
    }

    /// Place the voice at a tree depth, bounding the nesting
    pub fn set_nest(&mut self, nest: u32) -> VoxResult<()> {
        if nest > VOICE_NEST_MAX {
            return Err(VoxError::VoiceNest);
        }
        self.nest = nest;
        Ok(())
    }

    /// Hand the voice's buses back to the realtime pool. Buffers the
    /// pool has no room for stay in place and leave with the voice when
    /// it is shipped to the API side for disposal.
    pub fn donate_buses(&mut self, pool: &mut BufferPool) {
        for bus in [
            &mut self.input_bus,
            &mut self.out_acc,
            &mut self.scratch_a,
            &mut self.scratch_b,
        ] {
            while let Some(b) = bus.pop() {
                if let Some(rejected) = pool.give(b) {
                    bus.push(rejected);
                    return;
                }
            }
        }
    }

    /// Queue a message; bounded, never blocks
    pub fn post(&mut self, msg: VoiceMessage) -> VoxResult<()> {
        if self.inbox.len() >= INBOX_CAP {
            return Err(VoxError::Overflow);
        }
        self.inbox.push_back(msg);
        Ok(())
    }

    /// Earliest queued message deadline
    pub fn next_message_at(&self) -> Option<Timestamp> {
        self.inbox.front().map(|m| m.when)
    }

    /// Zero the input bus span before children mix into it
    pub fn clear_input(&mut self, offset: usize, frames: usize) {
        for ch in &mut self.input_bus {
            ch[offset..offset + frames].fill(0.0);
        }
    }

    /// Add a child's output accumulator into this voice's input bus
    pub fn mix_child(&mut self, child_out: &[Box<[Sample]>], offset: usize, frames: usize) {
        for (dst, src) in self.input_bus.iter_mut().zip(child_out) {
            for s in offset..offset + frames {
                dst[s] += src[s];
            }
        }
    }

    #[inline]
    pub fn output(&self) -> &[Box<[Sample]>] {
        &self.out_acc
    }

    /// Run the unit chain over `[offset, offset + frames)`.
    ///
    /// Returns the peak absolute output level of the span, which drives
    /// silence-based auto-stop.
    pub fn process_units(&mut self, ctx: &ProcessCtx, offset: usize, frames: usize) -> Sample {
        // If nothing targets the output accumulator it stays as zeroed
        // at bus assembly; chains with a voice-out writer overwrite it.
        for i in 0..self.units.len() {
            // Raw views of the writable banks, taken before any borrows
            let a_ptr: *mut Vec<Box<[Sample]>> = &raw mut self.scratch_a;
            let b_ptr: *mut Vec<Box<[Sample]>> = &raw mut self.scratch_b;
            let o_ptr: *mut Vec<Box<[Sample]>> = &raw mut self.out_acc;

            let slot = &mut self.units[i];
            let ninputs = slot.ninputs;
            let noutputs = slot.noutputs;

            let ins: [&[Sample]; 2] = match slot.src {
                BufSrc::None => [&[], &[]],
                BufSrc::InputBus => bank_refs(&self.input_bus, ninputs),
                BufSrc::Scratch(false) => bank_refs(&self.scratch_a, ninputs),
                BufSrc::Scratch(true) => bank_refs(&self.scratch_b, ninputs),
            };
            // SAFETY: chain wiring guarantees the destination bank is
            // never the bank `ins` reads: scratch stages ping-pong
            // between banks A and B, the input bus is never a
            // destination, and the output accumulator is never a source.
            let outs: [&mut [Sample]; 2] = unsafe {
                match slot.dst {
                    BufDst::None => [&mut [], &mut []],
                    BufDst::Scratch(false) => bank_refs_mut(&mut *a_ptr, noutputs),
                    BufDst::Scratch(true) => bank_refs_mut(&mut *b_ptr, noutputs),
                    BufDst::VoiceOut => bank_refs_mut(&mut *o_ptr, noutputs),
                }
            };

            let mut io = UnitIo {
                inputs: ins,
                outputs: outs,
                ninputs,
                noutputs,
            };
            slot.unit.process(ctx, &mut io, &mut self.couts, offset, frames);

            // Apply control-output writes before the next unit runs
            let transpose = self.vm.transpose();
            for w in self.couts.drain() {
                if let Some(target) = self.units.get_mut(w.unit) {
                    target
                        .unit
                        .set_register(w.reg, w.value, w.start, w.dur, &WriteCtx { transpose });
                }
            }
        }

        let mut peak: Sample = 0.0;
        for ch in &self.out_acc {
            for &s in &ch[offset..offset + frames] {
                peak = peak.max(s.abs());
            }
        }
        peak
    }

    /// Hand a sink client ring to the first tap unit that accepts it
    pub fn attach_sink(&mut self, tap: vox_dsp::SinkTap) -> VoxResult<()> {
        let mut tap = tap;
        for slot in &mut self.units {
            match slot.unit.attach_sink(tap) {
                Ok(()) => return Ok(()),
                // Not a tap unit; it hands the ring back
                Err(t) => tap = t,
            }
        }
        Err(VoxError::NotFound)
    }

    /// True once the program has ended and every child is gone
    pub fn finished(&self) -> bool {
        self.vm.state == RunState::Ended && self.children.is_empty()
    }
}

/// Unit register write receiver over a voice's unit list
pub struct UnitWrites<'a> {
    pub units: &'a mut [UnitSlot],
}

impl UnitRegs for UnitWrites<'_> {
    fn write(
        &mut self,
        unit: usize,
        reg: usize,
        value: f32,
        start: u32,
        dur: u32,
        transpose: f32,
    ) -> VoxResult<()> {
        let slot = self.units.get_mut(unit).ok_or(VoxError::IndexRange)?;
        if reg >= slot.desc.registers.len() {
            return Err(VoxError::IndexRange);
        }
        slot.unit
            .set_register(reg, value, start, dur, &WriteCtx { transpose });
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CHAIN ASSEMBLY
// ═══════════════════════════════════════════════════════════════════════════

fn build_chain(
    program: &Program,
    channels: usize,
    shared: &SharedDsp,
    alloc: &dyn RtAlloc,
) -> VoxResult<Vec<UnitSlot>> {
    let mut units = Vec::with_capacity(program.chain.len());
    // (bank, channel count) of the scratch stage awaiting a consumer
    let mut pending: Option<(bool, usize)> = None;
    let mut have_voice_out = false;

    for cu in &program.chain {
        cu.desc.check_io(cu.ninputs, cu.noutputs)?;

        let src = if cu.ninputs == 0 {
            BufSrc::None
        } else {
            match pending.take() {
                None => {
                    if cu.ninputs > channels {
                        return Err(VoxError::FewChannels);
                    }
                    BufSrc::InputBus
                }
                Some((bank, count)) => {
                    if count != cu.ninputs {
                        return Err(VoxError::ChainMismatch);
                    }
                    BufSrc::Scratch(bank)
                }
            }
        };

        let (dst, add) = if cu.noutputs == 0 {
            (BufDst::None, false)
        } else {
            match cu.output {
                OutputMode::Chain => {
                    let bank = match src {
                        BufSrc::Scratch(b) => !b,
                        _ => false,
                    };
                    pending = Some((bank, cu.noutputs));
                    (BufDst::Scratch(bank), false)
                }
                OutputMode::VoiceOut => {
                    if cu.noutputs > channels {
                        return Err(VoxError::FewChannels);
                    }
                    let add = have_voice_out;
                    have_voice_out = true;
                    (BufDst::VoiceOut, add)
                }
            }
        };

        let ctx = UnitCtx {
            samplerate: shared.samplerate,
            ninputs: cu.ninputs,
            noutputs: cu.noutputs,
            add,
            shared,
            alloc,
            cout_wiring: &cu.cout_wiring,
        };
        let unit = (cu.desc.create)(&ctx).map_err(|e| {
            log::debug!("unit '{}' failed to initialize: {e}", cu.desc.name);
            if e == VoxError::OutOfMemory { e } else { VoxError::UnitInit }
        })?;
        units.push(UnitSlot {
            unit,
            desc: cu.desc,
            ninputs: cu.ninputs,
            noutputs: cu.noutputs,
            src,
            dst,
        });
    }
    if units.is_empty() {
        return Err(VoxError::NoUnits);
    }
    Ok(units)
}

#[inline]
fn bank_refs(bank: &[Box<[Sample]>], n: usize) -> [&[Sample]; 2] {
    match n {
        0 => [&[], &[]],
        1 => [&bank[0], &[]],
        _ => [&bank[0], &bank[1]],
    }
}

#[inline]
fn bank_refs_mut(bank: &mut [Box<[Sample]>], n: usize) -> [&mut [Sample]; 2] {
    match n {
        0 => [&mut [], &mut []],
        1 => {
            let (a, _) = bank.split_at_mut(1);
            [&mut a[0], &mut []]
        }
        _ => {
            let (a, b) = bank.split_at_mut(1);
            [&mut a[0], &mut b[0]]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Insn, OutputMode, ProgramBuilder, R_FIRST_FREE};
    use vox_core::HostAlloc;
    use vox_dsp::WaveTable;

    fn dc_step_program(value: f32) -> Arc<Program> {
        let mut b = ProgramBuilder::new();
        b.unit("dc", 0, 2, OutputMode::VoiceOut).unwrap();
        b.entry(0, 0, R_FIRST_FREE).unwrap();
        let r = R_FIRST_FREE as u8;
        b.op(Insn::LoadImm {
            r,
            v: vox_core::Fx::from_f32(0.0),
        })
        .unwrap();
        // mode = STEP
        b.op(Insn::Write { unit: 0, reg: 1, s: r }).unwrap();
        b.op(Insn::LoadImm {
            r,
            v: vox_core::Fx::from_f32(value),
        })
        .unwrap();
        b.op(Insn::Write { unit: 0, reg: 0, s: r }).unwrap();
        b.op(Insn::Sleep).unwrap();
        b.build(2).unwrap()
    }

    fn make_voice(program: Arc<Program>, args: &ArgVec) -> VoxResult<Voice> {
        let shared = SharedDsp::new(48000);
        Voice::new(
            program,
            args,
            Timestamp::ZERO,
            2,
            -1,
            &shared,
            &HostAlloc,
            VoiceBuses::allocate(2, &HostAlloc),
        )
    }

    #[test]
    fn test_voice_builds_and_processes() {
        let mut v = make_voice(dc_step_program(0.5), &ArgVec::default()).unwrap();

        // Drive the VM by hand the way the engine does
        let mut writes = UnitWrites {
            units: &mut v.units,
        };
        let mut actions = Vec::new();
        let mut rng = <rand::rngs::SmallRng as rand::SeedableRng>::seed_from_u64(1);
        let mut budget = crate::vm::VM_BUDGET;
        crate::vm::run_slice(
            &mut v.vm,
            &v.program.clone(),
            &mut writes,
            &mut actions,
            &mut rng,
            &mut budget,
            Timestamp::ZERO,
        )
        .unwrap();
        assert_eq!(v.vm.state, RunState::Sleeping);

        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        let peak = v.process_units(&ctx, 0, 32);
        assert!((peak - 0.5).abs() < 1e-6);
        assert!((v.output()[0][16] - 0.5).abs() < 1e-6);
        assert!((v.output()[1][16] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_nest_limit() {
        let mut v = make_voice(dc_step_program(0.1), &ArgVec::default()).unwrap();
        assert!(v.set_nest(VOICE_NEST_MAX).is_ok());
        assert_eq!(
            v.set_nest(VOICE_NEST_MAX + 1).err(),
            Some(VoxError::VoiceNest)
        );
    }

    #[test]
    fn test_too_many_args() {
        let err = make_voice(dc_step_program(0.1), &ArgVec::from_f32(&[1.0, 2.0])).err();
        assert_eq!(err, Some(VoxError::ManyArgs));
    }

    #[test]
    fn test_donated_buses_recycle_through_pool() {
        let mut v = make_voice(dc_step_program(0.1), &ArgVec::default()).unwrap();
        // 2 input + 2 output + 2 + 2 scratch buffers, pool has room for 6
        let mut pool = vox_core::BufferPool::new(6, vox_core::MAX_FRAG, &HostAlloc);
        while pool.take().is_some() {}
        v.donate_buses(&mut pool);
        assert_eq!(pool.available(), 6);

        // A fresh voice can be bused entirely from the pool
        let buses = VoiceBuses::from_pool(2, &mut pool, &HostAlloc);
        assert_eq!(pool.available(), 0);
        assert!(buses.input.iter().all(|b| b.iter().all(|&s| s == 0.0)));
    }

    #[test]
    fn test_inbox_bounded() {
        let mut v = make_voice(dc_step_program(0.1), &ArgVec::default()).unwrap();
        for _ in 0..INBOX_CAP {
            v.post(VoiceMessage {
                ep: 1,
                args: ArgVec::default(),
                when: Timestamp::ZERO,
            })
            .unwrap();
        }
        assert_eq!(
            v.post(VoiceMessage {
                ep: 1,
                args: ArgVec::default(),
                when: Timestamp::ZERO,
            })
            .err(),
            Some(VoxError::Overflow)
        );
    }

    #[test]
    fn test_two_stage_chain_wiring() {
        // dc -> waveshaper: scratch ping-pong, then voice out
        let mut b = ProgramBuilder::new();
        b.unit("dc", 0, 1, OutputMode::Chain).unwrap();
        b.unit("waveshaper", 1, 1, OutputMode::VoiceOut).unwrap();
        b.entry(0, 0, R_FIRST_FREE).unwrap();
        let r = R_FIRST_FREE as u8;
        b.op(Insn::LoadImm {
            r,
            v: vox_core::Fx::from_f32(0.25),
        })
        .unwrap();
        b.op(Insn::Write { unit: 0, reg: 0, s: r }).unwrap();
        b.op(Insn::Sleep).unwrap();
        let p = b.build(2).unwrap();

        let mut v = make_voice(p, &ArgVec::default()).unwrap();

        let mut writes = UnitWrites {
            units: &mut v.units,
        };
        let mut actions = Vec::new();
        let mut rng = <rand::rngs::SmallRng as rand::SeedableRng>::seed_from_u64(1);
        let mut budget = crate::vm::VM_BUDGET;
        crate::vm::run_slice(
            &mut v.vm,
            &v.program.clone(),
            &mut writes,
            &mut actions,
            &mut rng,
            &mut budget,
            Timestamp::ZERO,
        )
        .unwrap();

        let waves = WaveTable::new(0);
        let ctx = ProcessCtx { waves: &waves };
        v.process_units(&ctx, 0, 16);
        // dc's 0.25 passes through the identity waveshaper (amount 0)
        // after the dc value ramp converges
        let out = v.output()[0][15];
        assert!(out > 0.0 && out <= 0.25 + 1e-6, "got {out}");
    }
}
