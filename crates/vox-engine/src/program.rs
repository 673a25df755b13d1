//! Compiled programs, banks, and the program builder
//!
//! A program is the unit of execution for a voice: a register-based
//! instruction list with multiple entry points (0 is main, 1..N are
//! message handlers), a function table, a subprogram table for spawning,
//! and a unit-chain descriptor that tells the voice assembler which DSP
//! units to instantiate and how to wire them.
//!
//! The script compiler that would emit these lives outside this engine;
//! programs are constructed through [`ProgramBuilder`], which performs the
//! same validation the compiler back-end would.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use vox_core::{Fx, Handle, VoxError, VoxResult};
use vox_dsp::{UnitDesc, find_unit};

// ═══════════════════════════════════════════════════════════════════════════
// VM LAYOUT CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Tick length register
pub const R_TICK: usize = 0;

/// Voice transpose register (linear pitch)
pub const R_TRANSPOSE: usize = 1;

/// First register available for locals and arguments
pub const R_FIRST_FREE: usize = 2;

/// VM register frame size
pub const VM_REGS: usize = 64;

/// Maximum arguments to an entry point
pub const MAX_ARGS: usize = 8;

/// Maximum entry points per program (0 = main, 1..15 = message handlers)
pub const MAX_EPS: usize = 16;

/// Entry point conventionally wired to MIDI input
pub const MIDI_EP: usize = 7;

/// Maximum local subvoice slots addressable by one voice
pub const MAX_SUBSLOTS: usize = 16;

/// Call stack depth
pub const MAX_CALL_DEPTH: usize = 8;

// ═══════════════════════════════════════════════════════════════════════════
// INSTRUCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// VM instructions
///
/// Registers are frame indices; `pc` operands are absolute instruction
/// indices. Values are 16.16 fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// regs[r] = v
    LoadImm { r: u8, v: Fx },
    /// regs[r] = regs[s]
    Move { r: u8, s: u8 },
    Add { r: u8, s: u8 },
    Sub { r: u8, s: u8 },
    Mul { r: u8, s: u8 },
    Div { r: u8, s: u8 },
    Mod { r: u8, s: u8 },
    Neg { r: u8 },
    /// regs[r] = uniform random in [0, regs[s])
    Rand { r: u8, s: u8 },

    Jump { pc: u16 },
    /// Jump if regs[r] == 0
    JumpZ { r: u8, pc: u16 },
    /// Jump if regs[r] != 0
    JumpNz { r: u8, pc: u16 },
    /// Jump if regs[r] >= regs[s]
    JumpGe { r: u8, s: u8, pc: u16 },
    /// Jump if regs[r] < regs[s]
    JumpLt { r: u8, s: u8, pc: u16 },
    Call { func: u8 },
    Return,

    /// Immediate control register write: unit[unit].reg = regs[s]
    Write { unit: u8, reg: u8, s: u8 },
    /// Ramped write: as Write, ramping over regs[dur] frames (16.16)
    Ramp { unit: u8, reg: u8, s: u8, dur: u8 },

    /// Start subprograms[prg] on local subvoice slot `slot`
    Spawn { slot: u8, prg: u8, argv: u8, argc: u8 },
    /// As Spawn, without a local slot (detached subvoice)
    SpawnD { prg: u8, argv: u8, argc: u8 },
    /// Send a message to entry point `ep` of the subvoice in `slot`
    Send { slot: u8, ep: u8, argv: u8, argc: u8 },
    /// Send a message to entry point `ep` of all subvoices
    SendAll { ep: u8, argv: u8, argc: u8 },
    /// Kill the subvoice in `slot`
    Kill { slot: u8 },
    /// Kill all subvoices
    KillAll,
    /// Bring a sleeping subvoice to the current time
    Wake { slot: u8 },
    /// As Wake, but also interrupts a pending delay
    Force { slot: u8 },

    /// Yield for `d` frames (16.16)
    Delay { d: Fx },
    /// Yield for regs[s] frames (16.16)
    DelayReg { s: u8 },
    /// Yield to the next whole-frame boundary
    Tick,
    /// Yield until a message arrives
    Sleep,
    /// Terminate the program
    End,
}

// ═══════════════════════════════════════════════════════════════════════════
// PROGRAM STRUCTURE
// ═══════════════════════════════════════════════════════════════════════════

/// One entry point: where to jump and where its arguments land
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub pc: usize,
    pub argc: usize,
    /// First register receiving arguments
    pub argv: usize,
}

/// Where a chain unit sends its audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Scratch, feeding the next unit in the chain
    Chain,
    /// The voice output bus (mixed into the parent)
    VoiceOut,
}

/// One unit in the minimum unit chain descriptor
pub struct ChainUnit {
    pub desc: &'static UnitDesc,
    pub ninputs: usize,
    pub noutputs: usize,
    pub output: OutputMode,
    /// Per control output: the (unit index, register index) it drives
    pub cout_wiring: Vec<Option<(usize, usize)>>,
}

/// A compiled program
pub struct Program {
    pub code: Vec<Insn>,
    pub entry_points: Vec<Option<EntryPoint>>,
    /// Function table for Call
    pub funcs: Vec<usize>,
    /// Programs this one can spawn
    pub subprograms: Vec<Arc<Program>>,
    pub chain: Vec<ChainUnit>,
    /// Registers actually used (frame size)
    pub nregs: usize,
}

impl Program {
    pub fn entry(&self, ep: usize) -> VoxResult<EntryPoint> {
        self.entry_points
            .get(ep)
            .copied()
            .flatten()
            .ok_or(VoxError::BadEntry)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BUILDER
// ═══════════════════════════════════════════════════════════════════════════

/// Assembles and validates a [`Program`]
pub struct ProgramBuilder {
    code: Vec<Insn>,
    entry_points: Vec<Option<EntryPoint>>,
    funcs: Vec<usize>,
    subprograms: Vec<Arc<Program>>,
    chain: Vec<ChainUnit>,
    nregs: usize,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            entry_points: vec![None; MAX_EPS],
            funcs: Vec::new(),
            subprograms: Vec::new(),
            chain: Vec::new(),
            nregs: R_FIRST_FREE,
        }
    }

    /// Append a unit to the chain descriptor
    pub fn unit(
        &mut self,
        name: &str,
        ninputs: usize,
        noutputs: usize,
        output: OutputMode,
    ) -> VoxResult<usize> {
        let desc = find_unit(name).ok_or(VoxError::NotFound)?;
        desc.check_io(ninputs, noutputs)?;
        self.chain.push(ChainUnit {
            desc,
            ninputs,
            noutputs,
            output,
            cout_wiring: vec![None; desc.coutputs.len()],
        });
        Ok(self.chain.len() - 1)
    }

    /// Wire a unit's control output to another unit's register
    pub fn wire_cout(
        &mut self,
        from_unit: usize,
        cout: usize,
        to_unit: usize,
        register: &str,
    ) -> VoxResult<()> {
        let reg = {
            let target = self.chain.get(to_unit).ok_or(VoxError::IndexRange)?;
            target
                .desc
                .register_index(register)
                .ok_or(VoxError::NotFound)?
        };
        let from = self.chain.get_mut(from_unit).ok_or(VoxError::IndexRange)?;
        let slot = from.cout_wiring.get_mut(cout).ok_or(VoxError::IndexRange)?;
        *slot = Some((to_unit, reg));
        Ok(())
    }

    /// Register a program this one can spawn; returns its table index
    pub fn subprogram(&mut self, program: Arc<Program>) -> u8 {
        self.subprograms.push(program);
        (self.subprograms.len() - 1) as u8
    }

    /// Declare an entry point starting at the next instruction
    pub fn entry(&mut self, ep: usize, argc: usize, argv: usize) -> VoxResult<()> {
        if ep >= MAX_EPS {
            return Err(VoxError::BadEntry);
        }
        if argc > MAX_ARGS {
            return Err(VoxError::ManyArgs);
        }
        self.touch_regs(argv + argc)?;
        self.entry_points[ep] = Some(EntryPoint {
            pc: self.code.len(),
            argc,
            argv,
        });
        Ok(())
    }

    /// Declare a function starting at the next instruction; returns its index
    pub fn func(&mut self) -> u8 {
        self.funcs.push(self.code.len());
        (self.funcs.len() - 1) as u8
    }

    /// Current instruction index (jump target for the next op)
    pub fn here(&self) -> u16 {
        self.code.len() as u16
    }

    /// Append one instruction
    pub fn op(&mut self, insn: Insn) -> VoxResult<&mut Self> {
        self.validate_regs(&insn)?;
        self.code.push(insn);
        Ok(self)
    }

    fn touch_regs(&mut self, top: usize) -> VoxResult<()> {
        if top > VM_REGS {
            return Err(VoxError::LargeFrame);
        }
        self.nregs = self.nregs.max(top);
        Ok(())
    }

    fn validate_regs(&mut self, insn: &Insn) -> VoxResult<()> {
        let regs: &[u8] = match insn {
            Insn::LoadImm { r, .. } | Insn::Neg { r } | Insn::JumpZ { r, .. }
            | Insn::JumpNz { r, .. } => std::slice::from_ref(r),
            Insn::Move { r, s }
            | Insn::Add { r, s }
            | Insn::Sub { r, s }
            | Insn::Mul { r, s }
            | Insn::Div { r, s }
            | Insn::Mod { r, s }
            | Insn::Rand { r, s } => return self.touch_pair(*r, *s),
            Insn::JumpGe { r, s, .. } | Insn::JumpLt { r, s, .. } => {
                return self.touch_pair(*r, *s);
            }
            Insn::Write { s, .. } => std::slice::from_ref(s),
            Insn::Ramp { s, dur, .. } => return self.touch_pair(*s, *dur),
            Insn::DelayReg { s } => std::slice::from_ref(s),
            Insn::Spawn { argv, argc, .. }
            | Insn::SpawnD { argv, argc, .. }
            | Insn::Send { argv, argc, .. }
            | Insn::SendAll { argv, argc, .. } => {
                if *argc as usize > MAX_ARGS {
                    return Err(VoxError::ManyArgs);
                }
                return self.touch_regs(*argv as usize + *argc as usize);
            }
            _ => &[],
        };
        for &r in regs {
            self.touch_regs(r as usize + 1)?;
        }
        Ok(())
    }

    fn touch_pair(&mut self, a: u8, b: u8) -> VoxResult<()> {
        self.touch_regs(a as usize + 1)?;
        self.touch_regs(b as usize + 1)
    }

    fn validate_chain(&self, channels: usize) -> VoxResult<()> {
        // Jump targets must land inside the program
        for insn in &self.code {
            let pc = match insn {
                Insn::Jump { pc }
                | Insn::JumpZ { pc, .. }
                | Insn::JumpNz { pc, .. }
                | Insn::JumpGe { pc, .. }
                | Insn::JumpLt { pc, .. } => *pc as usize,
                _ => continue,
            };
            if pc > self.code.len() {
                return Err(VoxError::IndexRange);
            }
        }

        // Unit references must stay inside the chain
        for insn in &self.code {
            if let Insn::Write { unit, reg, .. } | Insn::Ramp { unit, reg, .. } = insn {
                let cu = self
                    .chain
                    .get(*unit as usize)
                    .ok_or(VoxError::IndexRange)?;
                if *reg as usize >= cu.desc.registers.len() {
                    return Err(VoxError::IndexRange);
                }
            }
        }

        let mut prev_outputs: Option<(usize, usize)> = None; // (unit, count)
        let mut audible = false;
        for (i, cu) in self.chain.iter().enumerate() {
            if cu.ninputs > 0 {
                match prev_outputs.take() {
                    // First input-consuming unit reads the voice input bus
                    None => {
                        if cu.ninputs > channels {
                            return Err(VoxError::FewChannels);
                        }
                    }
                    Some((_, count)) => {
                        if count != cu.ninputs {
                            return Err(VoxError::ChainMismatch);
                        }
                    }
                }
            }
            if cu.noutputs > 0 {
                match cu.output {
                    OutputMode::VoiceOut => {
                        audible = true;
                        if cu.noutputs > channels {
                            return Err(VoxError::FewChannels);
                        }
                    }
                    OutputMode::Chain => {
                        if prev_outputs.is_some() {
                            // The previous scratch stage was never consumed
                            return Err(VoxError::BlindChain);
                        }
                        prev_outputs = Some((i, cu.noutputs));
                    }
                }
            }
        }
        if prev_outputs.is_some() {
            return Err(VoxError::BlindChain);
        }
        if !audible && self.chain.iter().any(|c| c.noutputs > 0) {
            return Err(VoxError::NoOutput);
        }
        Ok(())
    }

    /// Validate everything and produce the program.
    ///
    /// `channels` is the channel count the program will run under; the
    /// chain is validated against it.
    pub fn build(self, channels: usize) -> VoxResult<Arc<Program>> {
        if self.entry_points[0].is_none() {
            return Err(VoxError::BadEntry);
        }
        self.validate_chain(channels)?;
        Ok(Arc::new(Program {
            code: self.code,
            entry_points: self.entry_points,
            funcs: self.funcs,
            subprograms: self.subprograms,
            chain: self.chain,
            nregs: self.nregs,
        }))
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BUILT-IN PROGRAMS
// ═══════════════════════════════════════════════════════════════════════════

/// The group program: a panmix over the subvoice mix.
///
/// Runs on the root voice and on voices created by `new_group`. Message
/// handlers: entry point 1 ramps volume `(value, frames)`, entry point 2
/// ramps pan the same way.
pub fn group_program(channels: usize) -> VoxResult<Arc<Program>> {
    let n = channels.clamp(1, 2);
    let a = R_FIRST_FREE as u8;
    let mut b = ProgramBuilder::new();
    b.unit("panmix", n, n, OutputMode::VoiceOut)?;

    b.entry(0, 0, R_FIRST_FREE)?;
    let idle = b.here();
    b.op(Insn::Sleep)?;
    b.op(Insn::Jump { pc: idle })?;

    b.entry(1, 2, R_FIRST_FREE)?;
    b.op(Insn::Ramp {
        unit: 0,
        reg: 0,
        s: a,
        dur: a + 1,
    })?;
    b.op(Insn::Return)?;

    b.entry(2, 2, R_FIRST_FREE)?;
    b.op(Insn::Ramp {
        unit: 0,
        reg: 1,
        s: a,
        dur: a + 1,
    })?;
    b.op(Insn::Return)?;

    b.build(channels.max(1))
}

// ═══════════════════════════════════════════════════════════════════════════
// BANKS
// ═══════════════════════════════════════════════════════════════════════════

/// Named collection of exported objects
///
/// Banks map export names to handles: programs, waves, strings, constants
/// and nested banks. The bank retains a reference on every member; the
/// engine releases those references when the bank handle is destroyed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bank {
    pub name: String,
    exports: HashMap<String, Handle>,
}

impl Bank {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exports: HashMap::new(),
        }
    }

    /// Add an export. Fails if the name is already taken.
    pub fn export(&mut self, name: impl Into<String>, handle: Handle) -> VoxResult<()> {
        let name = name.into();
        if self.exports.contains_key(&name) {
            return Err(VoxError::IsAssigned);
        }
        self.exports.insert(name, handle);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Handle> {
        self.exports.get(name).copied()
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.exports.values().copied()
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_program() {
        let mut b = ProgramBuilder::new();
        b.unit("dc", 0, 1, OutputMode::VoiceOut).unwrap();
        b.entry(0, 0, R_FIRST_FREE).unwrap();
        b.op(Insn::End).unwrap();
        let p = b.build(2).unwrap();
        assert_eq!(p.chain.len(), 1);
        assert!(p.entry(0).is_ok());
        assert_eq!(p.entry(3), Err(VoxError::BadEntry));
    }

    #[test]
    fn test_missing_main_rejected() {
        let b = ProgramBuilder::new();
        assert_eq!(b.build(2).err(), Some(VoxError::BadEntry));
    }

    #[test]
    fn test_large_frame_rejected() {
        let mut b = ProgramBuilder::new();
        assert_eq!(
            b.op(Insn::LoadImm {
                r: VM_REGS as u8,
                v: Fx::ZERO
            })
            .err(),
            Some(VoxError::LargeFrame)
        );
    }

    #[test]
    fn test_many_args_rejected() {
        let mut b = ProgramBuilder::new();
        assert_eq!(
            b.entry(1, MAX_ARGS + 1, R_FIRST_FREE).err(),
            Some(VoxError::ManyArgs)
        );
    }

    #[test]
    fn test_chain_mismatch() {
        let mut b = ProgramBuilder::new();
        // dc makes 1 channel of scratch; panmix wants 2 in
        b.unit("dc", 0, 1, OutputMode::Chain).unwrap();
        b.unit("panmix", 2, 2, OutputMode::VoiceOut).unwrap();
        b.entry(0, 0, R_FIRST_FREE).unwrap();
        b.op(Insn::End).unwrap();
        assert_eq!(b.build(2).err(), Some(VoxError::ChainMismatch));
    }

    #[test]
    fn test_blind_chain() {
        let mut b = ProgramBuilder::new();
        // Scratch output with nothing downstream to read it
        b.unit("dc", 0, 1, OutputMode::Chain).unwrap();
        b.entry(0, 0, R_FIRST_FREE).unwrap();
        b.op(Insn::End).unwrap();
        assert_eq!(b.build(2).err(), Some(VoxError::BlindChain));
    }

    #[test]
    fn test_valid_two_stage_chain() {
        let mut b = ProgramBuilder::new();
        b.unit("dc", 0, 1, OutputMode::Chain).unwrap();
        b.unit("panmix", 1, 2, OutputMode::VoiceOut).unwrap();
        b.entry(0, 0, R_FIRST_FREE).unwrap();
        b.op(Insn::End).unwrap();
        assert!(b.build(2).is_ok());
    }

    #[test]
    fn test_cout_wiring() {
        let mut b = ProgramBuilder::new();
        let e = b.unit("env", 0, 0, OutputMode::Chain).unwrap();
        let d = b.unit("dc", 0, 1, OutputMode::VoiceOut).unwrap();
        b.wire_cout(e, 0, d, "value").unwrap();
        assert_eq!(b.chain[e].cout_wiring[0], Some((d, 0)));
        assert_eq!(
            b.wire_cout(e, 0, d, "nope").err(),
            Some(VoxError::NotFound)
        );
    }

    #[test]
    fn test_bank_exports() {
        let mut bank = Bank::new("sfx");
        bank.export("boom", 42).unwrap();
        assert_eq!(bank.find("boom"), Some(42));
        assert_eq!(bank.export("boom", 43).err(), Some(VoxError::IsAssigned));
        assert_eq!(bank.find("zap"), None);
    }
}
