//! The per-voice virtual machine
//!
//! Register-based, 16.16 fixed point, with timing instructions that yield
//! until a future timestamp. Each voice is effectively a coroutine: an
//! explicit program counter plus a wait-until timestamp, resumable
//! deterministically in buffer-sized slices. Unit register writes carry
//! the sub-sample offset of the VM's current time inside the processing
//! fragment, which is how sample-accurate parameter changes survive
//! block processing.

use rand::Rng;
use rand::rngs::SmallRng;

use vox_core::{Fx, Timestamp, VoxError, VoxResult};

use crate::program::{
    EntryPoint, Insn, MAX_ARGS, MAX_CALL_DEPTH, Program, R_TRANSPOSE, VM_REGS,
};

/// Instruction budget per voice per buffer; exceeding it faults the voice
/// with `Overload`
pub const VM_BUDGET: u32 = 10_000;

// ═══════════════════════════════════════════════════════════════════════════
// ARGUMENTS AND MESSAGES
// ═══════════════════════════════════════════════════════════════════════════

/// Fixed-capacity argument list (wire format: 16.16 fixed point)
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgVec {
    vals: [Fx; MAX_ARGS],
    len: u8,
}

impl ArgVec {
    pub fn new(args: &[Fx]) -> Self {
        let mut vals = [Fx::ZERO; MAX_ARGS];
        let len = args.len().min(MAX_ARGS);
        vals[..len].copy_from_slice(&args[..len]);
        Self {
            vals,
            len: len as u8,
        }
    }

    pub fn from_f32(args: &[f32]) -> Self {
        let mut vals = [Fx::ZERO; MAX_ARGS];
        let len = args.len().min(MAX_ARGS);
        for (v, a) in vals.iter_mut().zip(args) {
            *v = Fx::from_f32(*a);
        }
        Self {
            vals,
            len: len as u8,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[Fx] {
        &self.vals[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A message queued to a voice entry point
#[derive(Debug, Clone, Copy)]
pub struct VoiceMessage {
    pub ep: u8,
    pub args: ArgVec,
    pub when: Timestamp,
}

// ═══════════════════════════════════════════════════════════════════════════
// VM STATE
// ═══════════════════════════════════════════════════════════════════════════

/// What the VM is doing between slices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Runnable once engine time reaches `wait_until`
    Waiting,
    /// Yielded indefinitely; a message wakes it
    Sleeping,
    /// Program terminated
    Ended,
}

/// Side effects a VM slice requests from the voice graph
#[derive(Debug, Clone, Copy)]
pub enum VmAction {
    Spawn {
        /// Local subvoice slot, or `None` for a detached spawn
        slot: Option<u8>,
        prg: u8,
        args: ArgVec,
    },
    SendSub {
        slot: u8,
        ep: u8,
        args: ArgVec,
    },
    SendAll {
        ep: u8,
        args: ArgVec,
    },
    KillSub {
        slot: u8,
    },
    KillAll,
    Wake {
        slot: u8,
        force: bool,
    },
}

/// Receiver for unit control register writes issued by the VM
pub trait UnitRegs {
    fn write(
        &mut self,
        unit: usize,
        reg: usize,
        value: f32,
        start: u32,
        dur: u32,
        transpose: f32,
    ) -> VoxResult<()>;
}

/// Per-voice VM execution context
pub struct VmState {
    pub regs: [Fx; VM_REGS],
    pub pc: usize,
    /// Absolute engine time this VM next runs at
    pub wait_until: Timestamp,
    pub state: RunState,
    /// Instruction budget remaining this buffer
    pub budget: u32,
    callstack: [u16; MAX_CALL_DEPTH],
    sp: usize,
    /// Saved (pc, state, wait_until) frames for message handler
    /// interrupts
    resume: Vec<(usize, RunState, Timestamp)>,
}

impl VmState {
    pub fn new() -> Self {
        Self {
            regs: [Fx::ZERO; VM_REGS],
            pc: 0,
            wait_until: Timestamp::ZERO,
            state: RunState::Ended,
            budget: VM_BUDGET,
            callstack: [0; MAX_CALL_DEPTH],
            sp: 0,
            resume: Vec::with_capacity(2),
        }
    }

    /// Start executing an entry point at `when`
    pub fn enter(&mut self, ep: EntryPoint, args: &ArgVec, when: Timestamp) {
        for (i, &a) in args.as_slice().iter().enumerate().take(ep.argc) {
            self.regs[ep.argv + i] = a;
        }
        self.pc = ep.pc;
        self.state = RunState::Waiting;
        self.wait_until = when;
    }

    /// Interrupt the program to run a message handler.
    ///
    /// The current position is saved and restored when the handler
    /// returns; a handler may itself yield, which postpones the main
    /// program the same way.
    pub fn interrupt(&mut self, ep: EntryPoint, args: &ArgVec, when: Timestamp) {
        self.resume.push((self.pc, self.state, self.wait_until));
        for (i, &a) in args.as_slice().iter().enumerate().take(ep.argc) {
            self.regs[ep.argv + i] = a;
        }
        self.pc = ep.pc;
        self.state = RunState::Waiting;
        self.wait_until = when;
    }

    #[inline]
    pub fn transpose(&self) -> f32 {
        self.regs[R_TRANSPOSE].to_f32()
    }

    #[inline]
    pub fn runnable_at(&self, now: Timestamp) -> bool {
        self.state == RunState::Waiting && self.wait_until.diff(now) <= 0
    }
}

impl Default for VmState {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EXECUTION
// ═══════════════════════════════════════════════════════════════════════════

/// Run the VM until it yields, ends, or faults.
///
/// `frag_start` anchors unit write start offsets: a write issued at
/// `wait_until` lands `diff(wait_until, frag_start)` sub-frames into the
/// fragment being processed. `budget` is shared across one buffer; it
/// running out faults the voice with `Overload`.
pub fn run_slice(
    vm: &mut VmState,
    program: &Program,
    units: &mut dyn UnitRegs,
    actions: &mut Vec<VmAction>,
    rng: &mut SmallRng,
    budget: &mut u32,
    frag_start: Timestamp,
) -> VoxResult<()> {
    if vm.state != RunState::Waiting {
        return Ok(());
    }
    let start_offset = vm.wait_until.diff(frag_start).max(0) as u32;

    loop {
        if *budget == 0 {
            return Err(VoxError::Overload);
        }
        *budget -= 1;

        let pc = vm.pc;
        let insn = *program.code.get(pc).ok_or(VoxError::IllegalOp)?;
        vm.pc += 1;

        match insn {
            Insn::LoadImm { r, v } => vm.regs[r as usize] = v,
            Insn::Move { r, s } => vm.regs[r as usize] = vm.regs[s as usize],
            Insn::Add { r, s } => {
                vm.regs[r as usize] = vm.regs[r as usize] + vm.regs[s as usize];
            }
            Insn::Sub { r, s } => {
                vm.regs[r as usize] = vm.regs[r as usize] - vm.regs[s as usize];
            }
            Insn::Mul { r, s } => {
                vm.regs[r as usize] = vm.regs[r as usize].mul(vm.regs[s as usize])?;
            }
            Insn::Div { r, s } => {
                vm.regs[r as usize] = vm.regs[r as usize].div(vm.regs[s as usize])?;
            }
            Insn::Mod { r, s } => {
                vm.regs[r as usize] = vm.regs[r as usize].rem(vm.regs[s as usize])?;
            }
            Insn::Neg { r } => vm.regs[r as usize] = -vm.regs[r as usize],
            Insn::Rand { r, s } => {
                let max = vm.regs[s as usize].0;
                vm.regs[r as usize] = if max > 0 {
                    Fx(rng.random_range(0..max))
                } else {
                    Fx::ZERO
                };
            }

            Insn::Jump { pc: target } => {
                if target as usize == pc {
                    return Err(VoxError::InfLoop);
                }
                vm.pc = target as usize;
            }
            Insn::JumpZ { r, pc: target } => {
                if vm.regs[r as usize].is_zero() {
                    vm.pc = target as usize;
                }
            }
            Insn::JumpNz { r, pc: target } => {
                if !vm.regs[r as usize].is_zero() {
                    vm.pc = target as usize;
                }
            }
            Insn::JumpGe { r, s, pc: target } => {
                if vm.regs[r as usize] >= vm.regs[s as usize] {
                    vm.pc = target as usize;
                }
            }
            Insn::JumpLt { r, s, pc: target } => {
                if vm.regs[r as usize] < vm.regs[s as usize] {
                    vm.pc = target as usize;
                }
            }
            Insn::Call { func } => {
                if vm.sp >= MAX_CALL_DEPTH {
                    return Err(VoxError::OutOfRegs);
                }
                let target = *program.funcs.get(func as usize).ok_or(VoxError::IndexRange)?;
                vm.callstack[vm.sp] = vm.pc as u16;
                vm.sp += 1;
                vm.pc = target;
            }
            Insn::Return => {
                if vm.sp > 0 {
                    vm.sp -= 1;
                    vm.pc = vm.callstack[vm.sp] as usize;
                } else if let Some((pc, state, wait)) = vm.resume.pop() {
                    // Message handler done; resume the interrupted
                    // program on its original schedule
                    vm.pc = pc;
                    vm.state = state;
                    vm.wait_until = wait;
                    return Ok(());
                } else {
                    vm.state = RunState::Ended;
                    return Ok(());
                }
            }

            Insn::Write { unit, reg, s } => {
                units.write(
                    unit as usize,
                    reg as usize,
                    vm.regs[s as usize].to_f32(),
                    start_offset,
                    0,
                    vm.transpose(),
                )?;
            }
            Insn::Ramp { unit, reg, s, dur } => {
                let d = vm.regs[dur as usize];
                if d.0 < 0 {
                    return Err(VoxError::ValueRange);
                }
                // 16.16 frames to 24.8 sub-frames
                units.write(
                    unit as usize,
                    reg as usize,
                    vm.regs[s as usize].to_f32(),
                    start_offset,
                    (d.0 as u32) >> 8,
                    vm.transpose(),
                )?;
            }

            Insn::Spawn { slot, prg, argv, argc } => {
                actions.push(VmAction::Spawn {
                    slot: Some(slot),
                    prg,
                    args: ArgVec::new(&vm.regs[argv as usize..(argv + argc) as usize]),
                });
            }
            Insn::SpawnD { prg, argv, argc } => {
                actions.push(VmAction::Spawn {
                    slot: None,
                    prg,
                    args: ArgVec::new(&vm.regs[argv as usize..(argv + argc) as usize]),
                });
            }
            Insn::Send { slot, ep, argv, argc } => {
                actions.push(VmAction::SendSub {
                    slot,
                    ep,
                    args: ArgVec::new(&vm.regs[argv as usize..(argv + argc) as usize]),
                });
            }
            Insn::SendAll { ep, argv, argc } => {
                actions.push(VmAction::SendAll {
                    ep,
                    args: ArgVec::new(&vm.regs[argv as usize..(argv + argc) as usize]),
                });
            }
            Insn::Kill { slot } => actions.push(VmAction::KillSub { slot }),
            Insn::KillAll => actions.push(VmAction::KillAll),
            Insn::Wake { slot } => actions.push(VmAction::Wake { slot, force: false }),
            Insn::Force { slot } => actions.push(VmAction::Wake { slot, force: true }),

            Insn::Delay { d } => {
                if d.0 < 0 {
                    return Err(VoxError::ValueRange);
                }
                vm.wait_until = vm.wait_until.offset(d.0 >> 8);
                return Ok(());
            }
            Insn::DelayReg { s } => {
                let d = vm.regs[s as usize];
                if d.0 < 0 {
                    return Err(VoxError::ValueRange);
                }
                vm.wait_until = vm.wait_until.offset(d.0 >> 8);
                return Ok(());
            }
            Insn::Tick => {
                // Next whole-frame boundary
                let t = vm.wait_until.0;
                vm.wait_until = Timestamp((t & !0xff).wrapping_add(0x100));
                return Ok(());
            }
            Insn::Sleep => {
                vm.state = RunState::Sleeping;
                return Ok(());
            }
            Insn::End => {
                vm.state = RunState::Ended;
                return Ok(());
            }
        }
    }
}
