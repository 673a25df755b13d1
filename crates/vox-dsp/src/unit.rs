//! Unit framework
//!
//! A unit is a DSP block instantiated into a voice's processing chain.
//! Unit classes are described by static [`UnitDesc`] tables (name, io
//! bounds, control registers, control outputs, named constants, and a
//! constructor); instances are trait objects resolved through one indirect
//! call per Process pass, never per sample.

use std::sync::Arc;

use vox_core::{RtAlloc, Sample, VoxError, VoxResult};

use crate::units::env::EnvLuts;
use crate::wave::WaveTable;

/// Maximum audio inputs or outputs per unit
pub const MAX_UNIT_IO: usize = 2;

// ═══════════════════════════════════════════════════════════════════════════
// DESCRIPTORS
// ═══════════════════════════════════════════════════════════════════════════

/// Unit class flags (bit set)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitFlags(pub u32);

impl UnitFlags {
    pub const NONE: Self = Self(0);
    /// Instance input count must equal output count
    pub const MATCHIO: Self = Self(0x0000_0001);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Static unit class descriptor
pub struct UnitDesc {
    pub name: &'static str,
    pub flags: UnitFlags,
    /// Control register names, in register index order
    pub registers: &'static [&'static str],
    /// Control output names, in output index order
    pub coutputs: &'static [&'static str],
    /// Named constants exported to programs
    pub constants: &'static [(&'static str, f32)],
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub min_outputs: usize,
    pub max_outputs: usize,
    /// Instance constructor
    pub create: fn(&UnitCtx) -> VoxResult<Box<dyn Unit>>,
}

impl UnitDesc {
    /// Look up a control register index by name
    pub fn register_index(&self, name: &str) -> Option<usize> {
        self.registers.iter().position(|r| *r == name)
    }

    /// Validate an instance io configuration against the class bounds
    pub fn check_io(&self, ninputs: usize, noutputs: usize) -> VoxResult<()> {
        if self.flags.contains(UnitFlags::MATCHIO) && ninputs != noutputs {
            return Err(VoxError::IoDontMatch);
        }
        if ninputs < self.min_inputs || ninputs > self.max_inputs {
            return Err(VoxError::ChainMismatch);
        }
        if noutputs < self.min_outputs || noutputs > self.max_outputs {
            return Err(VoxError::ChainMismatch);
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// INSTANCE CONTEXTS
// ═══════════════════════════════════════════════════════════════════════════

/// Per-engine shared DSP state handed to unit constructors
pub struct SharedDsp {
    pub samplerate: u32,
    /// Process-wide envelope LUT bank (shared across engine states)
    pub env_luts: Arc<EnvLuts>,
}

impl SharedDsp {
    pub fn new(samplerate: u32) -> Self {
        Self {
            samplerate,
            env_luts: crate::units::env::env_luts(),
        }
    }
}

/// Construction context for one unit instance
pub struct UnitCtx<'a> {
    pub samplerate: u32,
    pub ninputs: usize,
    pub noutputs: usize,
    /// Accumulate into outputs instead of overwriting them
    pub add: bool,
    pub shared: &'a SharedDsp,
    /// Realtime allocation contract for units that pre-allocate buffers
    pub alloc: &'a dyn RtAlloc,
    /// Control output wiring: per cout index, the (unit, register) target
    pub cout_wiring: &'a [Option<(usize, usize)>],
}

/// Resolved audio buffers for one Process pass
///
/// Unused slots hold empty slices. A unit touches only samples
/// `[offset, offset + frames)` of its declared buffers.
pub struct UnitIo<'a> {
    pub inputs: [&'a [Sample]; MAX_UNIT_IO],
    pub outputs: [&'a mut [Sample]; MAX_UNIT_IO],
    pub ninputs: usize,
    pub noutputs: usize,
}

/// Read-only realtime context for Process passes
pub struct ProcessCtx<'a> {
    pub waves: &'a WaveTable,
}

/// Extra state visible to register write handlers
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteCtx {
    /// The writing voice's transpose register (linear pitch)
    pub transpose: f32,
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTROL OUTPUTS
// ═══════════════════════════════════════════════════════════════════════════

/// One pending control-output write
#[derive(Debug, Clone, Copy)]
pub struct CoutWrite {
    pub unit: usize,
    pub reg: usize,
    pub value: f32,
    pub start: u32,
    pub dur: u32,
}

/// Control-output writes collected during a Process pass and applied by
/// the voice loop between units
#[derive(Default)]
pub struct CoutQueue {
    writes: Vec<CoutWrite>,
}

impl CoutQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            writes: Vec::with_capacity(cap),
        }
    }

    #[inline]
    pub fn push(&mut self, w: CoutWrite) {
        self.writes.push(w);
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, CoutWrite> {
        self.writes.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SINK TAPS
// ═══════════════════════════════════════════════════════════════════════════

/// Producer half of a sink client's frame ring, attached to a tap unit
pub struct SinkTap {
    /// Interleaved frames, `channels` samples each
    pub ring: rtrb::Producer<Sample>,
    pub channels: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// THE UNIT TRAIT
// ═══════════════════════════════════════════════════════════════════════════

/// A DSP block instance
pub trait Unit: Send {
    /// Produce/consume audio for `[offset, offset + frames)`
    fn process(
        &mut self,
        ctx: &ProcessCtx,
        io: &mut UnitIo,
        couts: &mut CoutQueue,
        offset: usize,
        frames: usize,
    );

    /// Write a control register: snapshot the value or hand it to a
    /// ramper, depending on the register
    fn set_register(&mut self, reg: usize, value: f32, start: u32, dur: u32, wctx: &WriteCtx);

    /// Attach a sink client ring. Only tap units accept this; everything
    /// else hands the tap back so the caller can try the next unit.
    fn attach_sink(&mut self, tap: SinkTap) -> Result<(), SinkTap> {
        Err(tap)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CLASS REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

/// All built-in unit classes
pub fn builtin_units() -> &'static [&'static UnitDesc] {
    static UNITS: &[&UnitDesc] = &[
        &crate::units::wtosc::WTOSC_DESC,
        &crate::units::panmix::PANMIX_DESC,
        &crate::units::env::ENV_DESC,
        &crate::units::dc::DC_DESC,
        &crate::units::dcblock::DCBLOCK_DESC,
        &crate::units::fbdelay::FBDELAY_DESC,
        &crate::units::limiter::LIMITER_DESC,
        &crate::units::waveshaper::WAVESHAPER_DESC,
        &crate::units::xsink::XSINK_DESC,
        &crate::units::xsink::XINSERT_DESC,
    ];
    UNITS
}

/// Find a built-in unit class by name
pub fn find_unit(name: &str) -> Option<&'static UnitDesc> {
    builtin_units().iter().copied().find(|d| d.name == name)
}
