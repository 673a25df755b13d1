//! Envelope generator unit
//!
//! Drives one control output through piecewise shaped segments. Shapes are
//! read from process-wide lookup tables: a cosine spline, and a family of
//! "tapered" exponential curves that still hit both 0 and 1 exactly. The
//! `down` register selects an alternate shape for falling segments; LINK
//! inherits the upward mode.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use vox_core::VoxResult;

use crate::ramper::Ramper;
use crate::unit::{
    CoutQueue, CoutWrite, ProcessCtx, Unit, UnitCtx, UnitDesc, UnitFlags, UnitIo, WriteCtx,
};

const R_TARGET: usize = 0;
const R_MODE: usize = 1;
const R_DOWN: usize = 2;
const R_TIME: usize = 3;

// Ramp mode constants, exported to programs
pub const MODE_IEXP7: f32 = -8.0;
pub const MODE_SPLINE: f32 = -1.0;
pub const MODE_LINK: f32 = 0.0;
pub const MODE_LINEAR: f32 = 1.0;
pub const MODE_EXP1: f32 = 2.0;
pub const MODE_EXP7: f32 = 8.0;

pub static ENV_DESC: UnitDesc = UnitDesc {
    name: "env",
    flags: UnitFlags::NONE,
    registers: &["target", "mode", "down", "time"],
    coutputs: &["out"],
    constants: &[
        ("IEXP7", -8.0),
        ("IEXP6", -7.0),
        ("IEXP5", -6.0),
        ("IEXP4", -5.0),
        ("IEXP3", -4.0),
        ("IEXP2", -3.0),
        ("IEXP1", -2.0),
        ("SPLINE", -1.0),
        ("LINK", 0.0),
        ("LINEAR", 1.0),
        ("EXP1", 2.0),
        ("EXP2", 3.0),
        ("EXP3", 4.0),
        ("EXP4", 5.0),
        ("EXP5", 6.0),
        ("EXP6", 7.0),
        ("EXP7", 8.0),
    ],
    min_inputs: 0,
    max_inputs: 0,
    min_outputs: 0,
    max_outputs: 0,
    create: Env::create,
};

// ═══════════════════════════════════════════════════════════════════════════
// PROCESS-WIDE LOOKUP TABLES
// ═══════════════════════════════════════════════════════════════════════════

pub const LUT_SIZE: usize = 64;
const LUT_SPLINE: usize = 0;
const LUT_EXP1: usize = 1;
const LUT_COUNT: usize = 8;

/// Shared envelope curve tables
pub struct EnvLuts {
    luts: [[f32; LUT_SIZE + 2]; LUT_COUNT],
}

impl EnvLuts {
    fn build() -> Self {
        let mut luts = [[0.0f32; LUT_SIZE + 2]; LUT_COUNT];

        // Cosine spline table
        for (i, v) in luts[LUT_SPLINE].iter_mut().take(LUT_SIZE).enumerate() {
            *v = 0.5 - 0.5 * (i as f64 * std::f64::consts::PI / (LUT_SIZE - 1) as f64).cos() as f32;
        }

        // Tapered exponential curves, scaled and superimposed over linear
        // functions so they still "feel" exponential but hit both 0 and 1,
        // with slightly reduced dynamic range.
        const DEG: [f64; 7] = [1.0, 2.0, 3.0, 4.0, 6.0, 9.0, 13.0];
        for (j, &d) in DEG.iter().enumerate() {
            let c = 0.1f64.powf(d);
            let rc = 0.002 + 0.1 * 0.8f64.powf(d);
            for i in 0..LUT_SIZE {
                let x = 1.0 - i as f64 / LUT_SIZE as f64;
                let r = (1.0 - x) * rc;
                luts[LUT_EXP1 + j][i] = (c.powf(x) * (1.0 - r) + r - c * x) as f32;
            }
        }

        // The 1.0 points at the end of every LUT
        for lut in &mut luts {
            lut[LUT_SIZE] = 1.0;
            lut[LUT_SIZE + 1] = 1.0;
        }
        Self { luts }
    }

    #[inline]
    fn lut(&self, index: usize) -> &[f32; LUT_SIZE + 2] {
        &self.luts[index]
    }
}

static LUT_CACHE: Mutex<Weak<EnvLuts>> = Mutex::new(Weak::new());

/// Get the process-wide LUT bank, building it on first use.
///
/// The bank is shared across engine states and dropped with the last one;
/// construction is idempotent and thread-safe.
pub fn env_luts() -> Arc<EnvLuts> {
    let mut cache = LUT_CACHE.lock();
    if let Some(luts) = cache.upgrade() {
        return luts;
    }
    let luts = Arc::new(EnvLuts::build());
    *cache = Arc::downgrade(&luts);
    luts
}

// ═══════════════════════════════════════════════════════════════════════════
// THE UNIT
// ═══════════════════════════════════════════════════════════════════════════

pub struct Env {
    luts: Arc<EnvLuts>,
    ramper: Ramper,
    /// One ms in sample frames
    msdur: f32,

    /// Output transform for non-linear modes
    scale: f32,
    offset: f32,
    out: f32,

    /// Active LUT index while running a shaped segment
    lut: usize,
    running: bool,
    /// Immediate linear write queued by the target register
    pending: Option<(f32, u32, u32)>,

    // Plain value registers read by the target handler
    mode: f32,
    down: f32,
    time: f32,

    /// Control output wiring: (unit, register)
    wire: Option<(usize, usize)>,
}

impl Env {
    fn create(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        Ok(Box::new(Self {
            luts: ctx.shared.env_luts.clone(),
            ramper: Ramper::new(0.0),
            msdur: ctx.samplerate as f32 * 0.001,
            scale: 0.0,
            offset: 0.0,
            out: 0.0,
            lut: LUT_SPLINE,
            running: false,
            pending: None,
            mode: MODE_LINEAR,
            down: MODE_LINK,
            time: 0.0,
            wire: ctx.cout_wiring.first().copied().flatten(),
        }))
    }

    fn set_target(&mut self, v: f32, start: u32, mut dur: u32) {
        if self.wire.is_none() {
            return;
        }

        // Ramp duration override
        if self.time != 0.0 {
            dur = (self.time * self.msdur * 256.0) as u32;
        }

        let mode = if dur as i64 >= 256 - start as i64 {
            // Select direction
            let m = self.down.round() as i32;
            if v >= self.out || m == MODE_LINK as i32 {
                self.mode.round() as i32
            } else {
                m
            }
        } else {
            // Shortcut for zero duration ramps
            MODE_LINEAR as i32
        };

        let traverse = match mode {
            -1 => {
                self.lut = LUT_SPLINE;
                1 // forward
            }
            2..=8 => {
                self.lut = LUT_EXP1 + (mode - 2) as usize;
                mode
            }
            -8..=-2 => {
                self.lut = LUT_EXP1 + (-mode - 2) as usize;
                mode
            }
            _ => {
                // LINEAR, LINK with nothing to link to, and anything else:
                // hand the segment straight to the control output
                self.out = v;
                self.running = false;
                self.pending = Some((v, start, dur));
                return;
            }
        };

        let (rstart, rend);
        if traverse >= 0 {
            rstart = 0.0;
            rend = 1.0;
            self.scale = v - self.out;
            self.offset = self.out;
        } else {
            rstart = 1.0;
            rend = 0.0;
            self.scale = self.out - v;
            self.offset = self.out - self.scale;
        }

        // Unity ramp; the output transform happens per block
        self.ramper.value = rstart;
        self.ramper.set(rend, start, dur);
        self.running = true;
    }
}

impl Unit for Env {
    fn process(
        &mut self,
        _ctx: &ProcessCtx,
        _io: &mut UnitIo,
        couts: &mut CoutQueue,
        _offset: usize,
        frames: usize,
    ) {
        let Some((unit, reg)) = self.wire else {
            return;
        };
        if let Some((value, start, dur)) = self.pending.take() {
            couts.push(CoutWrite {
                unit,
                reg,
                value,
                start,
                dur,
            });
        }
        if !self.running {
            return;
        }

        let r = &mut self.ramper;
        r.prepare(frames);
        r.run(frames);
        let x = r.value.clamp(0.0, 1.0) * LUT_SIZE as f32;
        let i = x as usize;
        let f = x - i as f32;
        let t = self.luts.lut(self.lut);
        self.out = (f * t[i + 1] + (1.0 - f) * t[i]) * self.scale + self.offset;
        couts.push(CoutWrite {
            unit,
            reg,
            value: self.out,
            start: 0,
            dur: (frames as u32) << 8,
        });
        if r.delta == 0.0 && !r.is_running() {
            self.running = false;
        }
    }

    fn set_register(&mut self, reg: usize, value: f32, start: u32, dur: u32, _wctx: &WriteCtx) {
        match reg {
            R_TARGET => self.set_target(value, start, dur),
            R_MODE => self.mode = value,
            R_DOWN => self.down = value,
            R_TIME => self.time = value,
            _ => {}
        }
    }
}
