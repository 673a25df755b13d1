//! Wavetable oscillator unit
//!
//! Plays mipmapped waves with 4-point Hermite interpolation, selecting the
//! mip level from the phase increment so one fragment never advances more
//! than the wave post-pad guarantees. Noise waves run a pitched
//! sample & hold RNG instead of reading sample data.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use vox_core::{Sample, VoxResult, pitch_to_hz};

use crate::ramper::Ramper;
use crate::unit::{
    CoutQueue, ProcessCtx, Unit, UnitCtx, UnitDesc, UnitFlags, UnitIo, WriteCtx,
};
use crate::wave::{MAX_PHINC, MipLevel, Wave, WaveType};

const R_WAVE: usize = 0;
const R_PITCH: usize = 1;
const R_AMPLITUDE: usize = 2;
const R_PHASE: usize = 3;

const DEFAULT_NOISE_SEED: u64 = 0x1234_5678_9abc_def0;

pub static WTOSC_DESC: UnitDesc = UnitDesc {
    name: "wtosc",
    flags: UnitFlags::NONE,
    registers: &["wave", "pitch", "amplitude", "phase"],
    coutputs: &[],
    constants: &[],
    min_inputs: 0,
    max_inputs: 0,
    min_outputs: 1,
    max_outputs: 1,
    create: WtOsc::create,
};

pub struct WtOsc {
    samplerate: u32,
    add: bool,

    /// Realtime wave table index, < 0 = none
    wave: i32,
    /// Linear pitch including voice transpose
    pitch: f32,
    amplitude: Ramper,
    /// Playback position in level-0 wave frames, 24.8
    phase: u64,
    /// Phase write awaiting wave resolution (fraction of a period)
    pending_phase: Option<f32>,
    /// One-shot wave ran off the end
    ended: bool,

    noise: SmallRng,
    noise_val: Sample,
    noise_acc: u32,
}

impl WtOsc {
    fn create(ctx: &UnitCtx) -> VoxResult<Box<dyn Unit>> {
        Ok(Box::new(Self {
            samplerate: ctx.samplerate,
            add: ctx.add,
            wave: -1,
            pitch: 0.0,
            amplitude: Ramper::new(1.0),
            phase: 0,
            pending_phase: None,
            ended: false,
            noise: SmallRng::seed_from_u64(DEFAULT_NOISE_SEED),
            noise_val: 0.0,
            noise_acc: 0,
        }))
    }

    /// Phase increment in level-0 wave frames per output frame, 24.8
    #[inline]
    fn phinc(&self, period: u32) -> u64 {
        let f = pitch_to_hz(self.pitch);
        (f as f64 * period as f64 * 256.0 / self.samplerate as f64) as u64
    }

    #[inline]
    fn silence(&self, io: &mut UnitIo, offset: usize, frames: usize) {
        if !self.add {
            io.outputs[0][offset..offset + frames].fill(0.0);
        }
    }

    fn process_noise(&mut self, io: &mut UnitIo, offset: usize, frames: usize, period: u32) {
        let phinc = self.phinc(period).min(u32::MAX as u64) as u32;
        self.amplitude.prepare(frames);
        for s in offset..offset + frames {
            self.noise_acc = self.noise_acc.wrapping_add(phinc);
            while self.noise_acc >= 256 {
                self.noise_acc -= 256;
                self.noise_val = self.noise.random::<Sample>() * 2.0 - 1.0;
            }
            let v = self.noise_val * self.amplitude.value;
            if self.add {
                io.outputs[0][s] += v;
            } else {
                io.outputs[0][s] = v;
            }
            self.amplitude.run(1);
        }
    }

    fn process_wave(&mut self, io: &mut UnitIo, offset: usize, frames: usize, wave: &Wave) {
        let size0 = wave.size();
        if size0 == 0 {
            self.silence(io, offset, frames);
            return;
        }
        if let Some(frac) = self.pending_phase.take() {
            self.phase = (frac as f64 * wave.period as f64 * 256.0).max(0.0) as u64;
            self.ended = false;
        }

        let span0 = (size0 as u64) << 8;
        if wave.looped() {
            self.phase %= span0;
        } else if self.ended || self.phase >= span0 {
            self.ended = true;
            self.silence(io, offset, frames);
            return;
        }

        // Select the mip level so the per-level increment stays inside the
        // pad guarantee
        let phinc0 = self.phinc(wave.period);
        let mut level = 0usize;
        while (phinc0 >> level) >= MAX_PHINC as u64 && level + 1 < wave.level_count() {
            level += 1;
        }
        let lv = wave.level(level).expect("selected mip level exists");
        let phinc_l = ((phinc0 >> level) as u32).min(MAX_PHINC);

        let mut ph = (self.phase >> level) as u32;
        let span_l = (lv.size() as u64) << 8;
        if wave.looped() && (ph as u64) >= span_l {
            ph = (ph as u64 % span_l) as u32;
        }

        self.amplitude.prepare(frames);
        for s in offset..offset + frames {
            let idx = (ph >> 8) as isize;
            let frac = (ph & 0xff) as f32 * (1.0 / 256.0);
            let v = hermite(lv, idx, frac) * self.amplitude.value;
            if self.add {
                io.outputs[0][s] += v;
            } else {
                io.outputs[0][s] = v;
            }
            ph += phinc_l;
            self.amplitude.run(1);
        }
        self.phase += phinc0 * frames as u64;
    }
}

/// 4-point, 3rd-order Hermite interpolation over padded wave data
#[inline]
fn hermite(lv: &MipLevel, idx: isize, t: f32) -> Sample {
    let xm1 = lv.sample(idx - 1) as f32;
    let x0 = lv.sample(idx) as f32;
    let x1 = lv.sample(idx + 1) as f32;
    let x2 = lv.sample(idx + 2) as f32;
    let c1 = 0.5 * (x1 - xm1);
    let c2 = xm1 - 2.5 * x0 + 2.0 * x1 - 0.5 * x2;
    let c3 = 0.5 * (x2 - xm1) + 1.5 * (x0 - x1);
    (((c3 * t + c2) * t + c1) * t + x0) * (1.0 / 32768.0)
}

impl Unit for WtOsc {
    fn process(
        &mut self,
        ctx: &ProcessCtx,
        io: &mut UnitIo,
        _couts: &mut CoutQueue,
        offset: usize,
        frames: usize,
    ) {
        let Some(wave) = ctx.waves.get(self.wave) else {
            self.silence(io, offset, frames);
            return;
        };
        let wave = wave.clone();
        match wave.wave_type {
            WaveType::Off => self.silence(io, offset, frames),
            WaveType::Noise => self.process_noise(io, offset, frames, wave.period),
            WaveType::Plain | WaveType::MipWave => {
                self.process_wave(io, offset, frames, &wave)
            }
        }
    }

    fn set_register(&mut self, reg: usize, value: f32, start: u32, dur: u32, wctx: &WriteCtx) {
        match reg {
            R_WAVE => {
                self.wave = value as i32;
                self.phase = 0;
                self.ended = false;
            }
            R_PITCH => self.pitch = value + wctx.transpose,
            R_AMPLITUDE => self.amplitude.set(value, start, dur),
            R_PHASE => {
                self.pending_phase = Some(value);
                self.ended = false;
            }
            _ => {}
        }
    }
}
