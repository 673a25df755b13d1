//! Wave storage and preparation
//!
//! Waves are immutable-after-prepare mipmapped 16-bit sample buffers with
//! fixed pre/post pad regions sized for the oscillator interpolator kernel
//! and the maximum phase increment. The post pad guarantees that an
//! oscillator processing at most [`MAX_FRAG`](vox_core::MAX_FRAG) frames at
//! up to `MAX_PHINC/256` wave frames per output frame can never read out of
//! range without per-sample bound checks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use vox_core::{MAX_FRAG, Sample, VoxError, VoxResult};

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Number of waveform mipmap levels
pub const MIP_LEVELS: usize = 10;

/// Samples before data[0] needed by the interpolators
pub const INTERPRE: usize = 1;

/// Samples after data[size - 1] needed by the interpolators
pub const INTERPOST: usize = 2;

/// Maximum per-output-sample phase increment (24.8) that can be used
/// without end-of-wave checks inside a fragment
pub const MAX_PHINC: u32 = 512;

/// Pad samples before data[0] of any wave, any mip level
pub const WAVE_PRE: usize = INTERPRE;

/// Pad samples after data[size - 1] of any wave, any mip level
pub const WAVE_POST: usize = INTERPOST + ((MAX_FRAG * MAX_PHINC as usize + 255) >> 8) + 1;

/// Waveform period for full bandwidth down to a 20 Hz fundamental
pub const WAVE_PERIOD: usize = 2048;

/// Smallest mip level worth generating
const MIN_MIP_SIZE: usize = 4;

// ═══════════════════════════════════════════════════════════════════════════
// TYPES AND FLAGS
// ═══════════════════════════════════════════════════════════════════════════

/// Type of waveform data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaveType {
    /// Silence
    Off,
    /// Pitched sample & hold RNG
    Noise,
    /// Plain waveform (single level)
    Plain,
    /// Mipmapped waveform
    MipWave,
}

/// Wave preparation and playback flags (bit set)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveFlags(pub u32);

impl WaveFlags {
    pub const NONE: Self = Self(0);
    /// Waveform is looped
    pub const LOOPED: Self = Self(0x0000_0100);
    /// Normalize amplitude during preparation
    pub const NORMALIZE: Self = Self(0x0001_0000);
    /// Crossfade-mix a copy offset by half the loop length
    pub const XFADE: Self = Self(0x0004_0000);
    /// Mix with a reversed copy of itself
    pub const REVMIX: Self = Self(0x0008_0000);
    /// Ignore input data and generate a silent waveform
    pub const CLEAR: Self = Self(0x0010_0000);
    /// Not prepared - do not play
    pub const UNPREPARED: Self = Self(0x0100_0000);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for WaveFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Sample formats for wave uploading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    I8,
    I16,
    I24,
    I32,
    F32,
}

impl SampleFormat {
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I24 => 3,
            Self::I32 => 4,
            Self::F32 => 4,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WAVE DATA
// ═══════════════════════════════════════════════════════════════════════════

/// One mip level: a contiguous 16-bit buffer flanked by pad regions
#[derive(Debug, Clone)]
pub struct MipLevel {
    /// WAVE_PRE + size + WAVE_POST samples
    data: Box<[i16]>,
    size: usize,
}

impl MipLevel {
    /// Read a sample; `i` may range over `[-WAVE_PRE, size + WAVE_POST)`
    #[inline]
    pub fn sample(&self, i: isize) -> i16 {
        self.data[(i + WAVE_PRE as isize) as usize]
    }

    /// Size excluding pad regions
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Padded data; index 0 is the pre-pad sample
    #[inline]
    pub fn padded(&self) -> &[i16] {
        &self.data
    }
}

/// A prepared waveform with mipmaps
///
/// Once prepared, the level count and sizes are fixed and the buffers are
/// stable until the wave is dropped. Realtime code receives waves as
/// `Arc<Wave>` inside command payloads and never mutates them.
#[derive(Debug)]
pub struct Wave {
    pub wave_type: WaveType,
    pub flags: WaveFlags,
    /// Fundamental period length in frames (for pitch calculations)
    pub period: u32,
    levels: Vec<MipLevel>,
}

impl Wave {
    /// An "off" wave
    pub fn off() -> Self {
        Self {
            wave_type: WaveType::Off,
            flags: WaveFlags::NONE,
            period: WAVE_PERIOD as u32,
            levels: Vec::new(),
        }
    }

    /// A noise wave (no sample storage; the oscillator runs its RNG)
    pub fn noise(period: u32) -> Self {
        Self {
            wave_type: WaveType::Noise,
            flags: WaveFlags::NONE,
            period,
            levels: Vec::new(),
        }
    }

    /// Prepare a wave from raw sample data.
    ///
    /// `channels` is the interleave count (1..=8); channel 0 is kept.
    /// `period` 0 defaults to the frame count so pitch 0.0 plays the whole
    /// wave per fundamental period.
    pub fn prepare(
        wave_type: WaveType,
        period: u32,
        flags: WaveFlags,
        fmt: SampleFormat,
        channels: usize,
        data: &[u8],
    ) -> VoxResult<Self> {
        match wave_type {
            WaveType::Off => return Ok(Self::off()),
            WaveType::Noise => return Ok(Self::noise(period)),
            WaveType::Plain | WaveType::MipWave => {}
        }
        if channels == 0 || channels > 8 {
            return Err(VoxError::BadChannels);
        }

        let mut frames = decode(fmt, channels, data)?;
        if flags.contains(WaveFlags::CLEAR) {
            frames.iter_mut().for_each(|s| *s = 0.0);
        }
        transform(&mut frames, flags);

        let period = if period == 0 {
            frames.len() as u32
        } else {
            period
        };
        let levels = build_levels(&frames, wave_type, flags);
        log::debug!(
            "prepared {:?} wave: {} frames, period {}, {} mip levels",
            wave_type,
            frames.len(),
            period,
            levels.len()
        );
        Ok(Self {
            wave_type,
            flags,
            period,
            levels,
        })
    }

    /// Number of mip levels
    #[inline]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn level(&self, l: usize) -> Option<&MipLevel> {
        self.levels.get(l)
    }

    /// Size of the base level in frames
    #[inline]
    pub fn size(&self) -> usize {
        self.levels.first().map_or(0, |l| l.size)
    }

    #[inline]
    pub fn looped(&self) -> bool {
        self.flags.contains(WaveFlags::LOOPED)
    }

    /// Rewrite sample content starting at `offset` frames.
    ///
    /// The wave length is fixed; writing past the end fails with
    /// `IndexRange`. Mip levels and pad regions are regenerated. Results
    /// with NORMALIZE/XFADE/REVMIX flags after a rewrite are undefined;
    /// those transforms are applied to "write once" waves only.
    pub fn rewrite(&mut self, offset: usize, samples: &[Sample]) -> VoxResult<()> {
        let size = self.size();
        if offset + samples.len() > size {
            return Err(VoxError::IndexRange);
        }
        let base = self.levels.first().ok_or(VoxError::IndexRange)?;
        let mut frames: Vec<Sample> = (0..size)
            .map(|i| base.sample(i as isize) as Sample / 32768.0)
            .collect();
        frames[offset..offset + samples.len()].copy_from_slice(samples);
        self.levels = build_levels(&frames, self.wave_type, self.flags);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PREPARATION PIPELINE
// ═══════════════════════════════════════════════════════════════════════════

fn decode(fmt: SampleFormat, channels: usize, data: &[u8]) -> VoxResult<Vec<Sample>> {
    let stride = fmt.bytes() * channels;
    if stride == 0 {
        return Err(VoxError::BadChannels);
    }
    let nframes = data.len() / stride;
    let mut out = Vec::with_capacity(nframes);
    for f in 0..nframes {
        let p = f * stride;
        let v = match fmt {
            SampleFormat::I8 => data[p] as i8 as Sample / 128.0,
            SampleFormat::I16 => {
                i16::from_le_bytes([data[p], data[p + 1]]) as Sample / 32768.0
            }
            SampleFormat::I24 => {
                let raw = (data[p] as i32) | ((data[p + 1] as i32) << 8)
                    | ((data[p + 2] as i8 as i32) << 16);
                raw as Sample / 8_388_608.0
            }
            SampleFormat::I32 => {
                i32::from_le_bytes([data[p], data[p + 1], data[p + 2], data[p + 3]]) as Sample
                    / 2_147_483_648.0
            }
            SampleFormat::F32 => {
                Sample::from_le_bytes([data[p], data[p + 1], data[p + 2], data[p + 3]])
            }
        };
        out.push(v);
    }
    Ok(out)
}

fn transform(frames: &mut [Sample], flags: WaveFlags) {
    let n = frames.len();
    if n == 0 {
        return;
    }

    if flags.contains(WaveFlags::NORMALIZE) {
        let peak = frames.iter().fold(0.0 as Sample, |p, &s| p.max(s.abs()));
        if peak > 0.0 {
            let g = 1.0 / peak;
            frames.iter_mut().for_each(|s| *s *= g);
        }
    }

    if flags.contains(WaveFlags::XFADE) && n >= 2 {
        // Cross-mix with a copy shifted by half the loop length. The window
        // is fully the shifted copy at the seam, so the wrap point lands
        // where the shifted signal is continuous.
        let src = frames.to_vec();
        for (i, s) in frames.iter_mut().enumerate() {
            let w = 0.5 + 0.5 * (2.0 * std::f64::consts::PI * i as f64 / n as f64).cos() as Sample;
            let shifted = src[(i + n / 2) % n];
            *s = src[i] * (1.0 - w) + shifted * w;
        }
    }

    if flags.contains(WaveFlags::REVMIX) {
        let src = frames.to_vec();
        for (i, s) in frames.iter_mut().enumerate() {
            *s = (src[i] + src[n - 1 - i]) * std::f32::consts::FRAC_1_SQRT_2;
        }
    }
}

fn build_levels(frames: &[Sample], wave_type: WaveType, flags: WaveFlags) -> Vec<MipLevel> {
    let looped = flags.contains(WaveFlags::LOOPED);
    let mut levels = Vec::new();
    let mut cur: Vec<Sample> = frames.to_vec();
    loop {
        levels.push(pad_level(&cur, looped));
        if wave_type != WaveType::MipWave
            || levels.len() >= MIP_LEVELS
            || cur.len() / 2 < MIN_MIP_SIZE
        {
            break;
        }
        cur = decimate(&cur, looped);
    }
    levels
}

/// 2:1 lowpass/decimate with a 1-2-1 kernel
fn decimate(src: &[Sample], looped: bool) -> Vec<Sample> {
    let n = src.len();
    let half = n / 2;
    let mut out = Vec::with_capacity(half);
    for i in 0..half {
        let c = 2 * i;
        let prev = if c == 0 {
            if looped { src[n - 1] } else { src[0] }
        } else {
            src[c - 1]
        };
        let next = if c + 1 >= n {
            if looped { src[0] } else { src[n - 1] }
        } else {
            src[c + 1]
        };
        out.push(0.25 * prev + 0.5 * src[c] + 0.25 * next);
    }
    out
}

fn pad_level(frames: &[Sample], looped: bool) -> MipLevel {
    let size = frames.len();
    let mut data = vec![0i16; WAVE_PRE + size + WAVE_POST];
    for (i, &s) in frames.iter().enumerate() {
        data[WAVE_PRE + i] = quantize(s);
    }
    if looped && size > 0 {
        // Pre pad wraps from the tail, post pad from the head
        for i in 0..WAVE_PRE {
            data[i] = data[WAVE_PRE + size - WAVE_PRE + i];
        }
        for i in 0..WAVE_POST {
            data[WAVE_PRE + size + i] = data[WAVE_PRE + i % size];
        }
    }
    MipLevel {
        data: data.into_boxed_slice(),
        size,
    }
}

#[inline]
fn quantize(s: Sample) -> i16 {
    (s * 32767.0).round().clamp(-32768.0, 32767.0) as i16
}

// ═══════════════════════════════════════════════════════════════════════════
// REALTIME WAVE TABLE
// ═══════════════════════════════════════════════════════════════════════════

/// Slot table mapping handle indices to prepared waves.
///
/// Owned by the realtime side; entries arrive as `Arc<Wave>` inside
/// command payloads. Capacity is reserved at open so growth on the audio
/// thread stays exceptional.
pub struct WaveTable {
    slots: Vec<Option<Arc<Wave>>>,
}

impl WaveTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize(capacity, None);
        Self { slots }
    }

    pub fn set(&mut self, index: usize, wave: Option<Arc<Wave>>) -> Option<Arc<Wave>> {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        std::mem::replace(&mut self.slots[index], wave)
    }

    #[inline]
    pub fn get(&self, index: i32) -> Option<&Arc<Wave>> {
        if index < 0 {
            return None;
        }
        self.slots.get(index as usize)?.as_ref()
    }
}
