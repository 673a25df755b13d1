//! Engine configuration, init flags and the property interface

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════
// INIT FLAGS
// ═══════════════════════════════════════════════════════════════════════════

/// Engine initialization flags (bit set)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitFlags(pub u32);

impl InitFlags {
    pub const NONE: Self = Self(0);
    /// Enable the timestamping API
    pub const TIMESTAMP: Self = Self(0x0000_0200);
    /// Disable driver autoconnect
    pub const NOAUTOCNX: Self = Self(0x0000_0400);
    /// Configure for realtime operation
    pub const REALTIME: Self = Self(0x0000_0800);
    /// No API context error logging
    pub const SILENT: Self = Self(0x0000_1000);
    /// No engine context error logging
    pub const RTSILENT: Self = Self(0x0000_2000);
    /// No bank sharing
    pub const NOSHARED: Self = Self(0x0000_4000);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for InitFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for InitFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Engine configuration
///
/// Pool sizes left at 0 are replaced with reasonable defaults when the
/// engine opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Audio sample rate (Hz)
    pub samplerate: u32,
    /// I/O buffer size (sample frames)
    pub buffer: u32,
    /// Number of audio channels
    pub channels: u32,
    /// Init and state flags
    pub flags: InitFlags,
    /// Initial voice pool size
    pub voicepool: u32,
    /// Initial event (message) pool size
    pub eventpool: u32,
    /// Initial scratch block pool size
    pub blockpool: u32,
    /// Timestamp jitter margin (ms)
    pub timestamp_margin_ms: f64,
    /// Max peak level considered silence
    pub silence_level: f32,
    /// Rolling window for silence detection (frames)
    pub silence_window: u32,
    /// Grace period before auto-stopping a silent voice (frames)
    pub silence_grace: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            samplerate: 48000,
            buffer: 1024,
            channels: 2,
            flags: InitFlags::NONE,
            voicepool: 0,
            eventpool: 0,
            blockpool: 0,
            timestamp_margin_ms: 10.0,
            silence_level: 1.0 / 16384.0,
            silence_window: 256,
            silence_grace: 4096,
        }
    }
}

impl Config {
    /// Fill unset pool sizes with defaults scaled to the buffer size
    pub fn with_pool_defaults(mut self) -> Self {
        if self.voicepool == 0 {
            self.voicepool = 256;
        }
        if self.eventpool == 0 {
            self.eventpool = 1024;
        }
        if self.blockpool == 0 {
            self.blockpool = 512;
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PROPERTIES
// ═══════════════════════════════════════════════════════════════════════════

/// Enumerated property IDs
///
/// Grouped in three ranges: general (per handle), state (global settings),
/// and statistics (published by the audio thread, read without blocking it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Property {
    // General (most objects)
    /// Number of channels
    Channels = 0x0001_0001,
    /// Object flags
    Flags,
    /// Reference count of the handle
    RefCount,
    /// Total size of the object (typically sample frames)
    Size,
    /// Current read or write position
    Position,

    // Global settings (state)
    /// Audio I/O sample rate
    SampleRate = 0x0002_0001,
    /// Audio I/O buffer size
    Buffer,
    /// Timestamp jitter margin delay (ms)
    TimestampMargin,
    /// Max peak level considered as silence (1/65536 units)
    SilenceLevel,
    /// Rolling window size for silence detection (frames)
    SilenceWindow,
    /// Grace period before considering silence (frames)
    SilenceGrace,
    /// VM `rand` instruction RNG seed
    RandSeed,
    /// Noise oscillator RNG seed
    NoiseSeed,

    // Statistics (state)
    /// Number of active voices
    ActiveVoices = 0x0003_0001,
    /// Peak number of active voices
    ActiveVoicesMax,
    /// Number of voices in the pool
    FreeVoices,
    /// Number of voices in total
    TotalVoices,
    /// VM instructions executed
    Instructions,
    /// Number of API messages received
    ApiMessages,
    /// Timestamp deadline margin; average (sub-frames)
    TsMarginAvg,
    /// Timestamp deadline margin; minimum (sub-frames)
    TsMarginMin,
    /// Timestamp deadline margin; maximum (sub-frames)
    TsMarginMax,
}
