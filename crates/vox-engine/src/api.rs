//! The client-facing engine interface
//!
//! [`Engine`] lives on the API thread. It owns the handle registry, the
//! API end of the SPSC queue pair, the audio driver, and the API
//! timestamp state. Every externally visible object is named by a
//! handle; the audio thread only ever sees payloads passed to it inside
//! command messages, never the registry itself.
//!
//! Commands carry the current API timestamp as their deadline. With the
//! TIMESTAMP workflow, callers advance that clock with [`Engine::bump`]
//! and keep it converged to the engine clock via [`Engine::nudge`];
//! without it, [`Engine::reset_timestamp`] before a burst of calls gives
//! "as soon as possible with constant latency" behavior.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use vox_core::{
    Config, Destroy, Fx, Handle, HandleRegistry, InitFlags, Managed, Property, Sample, Timestamp,
    TypeTag, VoxError, VoxResult, ms_to_ts, ts_to_ms,
};
use vox_dsp::{SampleFormat, SharedDsp, SinkTap, Wave, WaveFlags, WaveType};

use vox_audio::{AudioDriver, MidiDriver, SysAlloc, new_audio_driver, new_system_driver};

use crate::messages::{ApiCmd, ApiMessage, ApiSide, Disposable, EngineResponse, queue_pair};
use crate::program::{Bank, Program, group_program};
use crate::state::{EngineStats, Processor};
use crate::vm::ArgVec;
use crate::voice::{Voice, VoiceBuses};

// ═══════════════════════════════════════════════════════════════════════════
// REGISTRY OBJECTS
// ═══════════════════════════════════════════════════════════════════════════

/// Consumer half of a sink client ring
pub struct SinkClient {
    ring: rtrb::Consumer<Sample>,
    pub channels: usize,
}

impl SinkClient {
    /// Pull interleaved frames captured by the tap unit
    pub fn read(&mut self, out: &mut [Sample]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.ring.pop() {
                Ok(s) => {
                    out[n] = s;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }

    pub fn available(&self) -> usize {
        self.ring.slots()
    }
}

/// Registry payloads for every handle type
pub enum Object {
    Bank(Bank),
    Wave(Arc<Wave>),
    Program(Arc<Program>),
    UnitClass(&'static vox_dsp::UnitDesc),
    Constant(Fx),
    Str(String),
    SinkClient(SinkClient),
    /// Voice created but not yet observed running
    NewVoice,
    /// Playing voice instance (the voice itself lives engine-side)
    Voice,
    /// Realtime side gone; participates only in refcount accounting
    Detached,
}

impl Managed for Object {
    fn type_tag(&self) -> TypeTag {
        match self {
            Object::Bank(_) => TypeTag::Bank,
            Object::Wave(_) => TypeTag::Wave,
            Object::Program(_) => TypeTag::Program,
            Object::UnitClass(_) => TypeTag::UnitClass,
            Object::Constant(_) => TypeTag::Constant,
            Object::Str(_) => TypeTag::String,
            Object::SinkClient(_) => TypeTag::SinkClient,
            Object::NewVoice => TypeTag::NewVoice,
            Object::Voice => TypeTag::Voice,
            Object::Detached => TypeTag::Detached,
        }
    }

    fn destroy(&mut self, _handle: Handle) -> Destroy {
        match self {
            // Live voices must drain through the engine first; the
            // release path flips them to detached and asks the engine
            Object::NewVoice | Object::Voice => Destroy::Refuse,
            _ => Destroy::Ok,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// THE ENGINE
// ═══════════════════════════════════════════════════════════════════════════

pub struct Engine {
    registry: HandleRegistry<Object>,
    api: ApiSide,
    config: Config,
    stats: Arc<EngineStats>,
    audio: Box<dyn AudioDriver>,
    /// API-side voice assembly: voices are built here and shipped to the
    /// audio thread ready to run
    shared_dsp: SharedDsp,
    alloc: SysAlloc,
    root: Handle,
    /// Current API timestamp for outgoing commands
    timestamp: Timestamp,
    /// Unapplied nudge, absorbed by subsequent bumps
    nudge: i32,
    /// Constant-latency offset for `now()`: buffer + jitter margin
    latency_sub: i32,
    /// Audio-thread errors drained from the response queue
    faults: Vec<(Handle, VoxError)>,
}

impl Engine {
    /// Open an engine with default drivers (dummy audio, null MIDI)
    pub fn open(config: Config) -> VoxResult<Self> {
        Self::open_with_drivers(config, None, None)
    }

    /// Open with explicit drivers; `None` falls back to the defaults
    /// rather than failing.
    pub fn open_with_drivers(
        config: Config,
        audio: Option<Box<dyn AudioDriver>>,
        midi: Option<Box<dyn MidiDriver>>,
    ) -> VoxResult<Self> {
        let config = config.with_pool_defaults();
        if config.channels == 0 || config.channels > 2 {
            return Err(VoxError::BadChannels);
        }
        if config.samplerate == 0 {
            return Err(VoxError::BadSampleRate);
        }

        let mut audio = match audio {
            Some(d) => d,
            None => new_audio_driver(None)?,
        };
        audio.open(config.samplerate, config.buffer, config.channels)?;
        let midi = match midi {
            Some(d) => Some(d),
            None => Some(vox_audio::new_midi_driver(None)?),
        };
        let system = new_system_driver(None)?;
        let alloc = SysAlloc(system);
        let shared_dsp = SharedDsp::new(config.samplerate);

        let (api, engine_side) = queue_pair(config.eventpool as usize);
        let stats = EngineStats::new();

        let mut registry = HandleRegistry::new();
        let root = registry.add(Object::Voice)?;

        let root_program = group_program(config.channels as usize)?;
        let mut processor = Processor::new(
            &config,
            engine_side,
            stats.clone(),
            alloc.clone(),
            root_program,
            root,
            midi,
        )?;
        audio.set_process(Box::new(move |buffers, frames| {
            processor.process(buffers, frames);
        }));

        let latency_sub =
            ((config.buffer as i32) << 8) + ms_to_ts(config.timestamp_margin_ms, config.samplerate);

        Ok(Self {
            registry,
            api,
            config,
            stats,
            audio,
            shared_dsp,
            alloc,
            root,
            timestamp: Timestamp(0),
            nudge: 0,
            latency_sub,
            faults: Vec::new(),
        })
    }

    /// The root voice of the tree (runs the group program)
    pub fn root_voice(&self) -> Handle {
        self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Render `frames` through the audio driver (pull mode)
    pub fn run(&mut self, frames: usize) -> VoxResult<()> {
        self.audio.run(frames)?;
        self.pump();
        Ok(())
    }

    /// The driver's channel buffers as of the last run
    pub fn buffers(&self) -> &[Box<[Sample]>] {
        self.audio.buffers()
    }

    // ───────────────────────────────────────────────────────────────────
    // Timestamping
    // ───────────────────────────────────────────────────────────────────

    /// A timestamp that has commands sent right away applied as soon as
    /// possible with constant latency
    pub fn timestamp_now(&self) -> Timestamp {
        Timestamp(self.stats.engine_ts.load(Ordering::Acquire)).offset(self.latency_sub)
    }

    /// The current API timestamp
    pub fn timestamp_get(&self) -> Timestamp {
        self.timestamp
    }

    /// Set the API timestamp; returns the previous value
    pub fn timestamp_set(&mut self, ts: Timestamp) -> Timestamp {
        std::mem::replace(&mut self.timestamp, ts)
    }

    /// Reset the API timestamp for minimal constant latency; returns the
    /// previous value
    pub fn reset_timestamp(&mut self) -> Timestamp {
        let now = self.timestamp_now();
        self.timestamp_set(now)
    }

    /// Advance the API timestamp by `dt` sub-frames, absorbing any
    /// pending nudge. The timestamp never moves backwards; unapplied
    /// nudge remainder carries over. Returns the previous value.
    pub fn bump(&mut self, dt: i32) -> Timestamp {
        let prev = self.timestamp;
        let mut adjust = self.nudge;
        if adjust < -dt {
            adjust = -dt;
        }
        self.timestamp = self.timestamp.offset(dt + adjust);
        self.nudge -= adjust;
        prev
    }

    /// Compute a full (`amount` = 1.0) or partial adjustment that would
    /// bring the API timestamp toward `now() - offset`. The adjustment is
    /// stored and applied by subsequent bumps; the timestamp itself does
    /// not change here. Returns the computed value.
    pub fn nudge(&mut self, offset: i32, amount: f32) -> i32 {
        let target = self.timestamp_now().offset(-offset);
        let d = target.diff(self.timestamp);
        self.nudge = (d as f64 * amount as f64) as i32;
        self.nudge
    }

    pub fn ms_to_timestamp(&self, ms: f64) -> i32 {
        ms_to_ts(ms, self.config.samplerate)
    }

    pub fn timestamp_to_ms(&self, ts: i32) -> f64 {
        ts_to_ms(ts, self.config.samplerate)
    }

    // ───────────────────────────────────────────────────────────────────
    // Objects
    // ───────────────────────────────────────────────────────────────────

    /// Build and register a program
    pub fn add_program(&mut self, program: Arc<Program>) -> VoxResult<Handle> {
        self.pump();
        self.registry.add(Object::Program(program))
    }

    /// Upload and prepare a wave for wavetable oscillators
    pub fn upload_wave(
        &mut self,
        wave_type: WaveType,
        period: u32,
        flags: WaveFlags,
        fmt: SampleFormat,
        channels: usize,
        data: &[u8],
    ) -> VoxResult<Handle> {
        self.pump();
        let wave = Arc::new(Wave::prepare(wave_type, period, flags, fmt, channels, data)?);
        let handle = self.registry.add(Object::Wave(wave.clone()))?;
        self.post(ApiCmd::SetWave {
            index: handle,
            wave: Some(wave),
        })?;
        Ok(handle)
    }

    pub fn new_bank(&mut self, name: &str) -> VoxResult<Handle> {
        self.registry.add(Object::Bank(Bank::new(name)))
    }

    /// Export `target` from a bank under `name`, retaining it
    pub fn bank_export(&mut self, bank: Handle, name: &str, target: Handle) -> VoxResult<()> {
        self.registry.retain(target)?;
        match self.registry.get_mut(bank) {
            Some(Object::Bank(b)) => b.export(name, target),
            Some(_) => Err(VoxError::WrongType),
            None => Err(VoxError::InvalidHandle),
        }
        .inspect_err(|_| {
            let _ = self.registry.release(target);
        })
    }

    /// Look up an export by name
    pub fn bank_find(&self, bank: Handle, name: &str) -> VoxResult<Handle> {
        match self.registry.get(bank) {
            Some(Object::Bank(b)) => b.find(name).ok_or(VoxError::NotFound),
            Some(_) => Err(VoxError::WrongType),
            None => Err(VoxError::InvalidHandle),
        }
    }

    pub fn new_constant(&mut self, value: f32) -> VoxResult<Handle> {
        self.registry.add(Object::Constant(Fx::from_f32(value)))
    }

    /// Register a built-in unit class as a handle, e.g. for bank exports
    pub fn unit_class(&mut self, name: &str) -> VoxResult<Handle> {
        let desc = vox_dsp::find_unit(name).ok_or(VoxError::NotFound)?;
        self.registry.add(Object::UnitClass(desc))
    }

    pub fn new_string(&mut self, s: &str) -> VoxResult<Handle> {
        self.registry.add(Object::Str(s.to_string()))
    }

    /// Open a sink client fed by the first tap unit in `voice`'s chain
    pub fn open_sink(&mut self, voice: Handle, capacity_frames: usize) -> VoxResult<Handle> {
        self.pump();
        self.expect_voice(voice)?;
        let channels = self.config.channels as usize;
        let (tx, rx) = rtrb::RingBuffer::new(capacity_frames * channels);
        let handle = self.registry.add(Object::SinkClient(SinkClient {
            ring: rx,
            channels,
        }))?;
        self.post(ApiCmd::AttachSink {
            voice,
            tap: SinkTap {
                ring: tx,
                channels,
            },
        })?;
        Ok(handle)
    }

    /// Read captured frames from a sink client
    pub fn sink_read(&mut self, sink: Handle, out: &mut [Sample]) -> VoxResult<usize> {
        self.pump();
        match self.registry.get_mut(sink) {
            Some(Object::SinkClient(c)) => Ok(c.read(out)),
            Some(_) => Err(VoxError::WrongType),
            None => Err(VoxError::InvalidHandle),
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Playing and controlling
    // ───────────────────────────────────────────────────────────────────

    /// Create a group voice (volume/pan, tap/insert point) under `parent`
    pub fn new_group(&mut self, parent: Handle) -> VoxResult<Handle> {
        let program = group_program(self.config.channels as usize)?;
        self.start_program(parent, program, &[])
    }

    /// Start a program on a new subvoice of `parent`; returns its handle
    pub fn start(&mut self, parent: Handle, program: Handle, args: &[f32]) -> VoxResult<Handle> {
        let program = self.expect_program(program)?;
        self.start_program(parent, program, args)
    }

    fn start_program(
        &mut self,
        parent: Handle,
        program: Arc<Program>,
        args: &[f32],
    ) -> VoxResult<Handle> {
        self.pump();
        self.expect_voice(parent)?;
        let mut voice = self.build_voice(program, args)?;
        let handle = self.registry.add(Object::NewVoice)?;
        voice.handle = handle;
        self.post(ApiCmd::Start { parent, voice })
            .inspect_err(|_| {
                let _ = self.registry.release(handle);
            })?;
        Ok(handle)
    }

    /// Start a program detached: no handle, cannot be addressed, but
    /// still receives messages sent to all subvoices of `parent`
    pub fn play(&mut self, parent: Handle, program: Handle, args: &[f32]) -> VoxResult<()> {
        self.pump();
        self.expect_voice(parent)?;
        let program = self.expect_program(program)?;
        let voice = self.build_voice(program, args)?;
        self.post(ApiCmd::Play { parent, voice })
    }

    /// Assemble a ready-to-run voice on this thread. Construction
    /// errors (bad entry point, too many arguments, unit init failures)
    /// surface synchronously here instead of as engine faults.
    fn build_voice(&mut self, program: Arc<Program>, args: &[f32]) -> VoxResult<Box<Voice>> {
        let channels = self.config.channels as usize;
        let voice = Voice::new(
            program,
            &ArgVec::from_f32(args),
            self.timestamp,
            channels,
            -1,
            &self.shared_dsp,
            &self.alloc,
            VoiceBuses::allocate(channels, &self.alloc),
        )?;
        Ok(Box::new(voice))
    }

    /// Send a message to entry point `ep` of the program running on
    /// `voice`
    pub fn send(&mut self, voice: Handle, ep: u8, args: &[f32]) -> VoxResult<()> {
        self.pump();
        self.expect_voice(voice)?;
        self.post(ApiCmd::Send {
            voice,
            ep,
            args: ArgVec::from_f32(args),
        })
    }

    /// Send a message to entry point `ep` of all subvoices of `voice`
    pub fn send_sub(&mut self, voice: Handle, ep: u8, args: &[f32]) -> VoxResult<()> {
        self.pump();
        self.expect_voice(voice)?;
        self.post(ApiCmd::SendSub {
            voice,
            ep,
            args: ArgVec::from_f32(args),
        })
    }

    /// Instantly stop `voice` and its subtree, releasing their handles
    pub fn kill(&mut self, voice: Handle) -> VoxResult<()> {
        self.pump();
        self.expect_voice(voice)?;
        self.post(ApiCmd::Kill { voice })
    }

    /// Kill all subvoices of `voice`, sparing `voice` itself
    pub fn kill_sub(&mut self, voice: Handle) -> VoxResult<()> {
        self.pump();
        self.expect_voice(voice)?;
        self.post(ApiCmd::KillSub { voice })
    }

    // ───────────────────────────────────────────────────────────────────
    // Handles
    // ───────────────────────────────────────────────────────────────────

    /// Release a handle. When the refcount reaches zero the object is
    /// destroyed; realtime-backed objects drain through the engine first.
    pub fn release(&mut self, handle: Handle) -> VoxResult<()> {
        self.pump();
        let tag = self.registry.tag_of(handle);

        // Waves about to die must leave the realtime table first; the
        // engine returns its reference through the response queue.
        if tag == Some(TypeTag::Wave)
            && self.registry.locate(handle).is_some_and(|i| i.refcount <= 1)
        {
            self.post(ApiCmd::SetWave {
                index: handle,
                wave: None,
            })?;
        }

        // Banks release their members when they go
        let members = match (tag, self.registry.get(handle)) {
            (Some(TypeTag::Bank), Some(Object::Bank(b)))
                if self.registry.locate(handle).is_some_and(|i| i.refcount <= 1) =>
            {
                b.handles().collect()
            }
            _ => Vec::new(),
        };

        let result = match self.registry.release(handle) {
            Ok(_remaining) => Ok(()),
            Err(VoxError::Refuse) => {
                // A live voice: flip to detached and let the engine drain
                self.registry.replace(handle, Object::Detached)?;
                self.post(ApiCmd::Detach { voice: handle })?;
                Ok(())
            }
            Err(e) => Err(e),
        };
        for m in members {
            let _ = self.release(m);
        }
        result
    }

    pub fn retain(&mut self, handle: Handle) -> VoxResult<()> {
        self.registry.retain(handle)
    }

    // ───────────────────────────────────────────────────────────────────
    // Properties
    // ───────────────────────────────────────────────────────────────────

    /// Read a per-handle property
    pub fn get_property(&mut self, handle: Handle, prop: Property) -> VoxResult<i32> {
        self.pump();
        let info = self.registry.locate(handle).ok_or(VoxError::InvalidHandle)?;
        match prop {
            Property::RefCount => Ok(info.refcount as i32),
            Property::Flags => Ok(info.userbits as i32),
            Property::Size => match self.registry.get(handle) {
                Some(Object::Wave(w)) => Ok(w.size() as i32),
                Some(Object::Str(s)) => Ok(s.len() as i32),
                Some(Object::Bank(b)) => Ok(b.len() as i32),
                _ => Err(VoxError::NotImplemented),
            },
            Property::Channels => match self.registry.get(handle) {
                Some(Object::Wave(_)) => Ok(1),
                Some(Object::Voice | Object::NewVoice) => Ok(self.config.channels as i32),
                Some(Object::SinkClient(c)) => Ok(c.channels as i32),
                _ => Err(VoxError::NotImplemented),
            },
            _ => self.get_state_property(prop),
        }
    }

    /// Read a state or statistics property
    pub fn get_state_property(&mut self, prop: Property) -> VoxResult<i32> {
        let s = &self.stats;
        match prop {
            Property::SampleRate => Ok(self.config.samplerate as i32),
            Property::Buffer => Ok(self.config.buffer as i32),
            Property::TimestampMargin => Ok(self.config.timestamp_margin_ms as i32),
            Property::SilenceLevel => Ok((self.config.silence_level * 65536.0) as i32),
            Property::SilenceWindow => Ok(self.config.silence_window as i32),
            Property::SilenceGrace => Ok(self.config.silence_grace as i32),
            _ => {
                // Statistics snapshot under the driver lock
                let _guard = self.audio.lock();
                match prop {
                    Property::ActiveVoices => Ok(s.active_voices.load(Ordering::Relaxed) as i32),
                    Property::ActiveVoicesMax => {
                        Ok(s.active_voices_max.load(Ordering::Relaxed) as i32)
                    }
                    Property::FreeVoices => Ok(s.free_voices.load(Ordering::Relaxed) as i32),
                    Property::TotalVoices => Ok(s.total_voices.load(Ordering::Relaxed) as i32),
                    Property::Instructions => Ok(s.instructions.load(Ordering::Relaxed) as i32),
                    Property::ApiMessages => Ok(s.api_messages.load(Ordering::Relaxed) as i32),
                    Property::TsMarginMin => Ok(s.ts_margin_min.load(Ordering::Relaxed)),
                    Property::TsMarginMax => Ok(s.ts_margin_max.load(Ordering::Relaxed)),
                    Property::TsMarginAvg => {
                        let count = s.ts_margin_count.load(Ordering::Relaxed).max(1);
                        Ok((s.ts_margin_sum.load(Ordering::Relaxed) / count as i64) as i32)
                    }
                    _ => Err(VoxError::NotImplemented),
                }
            }
        }
    }

    /// Set a state property; engine-side tunables are forwarded through
    /// the command queue
    pub fn set_state_property(&mut self, prop: Property, value: i32) -> VoxResult<()> {
        self.pump();
        match prop {
            Property::TimestampMargin => {
                self.config.timestamp_margin_ms = value as f64;
                self.latency_sub = ((self.config.buffer as i32) << 8)
                    + ms_to_ts(self.config.timestamp_margin_ms, self.config.samplerate);
                self.post(ApiCmd::SetProp { prop, value })
            }
            Property::SilenceLevel => {
                self.config.silence_level = value as f32 / 65536.0;
                self.post(ApiCmd::SetProp { prop, value })
            }
            Property::SilenceWindow => {
                self.config.silence_window = value.max(0) as u32;
                self.post(ApiCmd::SetProp { prop, value })
            }
            Property::SilenceGrace => {
                self.config.silence_grace = value.max(0) as u32;
                self.post(ApiCmd::SetProp { prop, value })
            }
            Property::RandSeed => self.post(ApiCmd::SetProp { prop, value }),
            _ => Err(VoxError::NotImplemented),
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Response handling
    // ───────────────────────────────────────────────────────────────────

    /// Drain the response queue: flip lifecycle handles, free drained
    /// detached handles, and drop disposed payloads. Called implicitly by
    /// every API verb; call directly when idle-polling.
    pub fn pump(&mut self) {
        while let Ok(resp) = self.api.responses.pop() {
            match resp {
                EngineResponse::VoiceEnded { handle } => {
                    // The realtime side is gone; the handle lives on as
                    // detached until its owner releases it
                    let _ = self.registry.replace(handle, Object::Detached);
                }
                EngineResponse::VoiceKilled { handle } => {
                    // Kill releases handles
                    if self.registry.replace(handle, Object::Detached).is_ok() {
                        let _ = self.registry.release(handle);
                    }
                }
                EngineResponse::Detached { handle } => {
                    // The refused release can now complete
                    if self.registry.tag_of(handle) == Some(TypeTag::Detached) {
                        let _ = self.registry.release(handle);
                    }
                }
                EngineResponse::Fault { handle, error } => {
                    if !self.config.flags.contains(InitFlags::SILENT) {
                        log::warn!("engine reported {error} (voice {handle})");
                    }
                    self.faults.push((handle, error));
                }
                EngineResponse::Dispose(payload) => match payload {
                    Disposable::Wave(w) => drop(w),
                    Disposable::Voice(v) => drop(v),
                },
            }
        }
    }

    /// Audio-thread errors reported since the last call
    pub fn take_faults(&mut self) -> Vec<(Handle, VoxError)> {
        self.pump();
        std::mem::take(&mut self.faults)
    }

    /// Type tag of a live handle
    pub fn type_of(&self, handle: Handle) -> Option<TypeTag> {
        self.registry.tag_of(handle)
    }

    // ───────────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────────

    fn post(&mut self, cmd: ApiCmd) -> VoxResult<()> {
        self.api
            .commands
            .push(ApiMessage {
                when: self.timestamp,
                cmd,
            })
            .map_err(|_| VoxError::Overflow)
    }

    fn expect_voice(&self, handle: Handle) -> VoxResult<()> {
        match self.registry.tag_of(handle) {
            Some(TypeTag::Voice | TypeTag::NewVoice) => Ok(()),
            Some(TypeTag::Detached) => Err(VoxError::DeadHandle),
            Some(_) => Err(VoxError::WrongType),
            None => Err(VoxError::InvalidHandle),
        }
    }

    fn expect_program(&mut self, handle: Handle) -> VoxResult<Arc<Program>> {
        match self.registry.get(handle) {
            Some(Object::Program(p)) => Ok(p.clone()),
            Some(_) => Err(VoxError::WrongType),
            None => Err(VoxError::InvalidHandle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::open(Config::default()).unwrap()
    }

    #[test]
    fn test_bump_never_moves_backwards() {
        let mut e = engine();
        e.timestamp_set(Timestamp(1000));
        e.nudge = -600;

        // A negative nudge larger than the bump is clamped; the
        // remainder carries to the next bumps
        let prev = e.bump(256);
        assert_eq!(prev, Timestamp(1000));
        assert_eq!(e.timestamp_get(), Timestamp(1000));
        assert_eq!(e.nudge, -344);

        e.bump(256);
        assert_eq!(e.timestamp_get(), Timestamp(1000));
        assert_eq!(e.nudge, -88);

        e.bump(256);
        assert_eq!(e.timestamp_get(), Timestamp(1000 + 168));
        assert_eq!(e.nudge, 0);
    }

    #[test]
    fn test_bump_applies_positive_nudge_at_once() {
        let mut e = engine();
        e.timestamp_set(Timestamp(5000));
        e.nudge = 100;
        e.bump(256);
        assert_eq!(e.timestamp_get(), Timestamp(5356));
        assert_eq!(e.nudge, 0);
    }

    #[test]
    fn test_now_includes_constant_latency() {
        let e = engine();
        // Fresh engine clock is zero; now() still leads by buffer + margin
        assert!(e.timestamp_now().diff(Timestamp::ZERO) > 0);
    }

    #[test]
    fn test_wave_handle_lifecycle() {
        let mut e = engine();
        let data: Vec<u8> = (0..64i16).flat_map(|i| (i * 256).to_le_bytes()).collect();
        let w = e
            .upload_wave(
                WaveType::Plain,
                64,
                WaveFlags::LOOPED,
                SampleFormat::I16,
                1,
                &data,
            )
            .unwrap();
        assert_eq!(e.type_of(w), Some(TypeTag::Wave));
        assert_eq!(e.get_property(w, Property::Size).unwrap(), 64);
        assert_eq!(e.get_property(w, Property::RefCount).unwrap(), 1);

        e.release(w).unwrap();
        assert_eq!(e.type_of(w), None);
    }

    #[test]
    fn test_bank_retains_and_releases_members() {
        let mut e = engine();
        let c = e.new_constant(1.5).unwrap();
        let bank = e.new_bank("main").unwrap();
        e.bank_export(bank, "tune", c).unwrap();
        assert_eq!(e.get_property(c, Property::RefCount).unwrap(), 2);
        assert_eq!(e.bank_find(bank, "tune").unwrap(), c);

        // Dropping the caller's reference leaves the bank's
        e.release(c).unwrap();
        assert_eq!(e.type_of(c), Some(TypeTag::Constant));

        // Destroying the bank releases the member too
        e.release(bank).unwrap();
        assert_eq!(e.type_of(c), None);
    }

    #[test]
    fn test_unit_class_handles() {
        let mut e = engine();
        let u = e.unit_class("wtosc").unwrap();
        assert_eq!(e.type_of(u), Some(TypeTag::UnitClass));
        assert_eq!(e.unit_class("warpdrive").err(), Some(VoxError::NotFound));
    }

    #[test]
    fn test_send_to_wrong_handle_kind() {
        let mut e = engine();
        let c = e.new_constant(0.0).unwrap();
        assert_eq!(e.send(c, 1, &[]).err(), Some(VoxError::WrongType));
        assert_eq!(e.send(9999, 1, &[]).err(), Some(VoxError::InvalidHandle));
    }
}
