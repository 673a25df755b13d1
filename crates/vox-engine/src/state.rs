//! Realtime engine state and the per-buffer processor
//!
//! The processor owns everything the audio thread touches: the voice
//! arena, the realtime wave table, the engine clock, and the engine end
//! of the SPSC queue pair. Per buffer it drains due commands, slices the
//! buffer into fragments at command deadlines, walks the voice tree
//! (VM slices interleaved with unit processing), and mixes the root
//! voice's output into the driver buffers.
//!
//! Nothing here blocks and nothing allocates outside voice/unit
//! initialization, which goes through the system driver's allocator.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};

use rand::SeedableRng;
use rand::rngs::SmallRng;

use vox_core::{BufferPool, Config, Handle, InitFlags, MAX_FRAG, Sample, Timestamp, VoxError};
use vox_dsp::{ProcessCtx, SharedDsp, WaveTable};

use vox_audio::{MidiDriver, SysAlloc};

use crate::messages::{ApiCmd, ApiMessage, Disposable, EngineResponse, EngineSide};
use crate::program::Program;
use crate::vm::{self, ArgVec, RunState, VM_BUDGET, VmAction, VoiceMessage};
use crate::voice::{UnitWrites, Voice, VoiceBuses, VoiceId};

// ═══════════════════════════════════════════════════════════════════════════
// SHARED STATISTICS
// ═══════════════════════════════════════════════════════════════════════════

/// Statistics published by the audio thread, read lock-free by the API
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Engine clock (24.8 frames, wrapping)
    pub engine_ts: AtomicU32,
    pub active_voices: AtomicU32,
    pub active_voices_max: AtomicU32,
    pub free_voices: AtomicU32,
    pub total_voices: AtomicU32,
    /// VM instructions executed (wrapping)
    pub instructions: AtomicU32,
    /// API messages received by the engine
    pub api_messages: AtomicU32,
    /// Command deadline margins at arrival, 24.8 sub-frames
    pub ts_margin_min: AtomicI32,
    pub ts_margin_max: AtomicI32,
    pub ts_margin_sum: AtomicI64,
    pub ts_margin_count: AtomicU32,
}

impl EngineStats {
    pub fn new() -> Arc<Self> {
        let s = Self::default();
        s.ts_margin_min.store(i32::MAX, Ordering::Relaxed);
        s.ts_margin_max.store(i32::MIN, Ordering::Relaxed);
        Arc::new(s)
    }

    fn record_margin(&self, margin: i32) {
        self.ts_margin_min.fetch_min(margin, Ordering::Relaxed);
        self.ts_margin_max.fetch_max(margin, Ordering::Relaxed);
        self.ts_margin_sum.fetch_add(margin as i64, Ordering::Relaxed);
        self.ts_margin_count.fetch_add(1, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// VOICE ARENA
// ═══════════════════════════════════════════════════════════════════════════

struct ArenaSlot {
    generation: u32,
    voice: Option<Box<Voice>>,
}

/// Generational, pool-sized voice storage
pub struct VoiceArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
    active: usize,
}

impl VoiceArena {
    pub fn new(pool: usize) -> Self {
        let mut slots = Vec::with_capacity(pool);
        let mut free = Vec::with_capacity(pool);
        for i in 0..pool {
            slots.push(ArenaSlot {
                generation: 1,
                voice: None,
            });
            free.push((pool - 1 - i) as u32);
        }
        Self {
            slots,
            free,
            active: 0,
        }
    }

    /// Install a voice; the pool is fixed, so a full arena hands the
    /// voice back instead of dropping it
    pub fn alloc(&mut self, voice: Box<Voice>) -> Result<VoiceId, Box<Voice>> {
        let Some(index) = self.free.pop() else {
            return Err(voice);
        };
        let slot = &mut self.slots[index as usize];
        slot.voice = Some(voice);
        self.active += 1;
        Ok(VoiceId {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, id: VoiceId) -> Option<&ArenaSlot> {
        let s = self.slots.get(id.index as usize)?;
        (s.generation == id.generation).then_some(s)
    }

    pub fn get(&self, id: VoiceId) -> Option<&Voice> {
        self.slot(id)?.voice.as_deref()
    }

    pub fn get_mut(&mut self, id: VoiceId) -> Option<&mut Voice> {
        let s = self.slots.get_mut(id.index as usize)?;
        if s.generation != id.generation {
            return None;
        }
        s.voice.as_deref_mut()
    }

    /// Take the voice out for processing; must be paired with `put_back`
    /// or `free_taken`
    pub fn take(&mut self, id: VoiceId) -> Option<Box<Voice>> {
        let s = self.slots.get_mut(id.index as usize)?;
        if s.generation != id.generation {
            return None;
        }
        s.voice.take()
    }

    pub fn put_back(&mut self, id: VoiceId, voice: Box<Voice>) {
        if let Some(s) = self.slots.get_mut(id.index as usize) {
            s.voice = Some(voice);
        }
    }

    /// Retire a slot whose voice has already been taken
    pub fn free_taken(&mut self, id: VoiceId) {
        if let Some(s) = self.slots.get_mut(id.index as usize) {
            if s.generation == id.generation {
                s.generation = s.generation.wrapping_add(1);
                self.active -= 1;
                self.free.push(id.index);
            }
        }
    }

    /// Free a live slot (teardown path)
    pub fn free(&mut self, id: VoiceId) -> Option<Box<Voice>> {
        let v = self.take(id)?;
        self.free_taken(id);
        Some(v)
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn reset_budgets(&mut self) {
        for s in &mut self.slots {
            if let Some(v) = s.voice.as_deref_mut() {
                v.vm.budget = VM_BUDGET;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// THE PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════

/// Everything the audio thread owns
pub struct Processor {
    arena: VoiceArena,
    root: VoiceId,
    waves: WaveTable,
    queues: EngineSide,
    /// Due commands for the current buffer, reverse-sorted by deadline
    pending: Vec<ApiMessage>,
    now: Timestamp,
    shared_dsp: SharedDsp,
    alloc: SysAlloc,
    /// Recycled voice-bus buffers for VM-spawned subvoices
    buffer_pool: BufferPool,
    /// handle → voice map for attached voices (linear scan; bounded by
    /// the voice pool)
    attached: Vec<(Handle, VoiceId)>,
    stats: Arc<EngineStats>,
    rng: SmallRng,
    channels: usize,
    /// Late-message tolerance, 24.8 sub-frames
    margin: i32,
    silence_level: Sample,
    silence_window: u32,
    silence_grace: u32,
    rtsilent: bool,
    midi: Option<Box<dyn MidiDriver>>,
}

impl Processor {
    pub fn new(
        config: &Config,
        queues: EngineSide,
        stats: Arc<EngineStats>,
        alloc: SysAlloc,
        root_program: Arc<Program>,
        root_handle: Handle,
        midi: Option<Box<dyn MidiDriver>>,
    ) -> Result<Self, VoxError> {
        let shared_dsp = SharedDsp::new(config.samplerate);
        let mut arena = VoiceArena::new(config.voicepool as usize);
        let channels = config.channels as usize;

        let root_voice = Voice::new(
            root_program,
            &ArgVec::default(),
            Timestamp::ZERO,
            channels,
            root_handle,
            &shared_dsp,
            &alloc,
            VoiceBuses::allocate(channels, &alloc),
        )?;
        let root = arena
            .alloc(Box::new(root_voice))
            .map_err(|_| VoxError::VoiceAlloc)?;

        let margin = vox_core::ms_to_ts(config.timestamp_margin_ms, config.samplerate);
        stats
            .total_voices
            .store(arena.capacity() as u32, Ordering::Relaxed);

        Ok(Self {
            attached: vec![(root_handle, root)],
            arena,
            root,
            waves: WaveTable::new(config.blockpool as usize),
            queues,
            pending: Vec::with_capacity(config.eventpool as usize),
            now: Timestamp::ZERO,
            shared_dsp,
            buffer_pool: BufferPool::new(config.blockpool as usize, MAX_FRAG, &alloc),
            alloc,
            stats,
            rng: SmallRng::seed_from_u64(0x5eed),
            channels,
            margin,
            silence_level: config.silence_level,
            silence_window: config.silence_window,
            silence_grace: config.silence_grace,
            rtsilent: config.flags.contains(InitFlags::RTSILENT),
            midi,
        })
    }

    pub fn root_id(&self) -> VoiceId {
        self.root
    }

    /// Render one buffer of `frames` frames into the driver's channel
    /// buffers. This is the audio-thread entry point.
    pub fn process(&mut self, buffers: &mut [Box<[Sample]>], frames: usize) {
        self.arena.reset_budgets();
        self.poll_midi(frames as u32);

        // Pull every command due inside this buffer, then order them by
        // deadline; stable sort keeps enqueue order for equal stamps.
        let buf_end = self.now.add_frames(frames as u32);
        while let Ok(m) = self.queues.commands.peek() {
            if m.when.diff(buf_end) >= 0 {
                break;
            }
            let m = self.queues.commands.pop().expect("peeked");
            self.stats.record_margin(m.when.diff(self.now));
            self.stats.api_messages.fetch_add(1, Ordering::Relaxed);
            self.pending.push(m);
        }
        let now = self.now;
        self.pending.sort_by_key(|m| m.when.diff(now));
        self.pending.reverse();

        let mut offset = 0;
        while offset < frames {
            while let Some(m) = self.pending.last() {
                if m.when.diff(self.now) > 0 {
                    break;
                }
                let m = self.pending.pop().expect("checked");
                self.execute(m);
            }

            let mut frag = (frames - offset).min(MAX_FRAG);
            if let Some(m) = self.pending.last() {
                let due_in = ((m.when.diff(self.now).max(1) + 255) >> 8) as usize;
                frag = frag.min(due_in.max(1));
            }

            self.process_fragment(buffers, offset, frag);
            self.now = self.now.add_frames(frag as u32);
            offset += frag;
        }

        self.publish_stats();
    }

    fn publish_stats(&self) {
        let s = &self.stats;
        s.engine_ts.store(self.now.0, Ordering::Release);
        let active = self.arena.active() as u32;
        s.active_voices.store(active, Ordering::Relaxed);
        s.active_voices_max.fetch_max(active, Ordering::Relaxed);
        s.free_voices.store(
            (self.arena.capacity() - self.arena.active()) as u32,
            Ordering::Relaxed,
        );
    }

    fn poll_midi(&mut self, frames: u32) {
        let Some(mut midi) = self.midi.take() else {
            return;
        };
        let now = self.now;
        midi.poll(frames, &mut |ev| {
            let args = ArgVec::from_f32(&ev.args());
            if let Some(id) = self.find_attached(ev.voice) {
                if let Some(v) = self.arena.get_mut(id) {
                    let _ = v.post(VoiceMessage {
                        ep: crate::program::MIDI_EP as u8,
                        args,
                        when: now,
                    });
                }
            }
        });
        self.midi = Some(midi);
    }

    fn find_attached(&self, handle: Handle) -> Option<VoiceId> {
        self.attached
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, id)| *id)
    }

    fn respond(&mut self, response: EngineResponse) {
        // A full ring degrades to dropping the payload here; lifecycle
        // responses are retried on the next buffer by virtue of handle
        // state living on the API side.
        let _ = self.queues.responses.push(response);
    }

    fn fault(&mut self, handle: Handle, error: VoxError) {
        if !self.rtsilent {
            log::error!("engine fault on voice {handle}: {error}");
        }
        self.respond(EngineResponse::Fault { handle, error });
    }

    // ───────────────────────────────────────────────────────────────────
    // Command execution
    // ───────────────────────────────────────────────────────────────────

    fn execute(&mut self, m: ApiMessage) {
        let lateness = self.now.diff(m.when);
        if lateness > self.margin {
            // Best effort: report and execute anyway
            if !self.rtsilent {
                log::warn!(
                    "late message: deadline {} sub-frames behind engine clock",
                    lateness
                );
            }
            self.respond(EngineResponse::Fault {
                handle: -1,
                error: VoxError::LateMessage,
            });
        }

        match m.cmd {
            ApiCmd::Start { parent, voice } => {
                let handle = voice.handle;
                if let Err(e) = self.attach_voice(parent, voice) {
                    self.fault(handle, e);
                    self.respond(EngineResponse::VoiceKilled { handle });
                }
            }
            ApiCmd::Play { parent, voice } => {
                if let Err(e) = self.attach_voice(parent, voice) {
                    self.fault(-1, e);
                }
            }
            ApiCmd::Send { voice, ep, args } => {
                let Some(id) = self.find_attached(voice) else {
                    self.fault(voice, VoxError::BadVoice);
                    return;
                };
                let when = m.when;
                if let Some(v) = self.arena.get_mut(id) {
                    if let Err(e) = v.post(VoiceMessage { ep, args, when }) {
                        self.fault(voice, e);
                    }
                }
            }
            ApiCmd::SendSub { voice, ep, args } => {
                let Some(id) = self.find_attached(voice) else {
                    self.fault(voice, VoxError::BadVoice);
                    return;
                };
                let children = match self.arena.get(id) {
                    Some(v) => v.children.clone(),
                    None => return,
                };
                let when = m.when;
                for child in children {
                    if let Some(v) = self.arena.get_mut(child) {
                        let _ = v.post(VoiceMessage { ep, args, when });
                    }
                }
            }
            ApiCmd::Kill { voice } => {
                let Some(id) = self.find_attached(voice) else {
                    self.fault(voice, VoxError::BadVoice);
                    return;
                };
                self.kill_subtree(id);
            }
            ApiCmd::KillSub { voice } => {
                let Some(id) = self.find_attached(voice) else {
                    self.fault(voice, VoxError::BadVoice);
                    return;
                };
                let children = match self.arena.get(id) {
                    Some(v) => v.children.clone(),
                    None => return,
                };
                for child in children {
                    self.kill_subtree(child);
                }
                if let Some(v) = self.arena.get_mut(id) {
                    v.children.clear();
                    v.subslots = [None; crate::program::MAX_SUBSLOTS];
                }
            }
            ApiCmd::Detach { voice } => {
                if let Some(id) = self.find_attached(voice) {
                    if let Some(v) = self.arena.get_mut(id) {
                        v.handle = -1;
                    }
                    self.attached.retain(|(h, _)| *h != voice);
                }
                self.respond(EngineResponse::Detached { handle: voice });
            }
            ApiCmd::SetWave { index, wave } => {
                if let Some(old) = self.waves.set(index as usize, wave) {
                    self.respond(EngineResponse::Dispose(Disposable::Wave(old)));
                }
            }
            ApiCmd::AttachSink { voice, tap } => {
                let Some(id) = self.find_attached(voice) else {
                    self.fault(voice, VoxError::BadVoice);
                    return;
                };
                if let Some(v) = self.arena.get_mut(id) {
                    if let Err(e) = v.attach_sink(tap) {
                        self.fault(voice, e);
                    }
                }
            }
            ApiCmd::SetProp { prop, value } => self.set_prop(prop, value),
        }
    }

    fn set_prop(&mut self, prop: vox_core::Property, value: i32) {
        use vox_core::Property;
        match prop {
            Property::TimestampMargin => {
                self.margin = vox_core::ms_to_ts(value as f64, self.shared_dsp.samplerate);
            }
            Property::SilenceLevel => self.silence_level = value as Sample / 65536.0,
            Property::SilenceWindow => self.silence_window = value.max(0) as u32,
            Property::SilenceGrace => self.silence_grace = value.max(0) as u32,
            Property::RandSeed => self.rng = SmallRng::seed_from_u64(value as u64),
            _ => self.fault(-1, VoxError::NotImplemented),
        }
    }

    /// Install a voice built on the API side under `parent`. Only
    /// pointer bookkeeping happens here; failures ship the voice back
    /// through the response queue.
    fn attach_voice(&mut self, parent: Handle, mut voice: Box<Voice>) -> Result<VoiceId, VoxError> {
        let Some(parent_id) = self.find_attached(parent) else {
            self.dispose_voice(voice);
            return Err(VoxError::BadVoice);
        };
        let Some(nest) = self.arena.get(parent_id).map(|p| p.nest + 1) else {
            self.dispose_voice(voice);
            return Err(VoxError::BadVoice);
        };
        if let Err(e) = voice.set_nest(nest) {
            self.dispose_voice(voice);
            return Err(e);
        }

        let handle = voice.handle;
        let id = match self.arena.alloc(voice) {
            Ok(id) => id,
            Err(voice) => {
                self.dispose_voice(voice);
                return Err(VoxError::VoiceAlloc);
            }
        };
        if let Some(p) = self.arena.get_mut(parent_id) {
            p.children.push(id);
        }
        if handle >= 0 {
            self.attached.push((handle, id));
        }
        Ok(id)
    }

    /// Tear down a voice and all its descendants, releasing handles
    fn kill_subtree(&mut self, id: VoiceId) {
        let Some(voice) = self.arena.free(id) else {
            return;
        };
        for child in &voice.children {
            self.kill_subtree(*child);
        }
        if voice.handle >= 0 {
            self.attached.retain(|(h, _)| *h != voice.handle);
            self.respond(EngineResponse::VoiceKilled {
                handle: voice.handle,
            });
        }
        self.dispose_voice(voice);
    }

    /// Reap a finished voice (program ended, children gone, output quiet)
    fn reap(&mut self, id: VoiceId) {
        let Some(voice) = self.arena.free(id) else {
            return;
        };
        if voice.handle >= 0 {
            self.attached.retain(|(h, _)| *h != voice.handle);
            self.respond(EngineResponse::VoiceEnded {
                handle: voice.handle,
            });
        }
        self.dispose_voice(voice);
    }

    fn dispose_voice(&mut self, mut voice: Box<Voice>) {
        // Buses go back to the realtime pool; the rest of the voice
        // (unit chain, VM state) is shipped whole to the API thread so
        // no deallocation happens in the audio callback. Only a full
        // response ring degrades to freeing in place.
        voice.donate_buses(&mut self.buffer_pool);
        self.respond(EngineResponse::Dispose(Disposable::Voice(voice)));
    }

    // ───────────────────────────────────────────────────────────────────
    // Fragment processing
    // ───────────────────────────────────────────────────────────────────

    fn process_fragment(&mut self, buffers: &mut [Box<[Sample]>], offset: usize, frames: usize) {
        let root = self.root;
        let status = self.process_voice(root, frames);

        if let Some(v) = self.arena.get(root) {
            let start = status.unwrap_or(0);
            for (ch, buf) in buffers.iter_mut().enumerate().take(self.channels) {
                let out = &v.output()[ch];
                for s in 0..frames {
                    buf[offset + s] = if s >= start { out[s] } else { 0.0 };
                }
            }
        } else {
            for buf in buffers.iter_mut().take(self.channels) {
                buf[offset..offset + frames].fill(0.0);
            }
        }
    }

    /// Process one voice for a fragment. Returns `Some(start_frame)` of
    /// the span it produced, or `None` if the voice is gone.
    fn process_voice(&mut self, id: VoiceId, frames: usize) -> Option<usize> {
        let mut voice = self.arena.take(id)?;
        let frag_start = self.now;
        let frag_end = frag_start.add_frames(frames as u32);

        // VM phase: alternate message delivery and program slices until
        // nothing more is due inside this fragment
        loop {
            let vm_due = (voice.vm.state == RunState::Waiting)
                .then_some(voice.vm.wait_until)
                .filter(|t| t.diff(frag_end) < 0);
            let msg_due = voice.next_message_at().filter(|t| t.diff(frag_end) < 0);

            let run_msg = match (vm_due, msg_due) {
                (None, None) => break,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (Some(v), Some(m)) => m.diff(v) <= 0,
            };

            if run_msg {
                let msg = voice.inbox.pop_front().expect("checked");
                let at = if msg.when.diff(frag_start) < 0 {
                    frag_start
                } else {
                    msg.when
                };
                match voice.program.entry(msg.ep as usize) {
                    Ok(ep) => voice.vm.interrupt(ep, &msg.args, at),
                    Err(e) => {
                        // No such handler: report, drop the message
                        self.fault(voice.handle, e);
                        continue;
                    }
                }
            }

            let program = voice.program.clone();
            let mut actions = Vec::new();
            // Side effects land at the slice's execution time
            let slice_at = voice.vm.wait_until;
            let mut budget = voice.vm.budget;
            let before = budget;
            let result = vm::run_slice(
                &mut voice.vm,
                &program,
                &mut UnitWrites {
                    units: &mut voice.units,
                },
                &mut actions,
                &mut self.rng,
                &mut budget,
                frag_start,
            );
            voice.vm.budget = budget;
            self.stats
                .instructions
                .fetch_add(before - budget, Ordering::Relaxed);

            match result {
                Ok(()) => {
                    self.apply_actions(&mut voice, &mut actions, slice_at);
                }
                Err(e) => {
                    // Fault: kill the offending voice, release its handle
                    self.fault(voice.handle, e);
                    for child in voice.children.clone() {
                        self.kill_subtree(child);
                    }
                    if voice.handle >= 0 {
                        let handle = voice.handle;
                        self.attached.retain(|(h, _)| *h != handle);
                        self.respond(EngineResponse::VoiceKilled { handle });
                    }
                    self.dispose_voice(voice);
                    self.arena.free_taken(id);
                    return None;
                }
            }
        }

        // Children render first, mixing into this voice's input bus
        voice.clear_input(0, frames);
        let mut i = 0;
        while i < voice.children.len() {
            let child = voice.children[i];
            match self.process_voice(child, frames) {
                Some(start) => {
                    if let Some(c) = self.arena.get(child) {
                        if start < frames {
                            voice.mix_child(c.output(), start, frames - start);
                        }
                        let finished = c.finished()
                            && c.silent_frames >= self.silence_window + self.silence_grace;
                        if finished {
                            self.reap(child);
                            voice.children.swap_remove(i);
                            continue;
                        }
                    }
                    i += 1;
                }
                None => {
                    voice.children.swap_remove(i);
                }
            }
        }
        for slot in voice.subslots.iter_mut() {
            if let Some(sub) = *slot {
                if self.arena.get(sub).is_none() {
                    *slot = None;
                }
            }
        }

        // Unit chain
        let start = voice.start_offset.min(frames);
        voice.start_offset = 0;
        if start < frames {
            let ctx = ProcessCtx { waves: &self.waves };
            let peak = voice.process_units(&ctx, start, frames - start);
            if voice.vm.state == RunState::Ended && voice.children.is_empty() {
                if peak < self.silence_level {
                    voice.silent_frames = voice
                        .silent_frames
                        .saturating_add((frames - start) as u32);
                } else {
                    voice.silent_frames = 0;
                }
            }
        }

        self.arena.put_back(id, voice);
        Some(start)
    }

    fn apply_actions(&mut self, voice: &mut Voice, actions: &mut Vec<VmAction>, at: Timestamp) {
        for action in actions.drain(..) {
            match action {
                VmAction::Spawn { slot, prg, args } => {
                    let Some(program) = voice.program.subprograms.get(prg as usize) else {
                        self.fault(voice.handle, VoxError::IndexRange);
                        continue;
                    };
                    // Subvoice buses come from the realtime pool
                    let buses =
                        VoiceBuses::from_pool(self.channels, &mut self.buffer_pool, &self.alloc);
                    let child = Voice::new(
                        program.clone(),
                        &args,
                        at,
                        self.channels,
                        -1,
                        &self.shared_dsp,
                        &self.alloc,
                        buses,
                    );
                    let mut child = match child {
                        Ok(c) => Box::new(c),
                        Err(e) => {
                            self.fault(voice.handle, e);
                            continue;
                        }
                    };
                    if let Err(e) = child.set_nest(voice.nest + 1) {
                        self.fault(voice.handle, e);
                        self.dispose_voice(child);
                        continue;
                    }
                    // Frames into the current fragment where it starts
                    child.start_offset = (at.diff(self.now).max(0) >> 8) as usize;
                    match self.arena.alloc(child) {
                        Ok(cid) => {
                            voice.children.push(cid);
                            if let Some(s) = slot {
                                voice.subslots[s as usize % crate::program::MAX_SUBSLOTS] =
                                    Some(cid);
                            }
                        }
                        Err(child) => {
                            self.fault(voice.handle, VoxError::VoiceAlloc);
                            self.dispose_voice(child);
                        }
                    }
                }
                VmAction::SendSub { slot, ep, args } => {
                    let Some(Some(cid)) = voice.subslots.get(slot as usize).copied() else {
                        continue;
                    };
                    if let Some(c) = self.arena.get_mut(cid) {
                        let _ = c.post(VoiceMessage { ep, args, when: at });
                    }
                }
                VmAction::SendAll { ep, args } => {
                    for cid in voice.children.clone() {
                        if let Some(c) = self.arena.get_mut(cid) {
                            let _ = c.post(VoiceMessage { ep, args, when: at });
                        }
                    }
                }
                VmAction::KillSub { slot } => {
                    if let Some(Some(cid)) = voice.subslots.get(slot as usize).copied() {
                        self.kill_subtree(cid);
                        voice.subslots[slot as usize] = None;
                        voice.children.retain(|c| *c != cid);
                    }
                }
                VmAction::KillAll => {
                    for cid in voice.children.drain(..).collect::<Vec<_>>() {
                        self.kill_subtree(cid);
                    }
                    voice.subslots = [None; crate::program::MAX_SUBSLOTS];
                }
                VmAction::Wake { slot, force } => {
                    if let Some(Some(cid)) = voice.subslots.get(slot as usize).copied() {
                        if let Some(c) = self.arena.get_mut(cid) {
                            match c.vm.state {
                                RunState::Sleeping => {
                                    c.vm.state = RunState::Waiting;
                                    c.vm.wait_until = at;
                                }
                                RunState::Waiting if force => {
                                    if c.vm.wait_until.diff(at) > 0 {
                                        c.vm.wait_until = at;
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
    }
}
