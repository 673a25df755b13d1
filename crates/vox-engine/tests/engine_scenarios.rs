//! End-to-end engine scenarios over the pull-mode audio driver

use std::sync::Arc;

use vox_audio::PullAudioDriver;
use vox_core::{Config, Fx, Property, Timestamp, TypeTag, VoxError};
use vox_engine::{Engine, Insn, OutputMode, Program, ProgramBuilder, R_FIRST_FREE};

fn open_engine() -> Engine {
    let config = Config {
        samplerate: 48000,
        buffer: 1024,
        channels: 2,
        ..Config::default()
    };
    Engine::open_with_drivers(config, Some(Box::new(PullAudioDriver::new())), None).unwrap()
}

/// A stereo DC program: main sets STEP mode and the initial value from
/// its argument, then sleeps. Entry point 1 replaces the value.
fn dc_program() -> Arc<Program> {
    let a = R_FIRST_FREE as u8;
    let tmp = a + 1;
    let mut b = ProgramBuilder::new();
    b.unit("dc", 0, 2, OutputMode::VoiceOut).unwrap();

    b.entry(0, 1, R_FIRST_FREE).unwrap();
    b.op(Insn::LoadImm {
        r: tmp,
        v: Fx::ZERO,
    })
    .unwrap();
    // mode = STEP
    b.op(Insn::Write {
        unit: 0,
        reg: 1,
        s: tmp,
    })
    .unwrap();
    b.op(Insn::Write { unit: 0, reg: 0, s: a }).unwrap();
    b.op(Insn::Sleep).unwrap();

    b.entry(1, 1, R_FIRST_FREE).unwrap();
    b.op(Insn::Write { unit: 0, reg: 0, s: a }).unwrap();
    b.op(Insn::Return).unwrap();

    b.build(2).unwrap()
}

#[test]
fn silent_root_renders_zeros() {
    let mut engine = open_engine();
    engine.run(1024).unwrap();
    for ch in engine.buffers() {
        assert!(ch.iter().all(|&s| s == 0.0), "root must render silence");
    }
}

#[test]
fn dc_voice_reaches_both_channels() {
    let mut engine = open_engine();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    let v = engine.start(root, prg, &[0.5]).unwrap();

    engine.run(1024).unwrap();
    // After the step transient, both channels hold the value exactly
    for ch in engine.buffers() {
        assert_eq!(ch[512], 0.5);
        assert_eq!(ch[1023], 0.5);
    }
    assert!(engine.take_faults().is_empty());
    engine.kill(v).unwrap();
}

#[test]
fn detached_play_is_audible() {
    let mut engine = open_engine();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    engine.play(root, prg, &[0.25]).unwrap();

    engine.run(1024).unwrap();
    assert_eq!(engine.buffers()[0][900], 0.25);
}

#[test]
fn timestamped_sends_apply_in_deadline_order() {
    let mut engine = open_engine();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    let v = engine.start(root, prg, &[0.0]).unwrap();

    // Later deadline enqueued first: ep1(1.0) at frame 100, then
    // ep1(2.0) at frame 50. The handler must see 2.0 before 1.0,
    // leaving 1.0 as the final value.
    engine.timestamp_set(Timestamp::from_frames(100));
    engine.send(v, 1, &[1.0]).unwrap();
    engine.timestamp_set(Timestamp::from_frames(50));
    engine.send(v, 1, &[2.0]).unwrap();

    engine.run(1024).unwrap();
    let out = engine.buffers()[0].clone();
    // Between the deadlines the 2.0 message is in effect
    assert_eq!(out[70], 2.0);
    // After both, the later-deadline value wins
    assert_eq!(out[200], 1.0);
    assert_eq!(out[1023], 1.0);
}

#[test]
fn late_message_reported_but_still_executed() {
    let mut engine = open_engine();
    engine
        .set_state_property(Property::TimestampMargin, 5)
        .unwrap();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    let v = engine.start(root, prg, &[0.0]).unwrap();
    engine.run(1024).unwrap();
    engine.take_faults();

    // The engine clock sits at 1024 frames now; a deadline at frame 100
    // is ~19 ms in the past, far beyond the 5 ms margin
    engine.timestamp_set(Timestamp::from_frames(100));
    engine.send(v, 1, &[0.75]).unwrap();

    engine.run(1024).unwrap();

    let faults = engine.take_faults();
    assert!(
        faults.iter().any(|(_, e)| *e == VoxError::LateMessage),
        "late message must be reported"
    );
    // Best effort: the message still executed, the voice survived
    assert_eq!(engine.buffers()[0][1000], 0.75);
    assert_eq!(engine.type_of(v), Some(TypeTag::NewVoice));
}

#[test]
fn kill_sub_is_idempotent() {
    let mut engine = open_engine();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    let group = engine.new_group(root).unwrap();
    let a = engine.start(group, prg, &[0.1]).unwrap();
    let b = engine.start(group, prg, &[0.2]).unwrap();
    engine.run(1024).unwrap();
    assert_eq!(
        engine.get_state_property(Property::ActiveVoices).unwrap(),
        4
    );

    engine.kill_sub(group).unwrap();
    engine.kill_sub(group).unwrap();
    engine.run(1024).unwrap();

    assert_eq!(
        engine.get_state_property(Property::ActiveVoices).unwrap(),
        2
    );
    // Killed handles are released to detached and freed
    engine.pump();
    assert_ne!(engine.type_of(a), Some(TypeTag::Voice));
    assert_ne!(engine.type_of(b), Some(TypeTag::Voice));
    // The group itself survived
    engine.send(group, 1, &[0.5, 0.0]).unwrap();
}

#[test]
fn group_volume_scales_children() {
    let mut engine = open_engine();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    let group = engine.new_group(root).unwrap();
    engine.start(group, prg, &[0.5]).unwrap();

    engine.run(1024).unwrap();
    assert_eq!(engine.buffers()[0][1000], 0.5);

    // Halve the group volume with an immediate ramp
    engine.send(group, 1, &[0.5, 0.0]).unwrap();
    engine.run(1024).unwrap();
    let s = engine.buffers()[0][1000];
    assert!((s - 0.25).abs() < 1e-3, "group vol 0.5 gives {s}");
}

#[test]
fn kill_releases_subtree_handles() {
    let mut engine = open_engine();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    let group = engine.new_group(root).unwrap();
    let child = engine.start(group, prg, &[0.3]).unwrap();
    engine.run(1024).unwrap();

    engine.kill(group).unwrap();
    engine.run(1024).unwrap();
    engine.pump();

    assert_eq!(
        engine.get_state_property(Property::ActiveVoices).unwrap(),
        1
    );
    assert_ne!(engine.type_of(group), Some(TypeTag::Voice));
    assert_ne!(engine.type_of(child), Some(TypeTag::Voice));
    // Output returns to silence
    assert!(engine.buffers()[0].iter().all(|&s| s == 0.0));
}

#[test]
fn release_of_playing_voice_detaches() {
    let mut engine = open_engine();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    let v = engine.start(root, prg, &[0.4]).unwrap();
    engine.run(1024).unwrap();

    engine.release(v).unwrap();
    assert_eq!(engine.type_of(v), Some(TypeTag::Detached));

    // The voice plays on without its handle
    engine.run(1024).unwrap();
    assert_eq!(engine.buffers()[0][512], 0.4);

    // Once the engine acknowledges the detach, the slot is freed
    engine.pump();
    assert_eq!(engine.type_of(v), None);
}

#[test]
fn statistics_reflect_voice_tree() {
    let mut engine = open_engine();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    engine.start(root, prg, &[0.1]).unwrap();
    engine.start(root, prg, &[0.2]).unwrap();
    engine.run(1024).unwrap();

    assert_eq!(
        engine.get_state_property(Property::ActiveVoices).unwrap(),
        3
    );
    assert!(engine.get_state_property(Property::Instructions).unwrap() > 0);
    assert!(engine.get_state_property(Property::ApiMessages).unwrap() >= 2);
    let total = engine.get_state_property(Property::TotalVoices).unwrap();
    let free = engine.get_state_property(Property::FreeVoices).unwrap();
    assert_eq!(total - free, 3);
}

#[test]
fn sink_client_captures_frames() {
    let mut engine = open_engine();

    // A dc source into an xinsert tap, then on to the voice output
    let a = R_FIRST_FREE as u8;
    let mut b = ProgramBuilder::new();
    b.unit("dc", 0, 2, OutputMode::Chain).unwrap();
    b.unit("xinsert", 2, 2, OutputMode::VoiceOut).unwrap();
    b.entry(0, 1, R_FIRST_FREE).unwrap();
    b.op(Insn::Write { unit: 0, reg: 0, s: a }).unwrap();
    b.op(Insn::Sleep).unwrap();
    let prg = engine.add_program(b.build(2).unwrap()).unwrap();

    let root = engine.root_voice();
    let v = engine.start(root, prg, &[0.5]).unwrap();
    let sink = engine.open_sink(v, 4096).unwrap();

    engine.run(1024).unwrap();
    engine.run(1024).unwrap();

    let mut captured = vec![0.0f32; 512];
    let n = engine.sink_read(sink, &mut captured).unwrap();
    assert!(n > 0, "tap must deliver frames");
    // The tail of the capture has settled on the dc value
    assert_eq!(captured[n - 1], 0.5);
    assert_eq!(captured[n - 2], 0.5);
}

#[test]
fn wave_upload_and_playback() {
    use vox_dsp::{SampleFormat, WaveFlags, WaveType};

    let mut engine = open_engine();

    // One period of a sine as f32
    let sine: Vec<u8> = (0..256)
        .map(|i| ((2.0 * std::f32::consts::PI * i as f32 / 256.0).sin() * 0.8))
        .flat_map(|s| s.to_le_bytes())
        .collect();
    let wave = engine
        .upload_wave(
            WaveType::MipWave,
            256,
            WaveFlags::LOOPED,
            SampleFormat::F32,
            1,
            &sine,
        )
        .unwrap();

    // wtosc (mono) panned to both channels
    let a = R_FIRST_FREE as u8;
    let mut b = ProgramBuilder::new();
    b.unit("wtosc", 0, 1, OutputMode::Chain).unwrap();
    b.unit("panmix", 1, 2, OutputMode::VoiceOut).unwrap();
    b.entry(0, 1, R_FIRST_FREE).unwrap();
    b.op(Insn::Write { unit: 0, reg: 0, s: a }).unwrap();
    b.op(Insn::Sleep).unwrap();
    let prg = engine.add_program(b.build(2).unwrap()).unwrap();

    let root = engine.root_voice();
    engine
        .start(root, prg, &[wave as f32])
        .unwrap();
    engine.run(1024).unwrap();

    let out = &engine.buffers()[0];
    let peak = out.iter().fold(0.0f32, |p, &s| p.max(s.abs()));
    assert!(peak > 0.3, "oscillator must be audible, peak {peak}");
    let crossings = out.windows(2).filter(|w| w[0] * w[1] < 0.0).count();
    assert!(crossings > 5, "expected oscillation, {crossings} crossings");

    assert!(engine.take_faults().is_empty());
}

#[test]
fn voice_pool_exhaustion_faults_cleanly() {
    let config = Config {
        samplerate: 48000,
        buffer: 256,
        channels: 2,
        voicepool: 4,
        ..Config::default()
    };
    let mut engine =
        Engine::open_with_drivers(config, Some(Box::new(PullAudioDriver::new())), None).unwrap();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();

    for _ in 0..8 {
        engine.play(root, prg, &[0.1]).unwrap();
    }
    engine.run(256).unwrap();

    let faults = engine.take_faults();
    assert!(
        faults.iter().any(|(_, e)| *e == VoxError::VoiceAlloc),
        "pool exhaustion must be reported"
    );
    // The engine keeps running
    engine.run(256).unwrap();
}

#[test]
fn entry_point_args_set_initial_value() {
    let mut engine = open_engine();
    let prg = engine.add_program(dc_program()).unwrap();
    let root = engine.root_voice();
    engine.start(root, prg, &[0.125]).unwrap();
    engine.run(1024).unwrap();
    assert_eq!(engine.buffers()[1][1000], 0.125);
}
