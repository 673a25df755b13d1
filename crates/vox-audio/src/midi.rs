//! MIDI driver contract and built-in drivers
//!
//! A MIDI driver wires channels to handler voices and polls events once
//! per buffer. Events are translated to `(msg, channel, arg1, arg2)`
//! messages for entry point 7 of the wired voice: note pitch maps to
//! linear pitch ((note - 60) / 12), velocities and control values
//! normalize to [0, 1], and pitch bend to [-1, 1].

use vox_core::{Handle, VoxError, VoxResult};

/// MIDI message type ids as seen by handler programs
pub const MSG_NOTEOFF: f32 = 0.0;
pub const MSG_NOTEON: f32 = 1.0;
pub const MSG_AFTERTOUCH: f32 = 2.0;
pub const MSG_CONTROLCHANGE: f32 = 3.0;
pub const MSG_PROGRAMCHANGE: f32 = 4.0;
pub const MSG_CHANNELPRESSURE: f32 = 5.0;
pub const MSG_PITCHBEND: f32 = 6.0;

/// A channel-level MIDI message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOff { pitch: u8, velocity: u8 },
    NoteOn { pitch: u8, velocity: u8 },
    Aftertouch { pitch: u8, pressure: u8 },
    ControlChange { control: u8, value: u8 },
    ProgramChange { program: u8 },
    ChannelPressure { pressure: u8 },
    /// Signed 14-bit bend amount (-8192..=8191)
    PitchBend { amount: i16 },
}

/// An event resolved to its handler voice
#[derive(Debug, Clone, Copy)]
pub struct MidiEvent {
    pub voice: Handle,
    pub channel: u8,
    pub message: MidiMessage,
}

impl MidiEvent {
    /// Translate to the (msg, channel, arg1, arg2) handler arguments
    pub fn args(&self) -> [f32; 4] {
        let ch = self.channel as f32;
        match self.message {
            MidiMessage::NoteOff { pitch, velocity } => {
                [MSG_NOTEOFF, ch, note_pitch(pitch), norm(velocity)]
            }
            MidiMessage::NoteOn { pitch, velocity } => {
                [MSG_NOTEON, ch, note_pitch(pitch), norm(velocity)]
            }
            MidiMessage::Aftertouch { pitch, pressure } => {
                [MSG_AFTERTOUCH, ch, note_pitch(pitch), norm(pressure)]
            }
            MidiMessage::ControlChange { control, value } => {
                [MSG_CONTROLCHANGE, ch, control as f32, norm(value)]
            }
            MidiMessage::ProgramChange { program } => {
                [MSG_PROGRAMCHANGE, ch, program as f32, 0.0]
            }
            MidiMessage::ChannelPressure { pressure } => {
                [MSG_CHANNELPRESSURE, ch, norm(pressure), 0.0]
            }
            MidiMessage::PitchBend { amount } => {
                [MSG_PITCHBEND, ch, amount as f32 / 8192.0, 0.0]
            }
        }
    }
}

/// MIDI note number to linear pitch; 60 (middle C) maps to 0.0
#[inline]
fn note_pitch(note: u8) -> f32 {
    (note as f32 - 60.0) / 12.0
}

#[inline]
fn norm(v: u8) -> f32 {
    v as f32 / 127.0
}

/// MIDI input contract
pub trait MidiDriver: Send {
    fn name(&self) -> &'static str;

    /// Wire a MIDI channel (0..15, or -1 for all) to a handler voice.
    /// A negative voice handle disconnects the channel.
    fn connect(&mut self, channel: i32, voice: Handle) -> VoxResult<()>;

    /// Deliver pending events; called once per buffer from the engine
    /// context
    fn poll(&mut self, frames: u32, deliver: &mut dyn FnMut(MidiEvent));
}

// ═══════════════════════════════════════════════════════════════════════════
// BUILT-INS
// ═══════════════════════════════════════════════════════════════════════════

/// MIDI driver that never delivers anything
#[derive(Default)]
pub struct NullMidiDriver {
    wiring: [Handle; 16],
}

impl MidiDriver for NullMidiDriver {
    fn name(&self) -> &'static str {
        "null"
    }

    fn connect(&mut self, channel: i32, voice: Handle) -> VoxResult<()> {
        connect_wiring(&mut self.wiring, channel, voice)
    }

    fn poll(&mut self, _frames: u32, _deliver: &mut dyn FnMut(MidiEvent)) {}
}

/// MIDI driver fed programmatically; events queue up between polls.
///
/// This is the bridge for applications that receive MIDI from their own
/// API: push raw channel messages with [`feed`](Self::feed), and the
/// engine picks them up at the next buffer.
pub struct BufferMidiDriver {
    wiring: [Handle; 16],
    queue: Vec<(u8, MidiMessage)>,
}

impl BufferMidiDriver {
    pub fn new() -> Self {
        Self {
            wiring: [-1; 16],
            queue: Vec::new(),
        }
    }

    pub fn feed(&mut self, channel: u8, message: MidiMessage) {
        self.queue.push((channel & 15, message));
    }
}

impl Default for BufferMidiDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiDriver for BufferMidiDriver {
    fn name(&self) -> &'static str {
        "buffer"
    }

    fn connect(&mut self, channel: i32, voice: Handle) -> VoxResult<()> {
        connect_wiring(&mut self.wiring, channel, voice)
    }

    fn poll(&mut self, _frames: u32, deliver: &mut dyn FnMut(MidiEvent)) {
        for (channel, message) in self.queue.drain(..) {
            let voice = self.wiring[channel as usize];
            if voice < 0 {
                // Unwired channel: events are dropped
                continue;
            }
            deliver(MidiEvent {
                voice,
                channel,
                message,
            });
        }
    }
}

fn connect_wiring(wiring: &mut [Handle; 16], channel: i32, voice: Handle) -> VoxResult<()> {
    match channel {
        -1 => {
            wiring.fill(voice);
            Ok(())
        }
        0..=15 => {
            wiring[channel as usize] = voice;
            Ok(())
        }
        _ => Err(VoxError::ValueRange),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_translation() {
        let ev = MidiEvent {
            voice: 3,
            channel: 2,
            message: MidiMessage::NoteOn {
                pitch: 72,
                velocity: 127,
            },
        };
        let a = ev.args();
        assert_eq!(a[0], MSG_NOTEON);
        assert_eq!(a[1], 2.0);
        // One octave above middle C
        assert!((a[2] - 1.0).abs() < 1e-6);
        assert!((a[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pitch_bend_range() {
        let full_up = MidiEvent {
            voice: 1,
            channel: 0,
            message: MidiMessage::PitchBend { amount: 8191 },
        };
        assert!(full_up.args()[2] > 0.99);
        let full_down = MidiEvent {
            voice: 1,
            channel: 0,
            message: MidiMessage::PitchBend { amount: -8192 },
        };
        assert_eq!(full_down.args()[2], -1.0);
    }

    #[test]
    fn test_buffer_driver_wiring() {
        let mut d = BufferMidiDriver::new();
        d.connect(5, 42).unwrap();
        d.feed(5, MidiMessage::NoteOn {
            pitch: 60,
            velocity: 100,
        });
        d.feed(6, MidiMessage::NoteOn {
            pitch: 61,
            velocity: 100,
        });

        let mut seen = Vec::new();
        d.poll(256, &mut |ev| seen.push(ev));
        // Only the wired channel delivers
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].voice, 42);
        assert_eq!(seen[0].channel, 5);
    }

    #[test]
    fn test_connect_all_and_disconnect() {
        let mut d = BufferMidiDriver::new();
        d.connect(-1, 9).unwrap();
        d.feed(0, MidiMessage::ChannelPressure { pressure: 64 });
        let mut seen = 0;
        d.poll(64, &mut |_| seen += 1);
        assert_eq!(seen, 1);

        d.connect(0, -1).unwrap();
        d.feed(0, MidiMessage::ChannelPressure { pressure: 64 });
        let mut seen = 0;
        d.poll(64, &mut |_| seen += 1);
        assert_eq!(seen, 0);

        assert!(d.connect(16, 1).is_err());
    }
}
