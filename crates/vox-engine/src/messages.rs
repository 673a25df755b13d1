//! Timestamped command and response queues
//!
//! Two bounded SPSC rings connect the API thread and the audio thread:
//! commands flow in with sample-accurate deadlines, responses flow back
//! with voice lifecycle events and payloads to dispose of on the API
//! side. The audio thread never blocks on either ring; a full response
//! ring degrades to dropping the payload in place.

use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};

use vox_core::{Handle, Property, Timestamp, VoxError};
use vox_dsp::{SinkTap, Wave};

use crate::vm::ArgVec;
use crate::voice::Voice;

// ═══════════════════════════════════════════════════════════════════════════
// COMMANDS (API → audio)
// ═══════════════════════════════════════════════════════════════════════════

/// Command bodies executed on the audio thread
///
/// Voices arrive ready-made: the API thread builds them (units, buses,
/// VM state) and the audio thread only installs the pointer, so no
/// general-purpose allocation happens inside the Process pass.
pub enum ApiCmd {
    /// Install a pre-built voice as a subvoice of `parent`
    Start {
        parent: Handle,
        voice: Box<Voice>,
    },
    /// As Start, without a handle (detached voice)
    Play {
        parent: Handle,
        voice: Box<Voice>,
    },
    /// Send a message to an entry point of the voice behind `voice`
    Send {
        voice: Handle,
        ep: u8,
        args: ArgVec,
    },
    /// Send a message to all subvoices of the voice behind `voice`
    SendSub {
        voice: Handle,
        ep: u8,
        args: ArgVec,
    },
    /// Tear down the voice and its subtree
    Kill { voice: Handle },
    /// Tear down the subtree, sparing the voice itself
    KillSub { voice: Handle },
    /// Drop the handle→voice association (the voice plays on)
    Detach { voice: Handle },
    /// Install or remove a wave in the realtime wave table
    SetWave {
        index: i32,
        wave: Option<Arc<Wave>>,
    },
    /// Attach a sink client ring to the first tap unit of a voice
    AttachSink { voice: Handle, tap: SinkTap },
    /// Update an engine-side tunable state property
    SetProp { prop: Property, value: i32 },
}

/// A command with its deadline
pub struct ApiMessage {
    pub when: Timestamp,
    pub cmd: ApiCmd,
}

// ═══════════════════════════════════════════════════════════════════════════
// RESPONSES (audio → API)
// ═══════════════════════════════════════════════════════════════════════════

/// Payloads returned to the API thread so deallocation never happens in
/// the audio callback
pub enum Disposable {
    Wave(Arc<Wave>),
    /// A torn-down voice, shipped whole: its unit chain and any buses
    /// the realtime pool had no room for free over here
    Voice(Box<Voice>),
}

/// Events and payloads posted back to the API thread
pub enum EngineResponse {
    /// The voice's program ended; its handle should flip to detached
    VoiceEnded { handle: Handle },
    /// The voice was killed; its handle should flip to detached
    VoiceKilled { handle: Handle },
    /// Detach acknowledged; the handle can be freed
    Detached { handle: Handle },
    /// An audio-thread error, attributed to a voice where possible
    Fault { handle: Handle, error: VoxError },
    /// Free this on the API thread
    Dispose(Disposable),
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE CONSTRUCTION
// ═══════════════════════════════════════════════════════════════════════════

pub struct ApiSide {
    pub commands: Producer<ApiMessage>,
    pub responses: Consumer<EngineResponse>,
}

pub struct EngineSide {
    pub commands: Consumer<ApiMessage>,
    pub responses: Producer<EngineResponse>,
}

/// Create the SPSC pair sized to the configured event pool
pub fn queue_pair(capacity: usize) -> (ApiSide, EngineSide) {
    let (cmd_tx, cmd_rx) = RingBuffer::new(capacity);
    let (resp_tx, resp_rx) = RingBuffer::new(capacity);
    (
        ApiSide {
            commands: cmd_tx,
            responses: resp_rx,
        },
        EngineSide {
            commands: cmd_rx,
            responses: resp_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_order_preserved() {
        let (mut api, mut engine) = queue_pair(16);
        for i in 0..4u32 {
            api.commands
                .push(ApiMessage {
                    when: Timestamp(i * 256),
                    cmd: ApiCmd::Kill { voice: i as Handle },
                })
                .ok()
                .unwrap();
        }
        for i in 0..4u32 {
            let m = engine.commands.pop().unwrap();
            assert_eq!(m.when, Timestamp(i * 256));
        }
        assert!(engine.commands.pop().is_err());
    }

    #[test]
    fn test_bounded_capacity() {
        let (mut api, _engine) = queue_pair(2);
        assert!(api
            .commands
            .push(ApiMessage {
                when: Timestamp::ZERO,
                cmd: ApiCmd::Kill { voice: 1 },
            })
            .is_ok());
        assert!(api
            .commands
            .push(ApiMessage {
                when: Timestamp::ZERO,
                cmd: ApiCmd::Kill { voice: 2 },
            })
            .is_ok());
        // Full: push must fail instead of blocking
        assert!(api
            .commands
            .push(ApiMessage {
                when: Timestamp::ZERO,
                cmd: ApiCmd::Kill { voice: 3 },
            })
            .is_err());
    }

    #[test]
    fn test_response_roundtrip() {
        let (mut api, mut engine) = queue_pair(8);
        engine
            .responses
            .push(EngineResponse::VoiceEnded { handle: 5 })
            .ok()
            .unwrap();
        match api.responses.pop().unwrap() {
            EngineResponse::VoiceEnded { handle } => assert_eq!(handle, 5),
            _ => panic!("wrong response"),
        }
    }
}
