//! vox-engine: the realtime scripted audio engine
//!
//! ## Core modules
//! - `program` - compiled programs, entry points, unit chains, banks
//! - `vm` - the per-voice register VM with timing instructions
//! - `voice` - voice tree, unit chain assembly, audio buses
//! - `messages` - timestamped SPSC command/response queues
//! - `state` - the audio-thread processor (fragments, scheduling, mixing)
//! - `api` - the client-facing interface: handles, timestamps, verbs
//!
//! Two threads interact: the API thread owns the handle registry and
//! composes timestamped commands; the audio thread drains commands whose
//! deadlines fall inside the current buffer, advances each voice's VM in
//! slices, runs unit chains, and mixes the tree bottom-up. The only
//! shared mutable state is the queue pair and a set of statistics
//! atomics.

mod api;
mod messages;
mod program;
mod state;
mod vm;
mod voice;

pub use api::*;
pub use messages::*;
pub use program::*;
pub use state::*;
pub use vm::*;
pub use voice::*;
