//! Error types for the VOX engine

use thiserror::Error;

/// Engine error taxonomy
///
/// API calls return these synchronously. Audio-thread errors are never
/// raised across the thread boundary; they are logged, attributed to the
/// offending voice, and reported through the response queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxError {
    // Handle registry
    #[error("destruction refused; handle remains allocated")]
    Refuse,
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of handle address space")]
    OutOfHandles,
    #[error("handle has no physical representation")]
    InvalidHandle,
    #[error("handle already returned to the free pool")]
    FreeHandle,
    #[error("released handle used by API")]
    DeadHandle,

    // VM
    #[error("program ended normally")]
    End,
    #[error("VM overload; too many instructions back-to-back")]
    Overload,
    #[error("illegal VM opcode")]
    IllegalOp,
    #[error("API message arrived late to engine context")]
    LateMessage,
    #[error("too many arguments to program")]
    ManyArgs,
    #[error("division by zero")]
    DivByZero,
    #[error("jump would cause infinite loop")]
    InfLoop,
    #[error("value does not fit in numeric type")]
    Overflow,
    #[error("value too small; would truncate to zero")]
    Underflow,
    #[error("value out of range")]
    ValueRange,
    #[error("index out of range")]
    IndexRange,
    #[error("out of VM registers")]
    OutOfRegs,
    #[error("function uses too many VM registers")]
    LargeFrame,

    // Streams and I/O
    #[error("error opening file or device")]
    Open,
    #[error("error reading file or stream")]
    Read,
    #[error("error writing file or stream")]
    Write,
    #[error("stream closed by the other party")]
    StreamClosed,
    #[error("object is read-only")]
    ReadOnly,
    #[error("object is write-only")]
    WriteOnly,

    // Voice graph
    #[error("could not allocate voice")]
    VoiceAlloc,
    #[error("could not initialize voice")]
    VoiceInit,
    #[error("subvoice nesting depth exceeded")]
    VoiceNest,
    #[error("input and output counts don't match")]
    IoDontMatch,
    #[error("voice has too few channels for unit")]
    FewChannels,
    #[error("could not initialize unit instance")]
    UnitInit,
    #[error("voice has no units")]
    NoUnits,
    #[error("voice cannot have multiple inline units")]
    MultiInline,
    #[error("unit input count does not match chain")]
    ChainMismatch,
    #[error("final unit must send to voice output")]
    NoOutput,
    #[error("outputs wired to nothing; no inputs downstream")]
    BlindChain,
    #[error("object not found")]
    NotFound,
    #[error("invalid program entry point")]
    BadEntry,
    #[error("voice does not exist, or bad voice id")]
    BadVoice,
    #[error("wrong type of data or object")]
    WrongType,
    #[error("object is already assigned to this bank")]
    IsAssigned,

    // Drivers
    #[error("no driver of the required type available")]
    NoDriver,
    #[error("specified driver not found")]
    DriverNotFound,
    #[error("error opening device")]
    DeviceOpen,
    #[error("device is already open")]
    AlreadyOpen,
    #[error("unsupported audio sample rate")]
    BadSampleRate,
    #[error("unsupported audio buffer size")]
    BadBufSize,
    #[error("unsupported audio channel count")]
    BadChannels,

    // Compatibility
    #[error("operation or feature not implemented")]
    NotImplemented,
    #[error("linked library incompatible with application")]
    BadLibVersion,

    #[error("internal error")]
    Internal,
}

/// Result type alias
pub type VoxResult<T> = Result<T, VoxError>;
