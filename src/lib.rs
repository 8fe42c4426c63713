//! Compact Log Decoder
//!
//! Reconstructs log lines from compact binary records emitted by embedded
//! devices. Arguments are laid out as a wasm32 C va_list and the firmware's
//! printf-style format string is rendered inside a WebAssembly sandbox.

pub mod arena;
pub mod decoder;
pub mod record;
pub mod vaargs;
pub mod wasm;

pub use arena::{MemoryArena, SandboxMemory};
pub use decoder::{
    CompactLogDecodeError, CompactLogDecoder, DecodeResult, DEFAULT_MAX_RESULT_LEN,
};
pub use record::{CompactRecord, TypedArgument};
pub use vaargs::VaArgsLayoutBuilder;
pub use wasm::{EngineConfig, SandboxImage, SandboxInstance};
