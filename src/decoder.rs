//! Decode orchestration

use thiserror::Error;
use tracing::{debug, trace};

use crate::arena::{MemoryArena, SandboxMemory};
use crate::record::{unpack, TypedArgument};
use crate::vaargs::VaArgsLayoutBuilder;
use crate::wasm::engine::{SandboxImage, SandboxInstance};

pub type DecodeResult<T> = Result<T, CompactLogDecodeError>;

/// Result buffer size used by [`CompactLogDecoder::decode`]
pub const DEFAULT_MAX_RESULT_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum CompactLogDecodeError {
    #[error("Malformed record: {0}")]
    MalformedRecordError(String),

    #[error("Unhashable map key under tag {tag}")]
    UnhashableTagError { tag: u64 },

    #[error("Render fault: {0}")]
    RenderFaultError(String),

    #[error("Sandbox error: {0}")]
    SandboxError(String),

    #[error("Sandbox memory access out of bounds: {len} bytes at {addr:#x}")]
    MemoryError { addr: u32, len: usize },

    #[error("Sandbox allocation of {requested} bytes failed")]
    AllocationError { requested: usize },

    #[error("Result length {0} exceeds the sandbox address space")]
    LimitError(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Decodes compact log records by rendering them inside a sandbox
pub struct CompactLogDecoder {
    instance: SandboxInstance,
}

impl CompactLogDecoder {
    /// Create a decoder on the process-wide sandbox image
    pub fn new() -> DecodeResult<Self> {
        Self::with_image(SandboxImage::shared()?)
    }

    /// Create a decoder on a specific image
    pub fn with_image(image: &SandboxImage) -> DecodeResult<Self> {
        Ok(Self {
            instance: image.instantiate()?,
        })
    }

    /// Decode a compact record against its format string
    pub fn decode(&mut self, format: &str, record: &[u8]) -> DecodeResult<Vec<u8>> {
        self.decode_with_limit(format, record, DEFAULT_MAX_RESULT_LEN)
    }

    /// Decode with a result buffer of `max_result_len` bytes, terminator included
    pub fn decode_with_limit(
        &mut self,
        format: &str,
        record: &[u8],
        max_result_len: usize,
    ) -> DecodeResult<Vec<u8>> {
        let record = unpack(record)?;
        debug!(
            format_id = record.format_id,
            arguments = record.arguments.len(),
            "Unpacked"
        );
        self.render(format, &record.arguments, max_result_len)
    }

    /// Render already typed arguments
    pub fn decode_from_arguments(
        &mut self,
        format: &str,
        arguments: &[TypedArgument],
    ) -> DecodeResult<Vec<u8>> {
        self.decode_from_arguments_with_limit(format, arguments, DEFAULT_MAX_RESULT_LEN)
    }

    pub fn decode_from_arguments_with_limit(
        &mut self,
        format: &str,
        arguments: &[TypedArgument],
        max_result_len: usize,
    ) -> DecodeResult<Vec<u8>> {
        self.render(format, arguments, max_result_len)
    }

    /// Blocks currently allocated inside the sandbox
    pub fn live_allocations(&mut self) -> DecodeResult<u32> {
        self.instance.live_allocations()
    }

    /// Sandbox allocations requested over the decoder's lifetime
    pub fn allocations_requested(&self) -> u64 {
        self.instance.allocations_requested()
    }

    fn render(
        &mut self,
        format: &str,
        arguments: &[TypedArgument],
        max_result_len: usize,
    ) -> DecodeResult<Vec<u8>> {
        let cap = u32::try_from(max_result_len)
            .map_err(|_| CompactLogDecodeError::LimitError(max_result_len))?;

        let mut arena = MemoryArena::new(&mut self.instance);
        trace!("ArenaOpen");

        let rendered = render_in(&mut arena, format, arguments, cap);
        let released = arena.release_all();
        debug!(ok = rendered.is_ok(), "Released");

        let text = rendered?;
        released?;
        Ok(text)
    }
}

fn render_in(
    arena: &mut MemoryArena<'_, SandboxInstance>,
    format: &str,
    arguments: &[TypedArgument],
    cap: u32,
) -> DecodeResult<Vec<u8>> {
    let format_addr = arena.alloc_c_string(format)?;
    let result_addr = arena.alloc_zeroed(cap as usize)?;
    let va_addr = VaArgsLayoutBuilder::build(arguments, arena)?;
    trace!(format_addr, result_addr, va_addr, "BuffersBuilt");

    let natural_len = arena
        .memory_mut()
        .render(result_addr, cap, format_addr, va_addr)?;
    trace!(natural_len, truncated = natural_len >= cap, "Rendered");

    let mut text = arena.memory().read(result_addr, cap as usize)?;
    if let Some(end) = text.iter().position(|&b| b == 0) {
        text.truncate(end);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CompactLogDecodeError::UnhashableTagError { tag: 6 };
        assert_eq!(err.to_string(), "Unhashable map key under tag 6");

        let err = CompactLogDecodeError::MemoryError { addr: 0x10, len: 4 };
        assert!(err.to_string().contains("0x10"));
    }

    #[test]
    fn test_decoder_creation() {
        let mut decoder = CompactLogDecoder::new().unwrap();
        assert_eq!(decoder.live_allocations().unwrap(), 0);
    }

    #[test]
    fn test_decode_integer_record() {
        let mut decoder = CompactLogDecoder::new().unwrap();
        let text = decoder
            .decode("An Integer Format String: %d", &[0x82, 0x0A, 0x0B])
            .unwrap();
        assert_eq!(text, b"An Integer Format String: 11");
        assert_eq!(decoder.live_allocations().unwrap(), 0);
        // format string, result buffer, va_list
        assert_eq!(decoder.allocations_requested(), 3);
    }

    #[test]
    fn test_malformed_record_never_allocates() {
        let mut decoder = CompactLogDecoder::new().unwrap();
        let records: [&[u8]; 4] = [
            &[],
            &[0x80],
            &[0x82, 0xF9, 0x3C, 0x00, 0x01],
            &[0x82, 0x0A, 0xA0],
        ];
        for record in records {
            let result = decoder.decode("%d", record);
            assert!(result.is_err(), "{record:02x?}");
        }
        assert_eq!(decoder.allocations_requested(), 0);
        assert_eq!(decoder.live_allocations().unwrap(), 0);
    }

    #[test]
    fn test_limit_beyond_address_space() {
        let mut decoder = CompactLogDecoder::new().unwrap();
        if let Ok(limit) = usize::try_from(u64::from(u32::MAX) + 1) {
            let result = decoder.decode_from_arguments_with_limit("x", &[], limit);
            assert!(matches!(result, Err(CompactLogDecodeError::LimitError(_))));
        }
        assert_eq!(decoder.live_allocations().unwrap(), 0);
    }
}
