//! wasm32 va_list layout
//!
//! Arguments are laid out in call order. 4-byte slots (`int`, pointers)
//! pack tightly; 8-byte slots (`long long`, `double`) start on an 8-byte
//! boundary, preceded by one 4-byte zero pad when needed.

use tracing::trace;

use crate::arena::{MemoryArena, SandboxMemory};
use crate::decoder::DecodeResult;
use crate::record::TypedArgument;

/// Builds the variadic argument buffer a C `vsnprintf` expects.
#[derive(Debug, Default)]
pub struct VaArgsLayoutBuilder {
    buffer: Vec<u8>,
}

impl VaArgsLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one argument. Strings are copied into the arena first.
    pub fn push<M: SandboxMemory>(
        &mut self,
        argument: &TypedArgument,
        arena: &mut MemoryArena<'_, M>,
    ) -> DecodeResult<()> {
        if argument.needs_wide_alignment() && self.buffer.len() % 8 != 0 {
            self.buffer.extend_from_slice(&[0; 4]);
        }

        match argument {
            TypedArgument::Int32(v) => self.buffer.extend_from_slice(&v.to_le_bytes()),
            TypedArgument::Int64(v) => self.buffer.extend_from_slice(&v.to_le_bytes()),
            TypedArgument::Double(v) => self.buffer.extend_from_slice(&v.to_le_bytes()),
            TypedArgument::StringRef(text) => {
                let addr = arena.alloc_c_string(text)?;
                self.buffer.extend_from_slice(&addr.to_le_bytes());
            }
        }

        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Copy the finished buffer into the arena and return its address.
    pub fn place<M: SandboxMemory>(self, arena: &mut MemoryArena<'_, M>) -> DecodeResult<u32> {
        let addr = arena.alloc_bytes(&self.buffer)?;
        trace!(addr, len = self.buffer.len(), "Placed va_list");
        Ok(addr)
    }

    /// Lay out `arguments` without placing the buffer itself.
    pub fn assemble<M: SandboxMemory>(
        arguments: &[TypedArgument],
        arena: &mut MemoryArena<'_, M>,
    ) -> DecodeResult<Vec<u8>> {
        let mut builder = Self::new();
        for argument in arguments {
            builder.push(argument, arena)?;
        }
        Ok(builder.into_bytes())
    }

    /// Lay out `arguments` and place the buffer in the arena.
    pub fn build<M: SandboxMemory>(
        arguments: &[TypedArgument],
        arena: &mut MemoryArena<'_, M>,
    ) -> DecodeResult<u32> {
        let mut builder = Self::new();
        for argument in arguments {
            builder.push(argument, arena)?;
        }
        builder.place(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::testing::RecordingMemory;
    use proptest::prelude::*;

    fn assemble(arguments: &[TypedArgument]) -> Vec<u8> {
        let mut memory = RecordingMemory::default();
        let mut arena = MemoryArena::new(&mut memory);
        VaArgsLayoutBuilder::assemble(arguments, &mut arena).unwrap()
    }

    #[test]
    fn test_int32_then_int64_pads_once() {
        let bytes = assemble(&[TypedArgument::Int32(1), TypedArgument::Int64(2)]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &1i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &[0; 4]);
        assert_eq!(&bytes[8..16], &2i64.to_le_bytes());
    }

    #[test]
    fn test_int32_then_double_pads_once() {
        let bytes = assemble(&[TypedArgument::Int32(-1), TypedArgument::Double(1.25)]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[4..8], &[0; 4]);
        assert_eq!(&bytes[8..16], &1.25f64.to_le_bytes());
    }

    #[test]
    fn test_no_padding_cases() {
        let ints = assemble(&[
            TypedArgument::Int32(1),
            TypedArgument::Int32(2),
            TypedArgument::Int32(3),
        ]);
        assert_eq!(ints.len(), 12);

        let wide_first = assemble(&[TypedArgument::Int64(1), TypedArgument::Int32(2)]);
        assert_eq!(wide_first.len(), 12);

        let double_first = assemble(&[TypedArgument::Double(1.0), TypedArgument::Double(2.0)]);
        assert_eq!(double_first.len(), 16);
    }

    #[test]
    fn test_string_is_pointer_to_c_copy() {
        let mut memory = RecordingMemory::default();
        let mut arena = MemoryArena::new(&mut memory);
        let bytes = VaArgsLayoutBuilder::assemble(
            &[TypedArgument::Int32(7), TypedArgument::StringRef("net".into())],
            &mut arena,
        )
        .unwrap();

        assert_eq!(bytes.len(), 8);
        let addr = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(arena.ledger(), &[addr]);
        assert_eq!(arena.memory().read(addr, 4).unwrap(), b"net\0");
    }

    #[test]
    fn test_build_places_buffer() {
        let mut memory = RecordingMemory::default();
        let mut arena = MemoryArena::new(&mut memory);
        let addr = VaArgsLayoutBuilder::build(&[TypedArgument::Int32(0x01020304)], &mut arena)
            .unwrap();

        assert_eq!(arena.ledger(), &[addr]);
        assert_eq!(arena.memory().read(addr, 4).unwrap(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_empty_arguments() {
        assert!(assemble(&[]).is_empty());
    }

    fn argument() -> impl Strategy<Value = TypedArgument> {
        prop_oneof![
            any::<i32>().prop_map(TypedArgument::Int32),
            any::<i64>().prop_map(TypedArgument::Int64),
            any::<f64>().prop_map(TypedArgument::Double),
            "[a-z]{0,8}".prop_map(TypedArgument::StringRef),
        ]
    }

    proptest! {
        #[test]
        fn prop_wide_slots_are_aligned(arguments in prop::collection::vec(argument(), 0..12)) {
            let bytes = assemble(&arguments);

            let mut offset = 0;
            let mut pads = 0;
            for argument in &arguments {
                if argument.needs_wide_alignment() && offset % 8 != 0 {
                    prop_assert_eq!(&bytes[offset..offset + 4], &[0u8; 4][..]);
                    offset += 4;
                    pads += 1;
                }
                if argument.needs_wide_alignment() {
                    prop_assert_eq!(offset % 8, 0);
                }
                offset += argument.slot_size();
            }

            let natural: usize = arguments.iter().map(TypedArgument::slot_size).sum();
            prop_assert_eq!(bytes.len(), offset);
            prop_assert_eq!(bytes.len(), natural + 4 * pads);
        }
    }
}
