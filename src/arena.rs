//! Scoped allocations inside sandbox linear memory
//!
//! A [`MemoryArena`] records every block it hands out and frees all of them
//! exactly once, either through [`MemoryArena::release_all`] or when dropped.

use tracing::{trace, warn};

use crate::decoder::DecodeResult;

/// Allocator and byte access of a sandbox's linear memory.
pub trait SandboxMemory {
    /// Allocate `len` bytes and return the block address.
    fn alloc(&mut self, len: usize) -> DecodeResult<u32>;

    fn free(&mut self, addr: u32) -> DecodeResult<()>;

    fn write(&mut self, addr: u32, bytes: &[u8]) -> DecodeResult<()>;

    fn read(&self, addr: u32, len: usize) -> DecodeResult<Vec<u8>>;
}

/// Allocation ledger for one render.
pub struct MemoryArena<'m, M: SandboxMemory> {
    memory: &'m mut M,
    ledger: Vec<u32>,
}

impl<'m, M: SandboxMemory> MemoryArena<'m, M> {
    pub fn new(memory: &'m mut M) -> Self {
        Self {
            memory,
            ledger: Vec::new(),
        }
    }

    /// Allocate `len` bytes and record the block.
    pub fn alloc(&mut self, len: usize) -> DecodeResult<u32> {
        let addr = self.memory.alloc(len)?;
        self.ledger.push(addr);
        trace!(addr, len, "Arena allocation");
        Ok(addr)
    }

    /// Allocate a block holding a copy of `bytes`.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> DecodeResult<u32> {
        let addr = self.alloc(bytes.len())?;
        self.memory.write(addr, bytes)?;
        Ok(addr)
    }

    /// Allocate a NUL-terminated copy of `text`.
    pub fn alloc_c_string(&mut self, text: &str) -> DecodeResult<u32> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        self.alloc_bytes(&bytes)
    }

    /// Allocate `len` bytes cleared to zero.
    pub fn alloc_zeroed(&mut self, len: usize) -> DecodeResult<u32> {
        let addr = self.alloc(len)?;
        self.memory.write(addr, &vec![0; len])?;
        Ok(addr)
    }

    /// Addresses allocated and not yet released.
    pub fn ledger(&self) -> &[u32] {
        &self.ledger
    }

    pub fn memory(&self) -> &M {
        &*self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut *self.memory
    }

    /// Free every recorded block, newest first.
    ///
    /// Keeps going past failed frees and reports the first one. The ledger
    /// is empty afterwards either way.
    pub fn release_all(&mut self) -> DecodeResult<()> {
        let ledger = std::mem::take(&mut self.ledger);
        let mut first_error = None;

        for addr in ledger.into_iter().rev() {
            if let Err(e) = self.memory.free(addr) {
                warn!(addr, error = %e, "Failed to free sandbox block");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<M: SandboxMemory> Drop for MemoryArena<'_, M> {
    fn drop(&mut self) {
        if self.ledger.is_empty() {
            return;
        }
        if let Err(e) = self.release_all() {
            warn!(error = %e, "Arena release on drop failed");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingMemory;
    use super::*;
    use crate::decoder::CompactLogDecodeError;

    #[test]
    fn test_release_all_frees_every_block() {
        let mut memory = RecordingMemory::default();
        let mut arena = MemoryArena::new(&mut memory);

        let a = arena.alloc(4).unwrap();
        let b = arena.alloc_c_string("hi").unwrap();
        let c = arena.alloc_zeroed(16).unwrap();
        assert_eq!(arena.ledger(), &[a, b, c]);

        arena.release_all().unwrap();
        assert!(arena.ledger().is_empty());
        drop(arena);

        assert_eq!(memory.frees, vec![c, b, a]);
        assert_eq!(memory.live(), 0);
    }

    #[test]
    fn test_drop_releases() {
        let mut memory = RecordingMemory::default();
        {
            let mut arena = MemoryArena::new(&mut memory);
            arena.alloc(1).unwrap();
            arena.alloc(2).unwrap();
        }
        assert_eq!(memory.frees.len(), 2);
        assert_eq!(memory.live(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut memory = RecordingMemory::default();
        {
            let mut arena = MemoryArena::new(&mut memory);
            arena.alloc(8).unwrap();
            arena.release_all().unwrap();
            arena.release_all().unwrap();
        }
        assert_eq!(memory.frees.len(), 1);
    }

    #[test]
    fn test_release_continues_past_failure() {
        let mut memory = RecordingMemory::default();
        let failing;
        {
            let mut arena = MemoryArena::new(&mut memory);
            arena.alloc(1).unwrap();
            failing = arena.alloc(1).unwrap();
            arena.alloc(1).unwrap();
            arena.memory_mut().fail_free = Some(failing);

            let result = arena.release_all();
            assert!(matches!(result, Err(CompactLogDecodeError::SandboxError(_))));
            assert!(arena.ledger().is_empty());
        }
        assert_eq!(memory.frees.len(), 3);
        assert_eq!(memory.live(), 1);
    }

    #[test]
    fn test_contents_written() {
        let mut memory = RecordingMemory::default();
        let mut arena = MemoryArena::new(&mut memory);

        let text = arena.alloc_c_string("abc").unwrap();
        let zeros = arena.alloc_zeroed(3).unwrap();
        assert_eq!(arena.memory().read(text, 4).unwrap(), b"abc\0");
        assert_eq!(arena.memory().read(zeros, 3).unwrap(), vec![0; 3]);
    }

    #[test]
    fn test_failed_allocation_not_recorded() {
        let mut memory = RecordingMemory::failing_after(1);
        {
            let mut arena = MemoryArena::new(&mut memory);

            arena.alloc(4).unwrap();
            assert!(matches!(
                arena.alloc(4),
                Err(CompactLogDecodeError::AllocationError { requested: 4 })
            ));
            assert_eq!(arena.ledger().len(), 1);
        }
        assert_eq!(memory.allocations(), 1);
        assert_eq!(memory.frees.len(), 1);
        assert_eq!(memory.live(), 0);
    }
}
