// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A block reference plus `(offset, length)` identifying a subrange (design
// glossary: "Chunk"). `MCAlign` and `MBQueue` never touch a `MemBlock`
// directly — everything they push/peek/drop is a `Chunk`. `block: None`
// models §7's `HoleInQueue` observable ("chunk with null block and
// non-zero length"): a bounded gap the queue can size but has no payload
// for, distinct from a `Some(silence_marker)` chunk which has real
// (zero-filled) backing storage.

use std::sync::Arc;

use crate::block::MemBlock;

#[derive(Clone)]
pub struct Chunk {
    pub block: Option<Arc<MemBlock>>,
    pub offset: usize,
    pub len: usize,
}

impl Chunk {
    pub fn new(block: Arc<MemBlock>, offset: usize, len: usize) -> Self {
        Self {
            block: Some(block),
            offset,
            len,
        }
    }

    /// A bounded hole with no backing block — reads as zeros.
    pub fn null(len: usize) -> Self {
        Self {
            block: None,
            offset: 0,
            len,
        }
    }

    pub fn is_null(&self) -> bool {
        self.block.is_none()
    }

    pub fn is_silence(&self) -> bool {
        self.block.as_ref().is_some_and(|b| b.is_silence())
    }

    /// The end offset (exclusive) of this chunk's payload within its block.
    pub fn payload_end(&self) -> usize {
        self.offset + self.len
    }

    /// True iff `self` and `other` reference the same live block by
    /// pointer identity. Distinct `import.get()` calls for the same
    /// `shmId`/offset range never share identity, so this never
    /// silently coalesces across independent attachments (see DESIGN.md).
    pub fn same_block(&self, other: &Chunk) -> bool {
        match (&self.block, &other.block) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Copy this chunk's bytes out. Null/silence chunks read as zeros.
    pub fn to_vec(&self) -> Vec<u8> {
        match &self.block {
            Some(b) => b.read_range(self.offset, self.len),
            None => vec![0u8; self.len],
        }
    }

    /// Split into `(head, tail)` at `at` bytes from the start of this chunk.
    pub fn split_at(&self, at: usize) -> (Chunk, Chunk) {
        debug_assert!(at <= self.len);
        let head = Chunk {
            block: self.block.clone(),
            offset: self.offset,
            len: at,
        };
        let tail = Chunk {
            block: self.block.clone(),
            offset: self.offset + at,
            len: self.len - at,
        };
        (head, tail)
    }

    /// A sub-chunk `[start, start+len)` relative to this chunk's payload.
    pub fn slice(&self, start: usize, len: usize) -> Chunk {
        debug_assert!(start + len <= self.len);
        Chunk {
            block: self.block.clone(),
            offset: self.offset + start,
            len,
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("null", &self.is_null())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemPool;

    #[test]
    fn null_chunk_reads_zeros() {
        let c = Chunk::null(8);
        assert_eq!(c.to_vec(), vec![0u8; 8]);
    }

    #[test]
    fn split_preserves_bytes() {
        let pool = MemPool::fake();
        let block = pool.allocate(10).unwrap();
        block.write_at(0, b"0123456789");
        let c = Chunk::new(block, 0, 10);
        let (head, tail) = c.split_at(4);
        assert_eq!(head.to_vec(), b"0123");
        assert_eq!(tail.to_vec(), b"456789");
    }

    #[test]
    fn same_block_requires_pointer_identity() {
        let pool = MemPool::fake();
        let a = pool.allocate(4).unwrap();
        let b = pool.allocate(4).unwrap();
        let ca = Chunk::new(a.clone(), 0, 4);
        let ca2 = Chunk::new(a, 0, 4);
        let cb = Chunk::new(b, 0, 4);
        assert!(ca.same_block(&ca2));
        assert!(!ca.same_block(&cb));
    }
}
