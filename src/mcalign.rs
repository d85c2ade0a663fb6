// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Memory-chunk aligner (design §4.4). Repackages an arbitrary stream of
// pushed chunks into chunks whose length is always a multiple of `base`,
// coalescing in place when the incoming data is contiguous with the held
// residual inside the same underlying block, copying otherwise.

use crate::chunk::Chunk;
use crate::error::{MemError, Result};
use crate::pool::MemPool;
use std::sync::Arc;

pub struct MCAlign {
    base: usize,
    /// `0 <= len < base`: bytes not yet enough to emit.
    leftover: Option<Chunk>,
    /// `len >= base`, awaiting a `pop()` call to drain it.
    current: Option<Chunk>,
    pool: Arc<MemPool>,
}

impl MCAlign {
    pub fn new(base: usize, pool: Arc<MemPool>) -> Self {
        assert!(base > 0, "base must be non-zero");
        Self {
            base,
            leftover: None,
            current: None,
            pool,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Deliverable byte count for an input of `l` bytes plus the current
    /// residual, rounded down to a `base` multiple.
    pub fn csize(&self, l: usize) -> usize {
        let leftover_len = self.leftover.as_ref().map_or(0, |c| c.len);
        ((l + leftover_len) / self.base) * self.base
    }

    /// Feed `chunk` into the aligner. Fails with `ProtocolViolation` if a
    /// fully-formed `current` chunk from a previous push has not yet been
    /// drained via `pop` (the single-current-chunk API contract).
    pub fn push(&mut self, chunk: Chunk) -> Result<()> {
        if self.current.is_some() {
            return Err(MemError::ProtocolViolation(
                "MCAlign::push called before draining the pending aligned chunk",
            ));
        }
        if chunk.len == 0 {
            return Ok(());
        }

        let merged = match self.leftover.take() {
            Some(prev) => self.merge(prev, chunk),
            None => chunk,
        };

        let total = merged.len;
        let aligned_len = (total / self.base) * self.base;
        if aligned_len == 0 {
            self.leftover = Some(merged);
        } else if aligned_len == total {
            self.current = Some(merged);
        } else {
            let (head, tail) = merged.split_at(aligned_len);
            self.current = Some(head);
            self.leftover = Some(tail);
        }
        Ok(())
    }

    /// Join `prev` (the held residual) with `next` in place when they are
    /// contiguous within the same block; otherwise copy both into a fresh
    /// heap-backed chunk.
    fn merge(&self, prev: Chunk, next: Chunk) -> Chunk {
        if prev.same_block(&next) && prev.payload_end() == next.offset {
            let block = prev.block.clone().expect("same_block implies Some");
            return Chunk::new(block, prev.offset, prev.len + next.len);
        }
        let mut bytes = prev.to_vec();
        bytes.extend_from_slice(&next.to_vec());
        let len = bytes.len();
        let block = self
            .pool
            .allocate(len)
            .unwrap_or_else(|_| MemPool::fake().allocate(len).expect("heap fallback cannot fail"));
        block.write_at(0, &bytes);
        Chunk::new(block, 0, len)
    }

    /// Remove and return the pending aligned chunk, if any. `None` means
    /// "no fully-formed chunk ready" (the aligner may still hold a residual
    /// shorter than `base`).
    pub fn pop(&mut self) -> Option<Chunk> {
        self.current.take()
    }

    /// Discard all residual state without emission.
    pub fn flush(&mut self) {
        self.leftover = None;
        self.current = None;
    }

    pub fn residual_len(&self) -> usize {
        self.leftover.as_ref().map_or(0, |c| c.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmKind;

    fn test_pool() -> Arc<MemPool> {
        MemPool::new("mcalign-test", ShmKind::Private, 16 * 65536, true).unwrap()
    }

    fn chunk_of(pool: &Arc<MemPool>, bytes: &[u8]) -> Chunk {
        let block = pool.allocate(bytes.len()).unwrap();
        block.write_at(0, bytes);
        Chunk::new(block, 0, bytes.len())
    }

    #[test]
    fn scenario_s3_alignment() {
        // S3: base=5. Push "abcdefg" -> pop "abcde", residual "fg" (len 2).
        let pool = test_pool();
        let mut aligner = MCAlign::new(5, pool.clone());

        aligner.push(chunk_of(&pool, b"abcdefg")).unwrap();
        let out = aligner.pop().unwrap();
        assert_eq!(out.to_vec(), b"abcde");
        assert!(aligner.pop().is_none());
        assert_eq!(aligner.residual_len(), 2);

        aligner.push(chunk_of(&pool, b"h")).unwrap();
        assert!(aligner.pop().is_none());
        assert_eq!(aligner.residual_len(), 3);

        aligner.push(chunk_of(&pool, b"ij")).unwrap();
        let out = aligner.pop().unwrap();
        assert_eq!(out.to_vec(), b"fghij");
        assert!(aligner.pop().is_none());
        assert_eq!(aligner.residual_len(), 0);
    }

    #[test]
    fn contiguous_same_block_coalesces_without_copy() {
        let pool = test_pool();
        let mut aligner = MCAlign::new(4, pool.clone());
        let block = pool.allocate(3).unwrap();
        block.write_at(0, b"abc");
        aligner.push(Chunk::new(block.clone(), 0, 3)).unwrap();
        assert_eq!(aligner.residual_len(), 3);

        // Append using the same block so merge() takes the in-place path.
        let full = pool.allocate(6).unwrap();
        full.write_at(0, b"abcdef");
        aligner.flush();
        aligner.push(Chunk::new(full.clone(), 0, 3)).unwrap();
        aligner.push(Chunk::new(full.clone(), 3, 3)).unwrap();
        let out = aligner.pop().unwrap();
        assert_eq!(out.to_vec(), b"abcdef"[..4].to_vec());
        assert!(out.same_block(&Chunk::new(full, 0, 1)));
    }

    #[test]
    fn push_before_drain_is_rejected() {
        let pool = test_pool();
        let mut aligner = MCAlign::new(2, pool.clone());
        aligner.push(chunk_of(&pool, b"ab")).unwrap();
        assert!(aligner.current.is_some());
        let err = aligner.push(chunk_of(&pool, b"cd")).unwrap_err();
        assert!(matches!(err, MemError::ProtocolViolation(_)));
    }

    #[test]
    fn flush_discards_everything() {
        let pool = test_pool();
        let mut aligner = MCAlign::new(4, pool.clone());
        aligner.push(chunk_of(&pool, b"ab")).unwrap();
        aligner.flush();
        assert_eq!(aligner.residual_len(), 0);
        assert!(aligner.pop().is_none());
    }
}
