// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Memory pool (design §4.2). Partitions one `ShmSegment` into fixed-size
// slots, maintains a lock-free free-list of available slots, collects
// per-type statistics, and is the allocation authority for `MemBlock`s.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::block::{BlockStorage, MemBlock, PoolExternalHeader, POOL_HEADER_RESERVE};
use crate::error::{MemError, Result};
use crate::export::MemExport;
use crate::import::MemImport;
use crate::semaphore::Semaphore;
use crate::shm::{ShmKind, ShmSegment};
use crate::stats::PoolStats;

/// `sizeHint == 0` default: 1024 blocks of 64 KiB each (§6).
pub(crate) const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
const DEFAULT_BLOCK_COUNT: u32 = 1024;

/// Whether `allocate()` falls back to a heap (`Appended`) block when the
/// pool is full / the request doesn't fit a slot, or reports the failure.
/// §9's "Resolved" note: the fake adaptor pool is the only pool built with
/// `HeapFallback` by default; every explicitly-constructed pool is
/// `PoolOnly` unless a caller asks otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    PoolOnly,
    HeapFallback,
}

const NIL: u32 = u32::MAX;

fn pack(tag: u32, idx: u32) -> u64 {
    ((tag as u64) << 32) | idx as u64
}

fn unpack(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

/// Bounded lock-free free-list: an array-backed Treiber stack over slot
/// indices, with a generation tag packed alongside the head index to dodge
/// the ABA problem on CAS retry (§9: "crossbeam-style array-backed stack").
struct FreeList {
    head: AtomicU64,
    next: Vec<AtomicU32>,
}

impl FreeList {
    fn new(capacity: usize) -> Self {
        Self {
            head: AtomicU64::new(pack(0, NIL)),
            next: (0..capacity).map(|_| AtomicU32::new(NIL)).collect(),
        }
    }

    fn push(&self, idx: u32) {
        let mut backoff = 0u32;
        loop {
            let old = self.head.load(Ordering::Acquire);
            let (tag, old_idx) = unpack(old);
            self.next[idx as usize].store(old_idx, Ordering::Release);
            let new = pack(tag.wrapping_add(1), idx);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            crate::spin_lock::adaptive_yield_pub(&mut backoff);
        }
    }

    fn pop(&self) -> Option<u32> {
        let mut backoff = 0u32;
        loop {
            let old = self.head.load(Ordering::Acquire);
            let (tag, idx) = unpack(old);
            if idx == NIL {
                return None;
            }
            let next_idx = self.next[idx as usize].load(Ordering::Acquire);
            let new = pack(tag.wrapping_add(1), next_idx);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(idx);
            }
            crate::spin_lock::adaptive_yield_pub(&mut backoff);
        }
    }
}

/// Round `len` up toward the next power of two, then halve the excess over
/// `len` — the growth policy §4.2 describes for growable allocations
/// (avoids handing back a full doubling when a caller will likely append
/// only a little more than `len`), capped at what the slot can hold.
fn growth_capacity(len: usize, slot_capacity: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let pow2 = len.next_power_of_two();
    let candidate = pow2 - (pow2 - len) / 2;
    candidate.min(slot_capacity)
}

pub struct MemPool {
    name: String,
    segment: ShmSegment,
    block_size: usize,
    block_count: u32,
    is_global: bool,
    is_remote_writable: bool,
    n_init: AtomicU32,
    free_list: FreeList,
    alloc_policy: AllocPolicy,
    imports: Mutex<Vec<Weak<MemImport>>>,
    exports: Mutex<Vec<Weak<MemExport>>>,
    semaphore: Semaphore,
    stats: PoolStats,
}

impl MemPool {
    /// Explicit construction: `name` is the debug identifier and, for
    /// shared kinds, the POSIX-shared name prefix. `size_hint == 0` selects
    /// the default (1024 × 64 KiB); otherwise rounded to page multiples of
    /// the default block size with a minimum of 2 blocks. `per_client`
    /// governs `is_global` (its complement, §6).
    pub fn new(name: &str, kind: ShmKind, size_hint: usize, per_client: bool) -> Result<Arc<Self>> {
        let block_size = DEFAULT_BLOCK_SIZE;
        let requested = if size_hint == 0 {
            DEFAULT_BLOCK_COUNT as usize * block_size
        } else {
            size_hint
        };
        let wanted_blocks = (requested / block_size).max(2);
        let segment = ShmSegment::create(name, kind, wanted_blocks * block_size, 0o666)?;
        let block_count = (segment.size() / block_size) as u32;

        log::debug!(
            "pool '{name}': {block_count} slots of {block_size} bytes ({:?}, global={})",
            kind,
            !per_client
        );

        Ok(Arc::new(Self {
            name: name.to_string(),
            segment,
            block_size,
            block_count,
            is_global: !per_client,
            is_remote_writable: false,
            n_init: AtomicU32::new(0),
            free_list: FreeList::new(block_count as usize),
            alloc_policy: AllocPolicy::PoolOnly,
            imports: Mutex::new(Vec::new()),
            exports: Mutex::new(Vec::new()),
            semaphore: Semaphore::new(0),
            stats: PoolStats::new(),
        }))
    }

    /// The process-wide sentinel pool used whenever callers allocate
    /// without naming a pool (§4.2's "fake adaptor"): every block needs a
    /// non-null owning pool, and blocks allocated through this one always
    /// land on the heap (`Appended`), since it carries zero slots.
    pub fn fake() -> Arc<Self> {
        static FAKE: OnceLock<Arc<MemPool>> = OnceLock::new();
        FAKE.get_or_init(|| {
            let segment = ShmSegment::create("fake-adaptor", ShmKind::Private, 4096, 0o666)
                .expect("private segment allocation cannot fail under normal operation");
            Arc::new(MemPool {
                name: "fake-adaptor".to_string(),
                segment,
                block_size: DEFAULT_BLOCK_SIZE,
                block_count: 0,
                is_global: false,
                is_remote_writable: false,
                n_init: AtomicU32::new(0),
                free_list: FreeList::new(0),
                alloc_policy: AllocPolicy::HeapFallback,
                imports: Mutex::new(Vec::new()),
                exports: Mutex::new(Vec::new()),
                semaphore: Semaphore::new(0),
                stats: PoolStats::new(),
            })
        })
        .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_global(&self) -> bool {
        self.is_global
    }

    pub fn is_remote_writable(&self) -> bool {
        self.is_remote_writable
    }

    pub fn set_remote_writable(&mut self, writable: bool) {
        self.is_remote_writable = writable;
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn segment_id(&self) -> u32 {
        self.segment.id()
    }

    pub fn segment_kind(&self) -> ShmKind {
        self.segment.kind()
    }

    /// POSIX-shared segment name a peer needs to attach via
    /// [`crate::import::MemImport::get`]; `None` for `Private`/`MemfdShared`
    /// (the latter is advertised by file descriptor instead, via
    /// [`crate::import::MemImport::attach_memfd`]).
    pub fn segment_name(&self) -> Option<&str> {
        self.segment.name()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub(crate) fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    /// Largest payload a single slot can carry through the `Pool` variant
    /// (header reserved in-slot). `PoolExternal` gets the full slot since
    /// its header lives on the heap instead.
    pub fn block_size_max(&self) -> usize {
        self.block_size.saturating_sub(POOL_HEADER_RESERVE)
    }

    fn allocate_slot(&self) -> Option<u32> {
        if let Some(idx) = self.free_list.pop() {
            return Some(idx);
        }
        let mut cur = self.n_init.load(Ordering::Acquire);
        loop {
            if cur >= self.block_count {
                return None;
            }
            match self.n_init.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(cur),
                Err(observed) => cur = observed,
            }
        }
    }

    pub(crate) fn free_slot(&self, idx: u32) {
        self.free_list.push(idx);
    }

    pub(crate) fn slot_ptr(&self, idx: u32) -> *mut u8 {
        unsafe { self.segment.data().add(idx as usize * self.block_size) }
    }

    /// Non-growing allocation: exact `len` bytes of payload.
    pub fn allocate(self: &Arc<Self>, len: usize) -> Result<Arc<MemBlock>> {
        self.allocate_ex(len, false)
    }

    /// Growing allocation: capacity is rounded per §4.2's growth policy so
    /// repeated small appends don't force repeated reallocation.
    pub fn allocate_growing(self: &Arc<Self>, len: usize) -> Result<Arc<MemBlock>> {
        self.allocate_ex(len, true)
    }

    fn allocate_ex(self: &Arc<Self>, len: usize, growing: bool) -> Result<Arc<MemBlock>> {
        let max_payload = self.block_size_max();
        if len > max_payload {
            self.stats.on_too_large();
            return match self.alloc_policy {
                AllocPolicy::PoolOnly => Err(MemError::RequestTooLarge {
                    requested: len,
                    max: max_payload,
                }),
                AllocPolicy::HeapFallback => self.allocate_heap(len),
            };
        }
        match self.allocate_slot() {
            Some(slot) => {
                let capacity = if growing {
                    growth_capacity(len, max_payload)
                } else {
                    len
                };
                let storage = BlockStorage::Pool { slot, len };
                Ok(MemBlock::new(Arc::clone(self), storage, capacity.max(len), false))
            }
            None => {
                self.stats.on_pool_full();
                log::warn!("pool '{}': exhausted ({} slots in use)", self.name, self.block_count);
                match self.alloc_policy {
                    AllocPolicy::HeapFallback => self.allocate_heap(len),
                    AllocPolicy::PoolOnly => Err(MemError::AllocationExhausted),
                }
            }
        }
    }

    fn allocate_heap(self: &Arc<Self>, len: usize) -> Result<Arc<MemBlock>> {
        let buf = vec![0u8; len].into_boxed_slice();
        Ok(MemBlock::new(Arc::clone(self), BlockStorage::Appended(buf), len, false))
    }

    /// Used by [`crate::block::MemBlock::make_local`]: a `PoolExternal`
    /// slot copy, payload-only, header on the heap. `None` if no slot is
    /// free or `bytes` exceeds a full slot — caller falls back to heap.
    pub(crate) fn try_allocate_pool_external(self: &Arc<Self>, bytes: &[u8]) -> Option<Arc<MemBlock>> {
        if bytes.len() > self.block_size {
            return None;
        }
        let slot = self.allocate_slot()?;
        let header = Box::new(PoolExternalHeader {
            capacity: self.block_size,
        });
        let storage = BlockStorage::PoolExternal {
            slot,
            len: bytes.len(),
            _header: header,
        };
        let block = MemBlock::new(Arc::clone(self), storage, self.block_size, false);
        block.write_at(0, bytes);
        Some(block)
    }

    /// Empty the free-list, `punch` each emptied slot back to the OS, then
    /// repopulate — reclaims physical pages backing currently-unused slots
    /// without shrinking the pool's logical capacity.
    pub fn vacuum(&self) {
        let mut drained = Vec::new();
        while let Some(idx) = self.free_list.pop() {
            drained.push(idx);
        }
        for &idx in &drained {
            self.segment.punch(idx as usize * self.block_size, self.block_size);
        }
        for idx in drained {
            self.free_list.push(idx);
        }
    }

    pub(crate) fn register_import(&self, import: &Arc<MemImport>) {
        self.imports.lock().unwrap().push(Arc::downgrade(import));
    }

    pub(crate) fn unregister_import_ptr(&self, ptr: *const MemImport) {
        self.imports.lock().unwrap().retain(|w| w.as_ptr() != ptr);
    }

    pub(crate) fn register_export(&self, export: &Arc<MemExport>) {
        self.exports.lock().unwrap().push(Arc::downgrade(export));
    }

    pub(crate) fn unregister_export_ptr(&self, ptr: *const MemExport) {
        self.exports.lock().unwrap().retain(|w| w.as_ptr() != ptr);
    }

    /// Upgradeable snapshot of currently-live exports, used by a dying
    /// import to ask each exporter to revoke blocks sourced from it.
    pub(crate) fn live_exports(&self) -> Vec<Arc<MemExport>> {
        self.exports
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        // A live `MemBlock` holds `Arc<MemPool>`, so in practice this runs
        // only once every block has already freed its slot — this is a
        // debug-assertion-style consistency check, not a correctness fix
        // (Rust's ownership model already prevents the pool from outliving
        // blocks that reference it).
        let mut free_count = 0u32;
        while self.free_list.pop().is_some() {
            free_count += 1;
        }
        let in_use = self.n_init.load(Ordering::Acquire).saturating_sub(free_count);
        if in_use > 0 {
            log::warn!("pool '{}' dropped with {in_use} slot(s) still outstanding", self.name);
        }
    }
}
