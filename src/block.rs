// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Reference-counted memory block (design §4.3). Five variants differ only
// in where the storage came from and how it is freed; dispatch happens only
// in the `Drop` path (`BlockStorage`'s own drop glue), everything else reads
// the tag and branches. `Arc<MemBlock>` supplies the "strong refcount ≥ 1
// while alive" invariant for free; the acquire counter is a separate atomic
// pin tracked independently, per §9's "refcount vs acquire" note.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::import::ImportSegment;
use crate::pool::MemPool;
use crate::shm::ShmKind;

/// Where a block's payload resolves to on the wire: `{type, segmentId,
/// offset}` from the `{type, blockId, segmentId, offset, size}` tuple §6
/// describes (the caller supplies `blockId` and `size` separately).
pub(crate) struct WireLocation {
    pub kind: ShmKind,
    pub segment_id: u32,
    pub offset: usize,
}

/// Header overhead charged against a slot's payload capacity when a block's
/// control data is embedded in the slot itself (the `Pool` variant), mirroring
/// an in-slot control header occupying part of the slot ahead of the payload.
/// This crate's control block lives on the Rust heap via `Arc` instead, so
/// there is nothing to actually embed — `POOL_HEADER_RESERVE` exists purely
/// to preserve the observable capacity difference between `Pool` (header eats
/// part of the slot) and `PoolExternal` (payload gets the whole slot, header
/// goes on the heap instead), design §4.3.
pub const POOL_HEADER_RESERVE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockVariant {
    /// `malloc(header + payload)` in one heap allocation.
    Appended,
    /// Caller-provided pointer; not owned, nothing freed.
    Fixed,
    /// Caller-provided pointer plus a free callback.
    User,
    /// One pool slot; header occupies part of the slot, payload the rest.
    Pool,
    /// One pool slot holding payload only; header lives on the heap.
    PoolExternal,
    /// Payload inside an `ImportSegment` owned by a `MemImport`.
    Imported,
}

pub(crate) type FreeCallback = Arc<dyn Fn(*mut u8, *mut c_void) + Send + Sync>;

pub(crate) enum BlockStorage {
    Appended(Box<[u8]>),
    Fixed {
        ptr: *mut u8,
        len: usize,
    },
    User {
        ptr: *mut u8,
        len: usize,
        free_cb: FreeCallback,
        free_cb_data: *mut c_void,
    },
    Pool {
        slot: u32,
        len: usize,
    },
    PoolExternal {
        slot: u32,
        len: usize,
        _header: Box<PoolExternalHeader>,
    },
    Imported {
        segment: Arc<ImportSegment>,
        offset: usize,
        len: usize,
        imported_id: u32,
    },
}

/// A heap-allocated out-of-slot control header for `PoolExternal` blocks.
/// Carries nothing of semantic weight — its existence is the thing being
/// modeled (header off-slot vs. in-slot), not its contents.
pub(crate) struct PoolExternalHeader {
    pub capacity: usize,
}

// Safety: raw pointers inside `BlockStorage` either point into shared memory
// (Pool/PoolExternal/Imported — always valid for the pool's/segment's
// lifetime, which `MemBlock` keeps alive via `Arc`) or are caller-supplied
// (Fixed/User — the caller's contract to keep valid for the block's life).
unsafe impl Send for BlockStorage {}
unsafe impl Sync for BlockStorage {}

impl BlockStorage {
    fn variant(&self) -> BlockVariant {
        match self {
            BlockStorage::Appended(_) => BlockVariant::Appended,
            BlockStorage::Fixed { .. } => BlockVariant::Fixed,
            BlockStorage::User { .. } => BlockVariant::User,
            BlockStorage::Pool { .. } => BlockVariant::Pool,
            BlockStorage::PoolExternal { .. } => BlockVariant::PoolExternal,
            BlockStorage::Imported { .. } => BlockVariant::Imported,
        }
    }

    fn len(&self) -> usize {
        match self {
            BlockStorage::Appended(b) => b.len(),
            BlockStorage::Fixed { len, .. } => *len,
            BlockStorage::User { len, .. } => *len,
            BlockStorage::Pool { len, .. } => *len,
            BlockStorage::PoolExternal { len, .. } => *len,
            BlockStorage::Imported { len, .. } => *len,
        }
    }

    /// Raw pointer to the payload. `owner` resolves `Pool`/`PoolExternal`
    /// slot indices to an address; it is ignored by the other variants.
    fn data_ptr(&self, owner: &MemPool) -> *mut u8 {
        match self {
            BlockStorage::Appended(b) => b.as_ptr() as *mut u8,
            BlockStorage::Fixed { ptr, .. } => *ptr,
            BlockStorage::User { ptr, .. } => *ptr,
            BlockStorage::Pool { slot, .. } => unsafe {
                owner.slot_ptr(*slot).add(POOL_HEADER_RESERVE)
            },
            BlockStorage::PoolExternal { slot, .. } => owner.slot_ptr(*slot),
            BlockStorage::Imported {
                segment, offset, ..
            } => unsafe { segment.data_ptr().add(*offset) },
        }
    }
}

impl Drop for BlockStorage {
    fn drop(&mut self) {
        match self {
            BlockStorage::Appended(_) | BlockStorage::Fixed { .. } => {
                // Box drops itself; Fixed never owned its pointer.
            }
            BlockStorage::User {
                ptr,
                free_cb,
                free_cb_data,
                ..
            } => {
                free_cb(*ptr, *free_cb_data);
            }
            BlockStorage::Pool { .. } | BlockStorage::PoolExternal { .. } => {
                // The owning `MemBlock::drop` releases the slot — it alone
                // holds the `Arc<MemPool>` needed to resolve `slot` to an
                // address and push it back onto the free-list.
            }
            BlockStorage::Imported { .. } => {
                // Likewise retired from `MemBlock::drop`, which has access
                // to the import map under the segment's owning `MemImport`.
            }
        }
    }
}

/// A reference-counted byte range. Allocate via [`crate::pool::MemPool`] or
/// [`crate::system::fake_pool`]; free automatically on last `Arc` drop.
pub struct MemBlock {
    pub(crate) pool: Arc<MemPool>,
    pub(crate) storage: Mutex<BlockStorage>,
    pub(crate) capacity: usize,
    pub(crate) read_only: bool,
    pub(crate) is_silence: bool,
    acquire_count: AtomicI32,
    please_signal: AtomicBool,
}

impl MemBlock {
    pub(crate) fn new(
        pool: Arc<MemPool>,
        storage: BlockStorage,
        capacity: usize,
        read_only: bool,
    ) -> Arc<Self> {
        let variant = storage.variant();
        let len = storage.len();
        pool.stats().on_block_created(variant, len);
        Arc::new(Self {
            pool,
            storage: Mutex::new(storage),
            capacity,
            read_only,
            is_silence: false,
            acquire_count: AtomicI32::new(0),
            please_signal: AtomicBool::new(false),
        })
    }

    /// A zero-length silence marker: no backing block, just a length. Used
    /// by [`crate::mbq::MBQueue`] to surface holes without a live payload.
    pub fn silence_marker(pool: Arc<MemPool>, len: usize) -> Arc<Self> {
        let storage = BlockStorage::Fixed {
            ptr: std::ptr::null_mut(),
            len,
        };
        pool.stats().on_block_created(BlockVariant::Fixed, len);
        Arc::new(Self {
            pool,
            storage: Mutex::new(storage),
            capacity: len,
            read_only: true,
            is_silence: true,
            acquire_count: AtomicI32::new(0),
            please_signal: AtomicBool::new(false),
        })
    }

    pub fn variant(&self) -> BlockVariant {
        self.storage.lock().unwrap().variant()
    }

    pub fn len(&self) -> usize {
        self.storage.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_silence(&self) -> bool {
        self.is_silence
    }

    pub fn owning_pool(&self) -> &Arc<MemPool> {
        &self.pool
    }

    /// Copy the block's bytes out. Silence markers with no backing storage
    /// (`ptr` null) yield zeros, matching the "silence" contract.
    pub fn to_vec(&self) -> Vec<u8> {
        let guard = self.storage.lock().unwrap();
        let len = guard.len();
        if self.is_silence {
            return vec![0u8; len];
        }
        let ptr = guard.data_ptr(&self.pool);
        if ptr.is_null() || len == 0 {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(ptr, len).to_vec() }
    }

    /// Run `f` over the payload bytes without copying. Returns `None` for a
    /// silence marker (no live storage to borrow from).
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let guard = self.storage.lock().unwrap();
        if self.is_silence {
            return None;
        }
        let len = guard.len();
        let ptr = guard.data_ptr(&self.pool);
        if ptr.is_null() {
            return None;
        }
        Some(f(unsafe { std::slice::from_raw_parts(ptr, len) }))
    }

    /// Copy `len` bytes starting at `offset` out of the block's payload.
    /// Silence markers (and any block too short for the request) yield zeros.
    pub fn read_range(&self, offset: usize, len: usize) -> Vec<u8> {
        let guard = self.storage.lock().unwrap();
        if self.is_silence {
            return vec![0u8; len];
        }
        let total = guard.len();
        if offset >= total {
            return vec![0u8; len];
        }
        let avail = (total - offset).min(len);
        let ptr = guard.data_ptr(&self.pool);
        if ptr.is_null() || avail == 0 {
            return vec![0u8; len];
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset), out.as_mut_ptr(), avail);
        }
        out
    }

    /// Write `src` into the block's payload starting at `offset`.
    /// Fails (returns `false`) for read-only or silence blocks, or if
    /// `offset + src.len()` exceeds the block's length.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> bool {
        if self.read_only || self.is_silence {
            return false;
        }
        let guard = self.storage.lock().unwrap();
        let len = guard.len();
        if offset + src.len() > len {
            return false;
        }
        let ptr = guard.data_ptr(&self.pool);
        if ptr.is_null() {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.add(offset), src.len());
        }
        true
    }

    /// Raw pointer to the current payload. Callers handing this to a system
    /// call must bracket the call with [`MemBlock::acquire`]/[`MemBlock::release`].
    pub fn as_ptr(&self) -> *const u8 {
        self.storage.lock().unwrap().data_ptr(&self.pool) as *const u8
    }

    // -- acquire / release: transient pin, independent of Arc refcount --

    /// Pin the block for the duration of a raw-pointer system call.
    pub fn acquire(&self) {
        self.acquire_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a pin taken by [`MemBlock::acquire`]. If this was the last
    /// pin and a waiter asked to be signalled, posts to the pool's semaphore.
    pub fn release(&self) {
        let prev = self.acquire_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without matching acquire");
        if prev == 1 && self.please_signal.load(Ordering::Acquire) {
            self.pool.semaphore().post();
        }
    }

    pub fn acquire_count(&self) -> i32 {
        self.acquire_count.load(Ordering::Acquire)
    }

    /// Block the caller until `acquire_count` reaches zero. Used only by
    /// [`MemBlock::make_local`] and import retirement (§5's suspension
    /// points) — never on the hot read/write path.
    pub fn wait(&self) {
        if self.acquire_count.load(Ordering::Acquire) == 0 {
            return;
        }
        self.please_signal.store(true, Ordering::Release);
        while self.acquire_count.load(Ordering::Acquire) != 0 {
            self.pool.semaphore().wait();
        }
        self.please_signal.store(false, Ordering::Release);
    }

    /// Turn any non-local variant into a local one by copying the payload:
    /// tries a `PoolExternal` slot first, falls back to a heap `User` block.
    /// Used before destroying an import so outstanding readers keep reading.
    pub fn make_local(self: &Arc<Self>) -> Arc<MemBlock> {
        if !matches!(self.variant(), BlockVariant::Imported) {
            return Arc::clone(self);
        }
        self.wait();
        let bytes = self.to_vec();
        if let Some(copy) = self.pool.try_allocate_pool_external(&bytes) {
            return copy;
        }
        let boxed = bytes.into_boxed_slice();
        let len = boxed.len();
        let ptr = boxed.as_ptr() as *mut u8;
        std::mem::forget(boxed);
        let free_cb: FreeCallback = Arc::new(|p: *mut u8, data: *mut c_void| unsafe {
            let len = data as usize;
            drop(Box::from_raw(std::slice::from_raw_parts_mut(p, len)));
        });
        MemBlock::new(
            Arc::clone(&self.pool),
            BlockStorage::User {
                ptr,
                len,
                free_cb,
                free_cb_data: len as *mut c_void,
            },
            len,
            self.read_only,
        )
    }

    /// Orderly retirement of an `Imported` block: statistics + import-map
    /// removal happen in [`crate::import::MemImport`]; this performs the
    /// `make_local` copy and returns the replacement. The import's release
    /// callback is deliberately **not** invoked — the importer triggered
    /// this, so notifying it back would be a spurious echo.
    pub fn replace_import(self: &Arc<Self>) -> Arc<MemBlock> {
        self.make_local()
    }

    /// Returns the same block (ref bumped) if it already lives in a pool
    /// that is shared with `target`; otherwise allocates a new `Pool` block
    /// in `target` and copies up to `target.block_size_max()` bytes. Used by
    /// [`crate::export::MemExport::put`] to guarantee exported payload is
    /// reachable across process boundaries.
    pub fn shared_copy(self: &Arc<Self>, target: &Arc<MemPool>) -> Option<Arc<MemBlock>> {
        let shareable = matches!(
            self.variant(),
            BlockVariant::Imported | BlockVariant::Pool | BlockVariant::PoolExternal
        );
        if shareable && Arc::ptr_eq(&self.pool, target) {
            return Some(Arc::clone(self));
        }
        let max = target.block_size_max();
        let bytes = self.to_vec();
        let take = bytes.len().min(max);
        target.allocate(take).ok().map(|b| {
            b.write_at(0, &bytes[..take]);
            b
        })
    }

    /// `{kind, segment_id, offset}` this block's payload resolves to, for the
    /// wire tuple `{type, blockId, segmentId, offset, size}` §6 describes.
    /// `None` for variants with no shared-memory backing (`Appended`,
    /// `Fixed`, `User`) — those cannot be exported.
    pub(crate) fn wire_location(&self) -> Option<WireLocation> {
        let guard = self.storage.lock().unwrap();
        match &*guard {
            BlockStorage::Pool { slot, .. } => Some(WireLocation {
                kind: self.pool.segment_kind(),
                segment_id: self.pool.segment_id(),
                offset: (*slot as usize) * self.pool.block_size() + POOL_HEADER_RESERVE,
            }),
            BlockStorage::PoolExternal { slot, .. } => Some(WireLocation {
                kind: self.pool.segment_kind(),
                segment_id: self.pool.segment_id(),
                offset: (*slot as usize) * self.pool.block_size(),
            }),
            BlockStorage::Imported {
                segment, offset, ..
            } => Some(WireLocation {
                kind: segment.kind(),
                segment_id: segment.shm_id(),
                offset: *offset,
            }),
            _ => None,
        }
    }

    /// Identity of the `MemImport` this block was sourced from, as a raw
    /// pointer usable only for equality comparison (never dereferenced) —
    /// lets [`crate::export::MemExport::revoke_blocks_from`] find slots
    /// sourced from a dying import without the import having to track its
    /// own exported slots. `None` for non-`Imported` variants.
    pub(crate) fn imported_owner_ptr(&self) -> Option<*const crate::import::MemImport> {
        let guard = self.storage.lock().unwrap();
        match &*guard {
            BlockStorage::Imported { segment, .. } => Some(segment.owner_ptr()),
            _ => None,
        }
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        let storage = self.storage.get_mut().unwrap();
        let variant = storage.variant();
        let len = storage.len();
        match storage {
            BlockStorage::Pool { slot, .. } | BlockStorage::PoolExternal { slot, .. } => {
                self.pool.free_slot(*slot);
            }
            BlockStorage::Imported {
                segment,
                imported_id,
                ..
            } => {
                segment.on_block_dropped(*imported_id);
            }
            _ => {}
        }
        self.pool.stats().on_block_destroyed(variant, len);
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("variant", &self.variant())
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("read_only", &self.read_only)
            .field("is_silence", &self.is_silence)
            .finish()
    }
}
