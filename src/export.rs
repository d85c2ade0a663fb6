// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Export side of cross-process block transfer (design §4.6). `MemExport`
// hands a block a small wire id (`blockId`) and remembers it in a used-list
// until the peer (or this process) releases it; a free-list of retired ids
// keeps them dense and reusable instead of growing without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::block::MemBlock;
use crate::error::{MemError, Result};
use crate::import::MemImport;
use crate::pool::MemPool;
use crate::shm::ShmKind;

/// Fixed export slot-table capacity, `IMEMEXPORT_SLOTS_MAX` (§4.6).
pub const EXPORT_MAX_BLOCKS: usize = 128;

/// Fires with the published wire id of each slot revoked out from under a
/// peer (§4.6 "Export release"), mirroring PulseAudio's `pa_memexport`
/// `revoke_cb`. Rust closures capture whatever state a C callback would
/// need a userdata pointer for, so there's no separate userdata parameter.
pub type RevokeCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// The `{type, blockId, segmentId, offset, size}` tuple §6 puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportedBlock {
    pub kind: ShmKind,
    pub block_id: u32,
    pub segment_id: u32,
    pub offset: usize,
    pub size: usize,
}

/// Per-connection export table (design §4.6, data model `MemExport`). `put`
/// guarantees the returned tuple is reachable from `target`'s segment even
/// if the source block lived somewhere else, by delegating to
/// [`MemBlock::shared_copy`].
pub struct MemExport {
    pool: Weak<MemPool>,
    target: Arc<MemPool>,
    slots: Mutex<HashMap<u32, Arc<MemBlock>>>,
    free_ids: Mutex<Vec<u32>>,
    next_id: AtomicU32,
    self_ref: Mutex<Weak<MemExport>>,
    revoke_cb: Option<RevokeCallback>,
}

impl MemExport {
    /// `pool` is only used for registration (so a dying import can find this
    /// export to revoke its blocks); `target` is the pool exported blocks
    /// are copied into when they don't already live in a shared segment.
    /// `revoke_cb`, if given, fires with the published id of every slot
    /// `revoke_blocks_from` releases, so the peer can be told its upstream
    /// source disappeared (§4.6).
    pub fn new(pool: &Arc<MemPool>, target: &Arc<MemPool>, revoke_cb: Option<RevokeCallback>) -> Arc<Self> {
        let export = Arc::new(Self {
            pool: Arc::downgrade(pool),
            target: Arc::clone(target),
            slots: Mutex::new(HashMap::new()),
            free_ids: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
            self_ref: Mutex::new(Weak::new()),
            revoke_cb,
        });
        *export.self_ref.lock().unwrap() = Arc::downgrade(&export);
        pool.register_export(&export);
        export
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    fn take_id(&self) -> Option<u32> {
        if let Some(id) = self.free_ids.lock().unwrap().pop() {
            return Some(id);
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        if id as usize >= EXPORT_MAX_BLOCKS {
            self.next_id.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(id)
    }

    /// Assign `block` a wire id, copying it into `target`'s segment first if
    /// it isn't already reachable there. Returns the tuple to hand to the
    /// peer.
    pub fn put(&self, block: &Arc<MemBlock>) -> Result<ExportedBlock> {
        let pool = self
            .pool
            .upgrade()
            .ok_or(MemError::InvalidArgument("export's owning pool no longer exists"))?;

        let shareable = block
            .shared_copy(&self.target)
            .ok_or(MemError::RequestTooLarge {
                requested: block.len(),
                max: self.target.block_size_max(),
            })?;
        let id = self.take_id().ok_or(MemError::SegmentCapacityExceeded)?;
        let location = shareable
            .wire_location()
            .ok_or(MemError::ProtocolViolation("exported block has no shared-memory location"))?;

        let size = block.len();
        self.slots.lock().unwrap().insert(id, shareable);
        pool.stats().on_export_put(size);
        log::debug!("export: put block {id} at segment {} offset {}", location.segment_id, location.offset);

        Ok(ExportedBlock {
            kind: location.kind,
            block_id: id,
            segment_id: location.segment_id,
            offset: location.offset,
            size: block.len(),
        })
    }

    /// Retire `block_id`, returning it to the free-id pool. Returns `false`
    /// if the id wasn't live (double-release, or the peer named a stale id).
    pub fn release(&self, block_id: u32) -> bool {
        let Some(removed) = self.slots.lock().unwrap().remove(&block_id) else {
            return false;
        };
        self.free_ids.lock().unwrap().push(block_id);
        if let Some(pool) = self.pool.upgrade() {
            pool.stats().on_export_release(removed.len());
        }
        true
    }

    /// Release every exported slot sourced from `import_ptr` and fire
    /// `revoke_cb` for each one, telling the peer its upstream source is
    /// gone. Called when a `MemImport` is about to be dropped (§4.6, §9).
    pub(crate) fn revoke_blocks_from(&self, import_ptr: *const MemImport) {
        let revoked: Vec<(u32, usize)> = {
            let mut slots = self.slots.lock().unwrap();
            let ids: Vec<u32> = slots
                .iter()
                .filter(|(_, b)| b.imported_owner_ptr() == Some(import_ptr))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| slots.remove(&id).map(|block| (id, block.len())))
                .collect()
        };
        if revoked.is_empty() {
            return;
        }
        {
            let mut free_ids = self.free_ids.lock().unwrap();
            free_ids.extend(revoked.iter().map(|(id, _)| *id));
        }
        if let Some(pool) = self.pool.upgrade() {
            let stats = pool.stats();
            for (_, size) in &revoked {
                stats.on_export_release(*size);
            }
        }
        // Callbacks run with no export/pool mutex held (§4.6's "never held
        // across user callbacks" rule).
        if let Some(cb) = &self.revoke_cb {
            for (id, _) in &revoked {
                cb(*id);
            }
        }
    }
}

impl Drop for MemExport {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.unregister_export_ptr(self as *const _);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmKind as K;

    fn pool(name: &str) -> Arc<MemPool> {
        MemPool::new(name, K::Private, 4 * crate::pool::DEFAULT_BLOCK_SIZE, false).unwrap()
    }

    #[test]
    fn put_then_release_frees_the_id_for_reuse() {
        let pool = pool("export-test-a");
        let export = MemExport::new(&pool, &pool, None);
        let block = pool.allocate(100).unwrap();

        let exported = export.put(&block).unwrap();
        assert_eq!(exported.block_id, 0);
        assert_eq!(export.live_count(), 1);

        assert!(export.release(exported.block_id));
        assert_eq!(export.live_count(), 0);

        let block2 = pool.allocate(100).unwrap();
        let exported2 = export.put(&block2).unwrap();
        assert_eq!(exported2.block_id, 0, "released id should be reused");
    }

    #[test]
    fn release_of_unknown_id_reports_false() {
        let pool = pool("export-test-b");
        let export = MemExport::new(&pool, &pool, None);
        assert!(!export.release(42));
    }

    #[test]
    fn put_copies_a_foreign_block_into_the_target_pool() {
        let source = pool("export-test-c-src");
        let target = pool("export-test-c-dst");
        let export = MemExport::new(&target, &target, None);

        let block = source.allocate(64).unwrap();
        assert!(block.write_at(0, &[9u8; 64]));
        let exported = export.put(&block).unwrap();
        assert_eq!(exported.size, 64);
        assert_eq!(exported.segment_id, target.segment_id());
    }
}
