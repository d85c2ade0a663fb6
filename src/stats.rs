// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-pool atomic statistics (design §4.2). Every block creation/destruction
// and export put/release updates the matching counters under the variant
// label it currently carries, so a post-mortem can attribute leaks to a
// specific storage strategy without re-running under a debugger.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::block::BlockVariant;

const VARIANT_COUNT: usize = 6;

fn variant_index(v: BlockVariant) -> usize {
    match v {
        BlockVariant::Appended => 0,
        BlockVariant::Fixed => 1,
        BlockVariant::User => 2,
        BlockVariant::Pool => 3,
        BlockVariant::PoolExternal => 4,
        BlockVariant::Imported => 5,
    }
}

/// Atomic counters tracked per [`crate::pool::MemPool`].
///
/// All fields use relaxed-ish `AcqRel` updates; none of these counters gate
/// correctness, only diagnostics, so a torn read across two fields (e.g.
/// `n_allocated` vs `allocated_size`) is an acceptable race.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub n_allocated: AtomicU64,
    pub n_accumulated: AtomicU64,
    pub n_imported: AtomicU64,
    pub n_exported: AtomicU64,
    pub allocated_size: AtomicU64,
    pub accumulated_size: AtomicU64,
    pub imported_size: AtomicU64,
    pub exported_size: AtomicU64,
    pub n_too_large_for_pool: AtomicU64,
    pub n_pool_full: AtomicU64,
    per_variant_alive: [AtomicU64; VARIANT_COUNT],
    per_variant_size: [AtomicU64; VARIANT_COUNT],
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_block_created(&self, variant: BlockVariant, size: usize) {
        self.n_allocated.fetch_add(1, Ordering::AcqRel);
        self.n_accumulated.fetch_add(1, Ordering::AcqRel);
        self.allocated_size.fetch_add(size as u64, Ordering::AcqRel);
        self.accumulated_size.fetch_add(size as u64, Ordering::AcqRel);
        let idx = variant_index(variant);
        self.per_variant_alive[idx].fetch_add(1, Ordering::AcqRel);
        self.per_variant_size[idx].fetch_add(size as u64, Ordering::AcqRel);
        if variant == BlockVariant::Imported {
            self.n_imported.fetch_add(1, Ordering::AcqRel);
            self.imported_size.fetch_add(size as u64, Ordering::AcqRel);
        }
    }

    pub fn on_block_destroyed(&self, variant: BlockVariant, size: usize) {
        self.n_allocated.fetch_sub(1, Ordering::AcqRel);
        self.allocated_size.fetch_sub(size as u64, Ordering::AcqRel);
        let idx = variant_index(variant);
        self.per_variant_alive[idx].fetch_sub(1, Ordering::AcqRel);
        self.per_variant_size[idx].fetch_sub(size as u64, Ordering::AcqRel);
        if variant == BlockVariant::Imported {
            self.n_imported.fetch_sub(1, Ordering::AcqRel);
            self.imported_size.fetch_sub(size as u64, Ordering::AcqRel);
        }
    }

    pub fn on_pool_full(&self) {
        self.n_pool_full.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_too_large(&self) {
        self.n_too_large_for_pool.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_export_put(&self, size: usize) {
        self.n_exported.fetch_add(1, Ordering::AcqRel);
        self.exported_size.fetch_add(size as u64, Ordering::AcqRel);
    }

    pub fn on_export_release(&self, size: usize) {
        self.n_exported.fetch_sub(1, Ordering::AcqRel);
        self.exported_size.fetch_sub(size as u64, Ordering::AcqRel);
    }

    pub fn n_allocated(&self) -> u64 {
        self.n_allocated.load(Ordering::Acquire)
    }

    pub fn n_pool_full(&self) -> u64 {
        self.n_pool_full.load(Ordering::Acquire)
    }

    pub fn n_too_large_for_pool(&self) -> u64 {
        self.n_too_large_for_pool.load(Ordering::Acquire)
    }

    pub fn alive_in_variant(&self, variant: BlockVariant) -> u64 {
        self.per_variant_alive[variant_index(variant)].load(Ordering::Acquire)
    }
}
