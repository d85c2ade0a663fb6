// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform shared-memory pool, block, queue, and export/import core
// for an audio-oriented runtime (design §1). A process-private or named
// shared-memory segment backs a slot pool; blocks carved from that pool (or
// from the heap, or from a peer's segment) are tracked by reference count;
// an ordered queue of blocks gives a producer/consumer stream with holes,
// silence fill, and a prebuffer state machine; export/import hands blocks
// across a process boundary by a small wire id instead of a raw pointer.

pub mod shm_name;

mod platform;

pub mod error;
pub use error::{MemError, Result};

pub mod stats;
pub use stats::PoolStats;

mod semaphore;
mod spin_lock;

pub mod shm;
pub use shm::{NativeFd, ShmKind, ShmSegment, INVALID_FD, MAX_SHM_SIZE};

pub mod block;
pub use block::{BlockVariant, MemBlock};

pub mod chunk;
pub use chunk::Chunk;

pub mod pool;
pub use pool::{AllocPolicy, MemPool};

pub mod mcalign;
pub use mcalign::MCAlign;

pub mod mbq;
pub use mbq::{BufferAttr, MBQueue, SeekMode};

pub mod import;
pub use import::{ImportSegment, MemImport, ReleaseCallback};

pub mod export;
pub use export::{ExportedBlock, MemExport};

pub mod system;
pub use system::{MemTrap, MemorySystem, TrapHandle};
