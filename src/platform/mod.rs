// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Raw, per-OS primitives backing `ShmSegment`. Everything here is a thin,
// `unsafe`-at-the-edges wrapper over the platform's shared-memory syscalls;
// no policy (naming, marker layout, cleanup scanning) lives below `shm.rs`.

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use posix::*;

#[cfg(windows)]
pub use windows::*;
