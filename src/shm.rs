// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory segment (design §4.1). Owns a contiguous region backed by
// private anonymous memory, POSIX shared memory, or a sealable/anonymous
// shared file descriptor. `shm.rs` is policy (naming, marker layout,
// orphan cleanup); `platform::{posix,windows}` are the raw per-OS
// mmap/shm_open/memfd_create primitives this module composes.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{MemError, Result};
use crate::platform;

#[cfg(unix)]
pub type NativeFd = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type NativeFd = isize;

#[cfg(unix)]
pub const INVALID_FD: NativeFd = -1;
#[cfg(windows)]
pub const INVALID_FD: NativeFd = 0;

/// `size` is capped here; `ShmSegment::create`/`attach` reject anything larger.
pub const MAX_SHM_SIZE: usize = 1 << 30; // 1 GiB

const MARKER_MAGIC: u32 = 0xbeef_cafe;

/// Trailing record written at `ptr + size - sizeof(Marker)` for `PosixShared`
/// segments only — lets `cleanup()` identify orphaned segments left behind
/// by a crashed owner without needing out-of-band bookkeeping.
#[repr(C)]
struct Marker {
    magic: u32,
    owner_pid: i32,
}

const MARKER_SIZE: usize = std::mem::size_of::<Marker>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmKind {
    /// Anonymous, process-private memory. No `id`, no name, no marker.
    Private,
    /// Named POSIX shared memory (`shm_open`). Carries a trailing `Marker`
    /// and can be `cleanup()`-scanned for orphans.
    PosixShared,
    /// Anonymous, sealable shared fd (`memfd_create` on Linux). No marker
    /// (nothing to scan a directory for); the fd itself is the handle a
    /// transport announces to a peer.
    MemfdShared,
}

fn next_random_id() -> u32 {
    static STATE: AtomicU32 = AtomicU32::new(0);
    // A process-local xorshift32 seeded from the monotonic clock, the
    // previous state, and this call's stack address — enough entropy to
    // make `PosixShared`/`MemfdShared` names collision-resistant across
    // processes without pulling in an extra dependency for it (see
    // DESIGN.md).
    let seed_bits = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let stack_entropy = &STATE as *const _ as usize as u32;
    let mut x = STATE
        .fetch_add(1, Ordering::Relaxed)
        .wrapping_add(seed_bits)
        .wrapping_add(stack_entropy)
        .wrapping_mul(2654435761)
        | 1;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// A contiguous writable region regardless of backing (design §4.1).
pub struct ShmSegment {
    kind: ShmKind,
    id: u32,
    ptr: *mut u8,
    size: usize,
    mapped_len: usize,
    writable: bool,
    owns_unlink: bool,
    name: Option<String>,
    fd: NativeFd,
}

// Safety: the pointer either targets process-private memory owned
// exclusively by this handle, or a shared mapping whose cross-process
// sharing is the whole point of this type.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a fresh segment. `size` is rounded up to a page multiple and
    /// capped at [`MAX_SHM_SIZE`]. For `PosixShared`/`MemfdShared`, `prefix`
    /// becomes the basis of the segment's name (`/<prefix>-<id>`) and
    /// `cleanup(prefix)` runs first to reclaim orphans before a fresh
    /// segment is created. `mode` is the POSIX permission bits passed to
    /// `shm_open`; ignored for `Private`/`MemfdShared`.
    pub fn create(prefix: &str, kind: ShmKind, size: usize, mode: u32) -> Result<Self> {
        let user_size = platform::round_up_to_page(size.max(platform::page_size()));
        if user_size > MAX_SHM_SIZE {
            return Err(MemError::InvalidArgument("requested shm size exceeds MAX_SHM_SIZE"));
        }

        match kind {
            ShmKind::Private => {
                let mapping = platform::map_private(user_size)?;
                log::debug!("shm: created private segment ({user_size} bytes)");
                Ok(Self {
                    kind,
                    id: 0,
                    ptr: mapping.ptr,
                    size: user_size,
                    mapped_len: mapping.len,
                    writable: true,
                    owns_unlink: false,
                    name: None,
                    fd: INVALID_FD,
                })
            }
            ShmKind::PosixShared => {
                Self::cleanup(prefix);
                let total = user_size + MARKER_SIZE;
                let mut last_err = None;
                for _ in 0..8 {
                    let id = next_random_id();
                    let name = shm_segment_name(prefix, id);
                    match platform::create_posix_shared(&name, total, mode) {
                        Ok(mapping) => {
                            unsafe {
                                write_marker(mapping.ptr, mapping.len);
                            }
                            log::debug!("shm: created posix-shared segment {name} ({user_size} bytes)");
                            return Ok(Self {
                                kind,
                                id,
                                ptr: mapping.ptr,
                                size: user_size,
                                mapped_len: mapping.len,
                                writable: true,
                                owns_unlink: true,
                                name: Some(name),
                                fd: platform_fd(&mapping),
                            });
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                            last_err = Some(e);
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::AlreadyExists, "id space exhausted")
                })
                .into())
            }
            ShmKind::MemfdShared => {
                let id = next_random_id();
                let name = shm_segment_name(prefix, id);
                let mapping = platform::create_memfd_shared(&name, user_size)?;
                log::debug!("shm: created memfd-shared segment {name} ({user_size} bytes)");
                Ok(Self {
                    kind,
                    id,
                    ptr: mapping.ptr,
                    size: user_size,
                    mapped_len: mapping.len,
                    writable: true,
                    owns_unlink: false,
                    name: Some(name),
                    fd: platform_fd(&mapping),
                })
            }
        }
    }

    /// Attach to an existing segment. `size` is the caller-agreed payload
    /// size (the wire tuple's `size` field for `Imported` blocks); `fd` is
    /// used for `MemfdShared`, `name` for `PosixShared`. Validates
    /// `st_size > 0`, `<= MAX_SHM_SIZE + markerSize`, pointer alignment.
    pub fn attach(
        kind: ShmKind,
        id: u32,
        fd: NativeFd,
        size: usize,
        writable: bool,
        name: Option<&str>,
    ) -> Result<Self> {
        if size == 0 || size > MAX_SHM_SIZE + MARKER_SIZE {
            return Err(MemError::InvalidArgument("attach size out of range"));
        }
        match kind {
            ShmKind::Private => Err(MemError::InvalidArgument("cannot attach a Private segment")),
            ShmKind::PosixShared => {
                let name = name
                    .map(str::to_string)
                    .ok_or(MemError::InvalidArgument("PosixShared attach requires a name"))?;
                let mapping = platform::open_posix_shared(&name, writable)?;
                validate_alignment(mapping.ptr)?;
                let user_size = mapping.len.saturating_sub(MARKER_SIZE);
                Ok(Self {
                    kind,
                    id,
                    ptr: mapping.ptr,
                    size: user_size,
                    mapped_len: mapping.len,
                    writable,
                    owns_unlink: false,
                    name: Some(name),
                    fd: platform_fd(&mapping),
                })
            }
            ShmKind::MemfdShared => {
                let mapping = platform::attach_foreign_fd(fd, size, writable)?;
                validate_alignment(mapping.ptr)?;
                Ok(Self {
                    kind,
                    id,
                    ptr: mapping.ptr,
                    size,
                    mapped_len: mapping.len,
                    writable,
                    owns_unlink: false,
                    name: None,
                    fd: INVALID_FD,
                })
            }
        }
    }

    pub fn kind(&self) -> ShmKind {
        self.kind
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn fd(&self) -> NativeFd {
        self.fd
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    /// # Safety
    /// Caller must ensure no other reader/writer races the returned slice
    /// without external synchronization (§5: block content is not guarded
    /// by the core).
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.size)
    }

    /// Page-granular hole-punch: advise the kernel to drop pages in
    /// `[offset, offset+len)`. Best-effort; readable and zeroed on next
    /// touch is the only guarantee. No-op (returns `false`) if the
    /// platform supports none of `MADV_REMOVE`/`MADV_FREE`/`MADV_DONTNEED`
    /// (or their Windows analogue).
    pub fn punch(&self, offset: usize, len: usize) -> bool {
        if offset + len > self.size {
            return false;
        }
        unsafe { platform::punch(self.ptr, offset, len) }
    }

    /// Scan the platform's shared-memory namespace for segments whose name
    /// matches `prefix`, verify the trailing marker, and unlink any whose
    /// owner process no longer exists. Invoked automatically by
    /// `create(prefix, PosixShared, ..)` before creating a new segment.
    pub fn cleanup(prefix: &str) {
        for name in platform::list_shm_segments() {
            if !shm_entry_matches_prefix(&name, prefix) {
                continue;
            }
            let posix_name = format!("/{name}");
            let mapping = match platform::open_posix_shared(&posix_name, false) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if mapping.len < MARKER_SIZE {
                unsafe { platform::unmap(mapping.ptr, mapping.len) };
                continue;
            }
            let marker = unsafe { read_marker(mapping.ptr, mapping.len) };
            let orphaned = marker
                .map(|m| m.magic == MARKER_MAGIC && !platform::process_alive(m.owner_pid))
                .unwrap_or(false);
            unsafe { platform::unmap(mapping.ptr, mapping.len) };
            if orphaned {
                log::debug!("shm: reclaiming orphaned segment {posix_name}");
                platform::shm_unlink(&posix_name);
            }
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            platform::unmap(self.ptr, self.mapped_len);
        }
        if self.kind != ShmKind::Private {
            platform::close_fd(self.fd);
        }
        if self.owns_unlink {
            if let Some(name) = &self.name {
                platform::shm_unlink(name);
            }
        }
    }
}

fn shm_segment_name(prefix: &str, id: u32) -> String {
    crate::shm_name::make_shm_name(&format!("{prefix}-{id:08x}"))
}

fn shm_entry_matches_prefix(entry_name: &str, prefix: &str) -> bool {
    entry_name.starts_with(prefix)
}

fn validate_alignment(ptr: *mut u8) -> Result<()> {
    if (ptr as usize) % std::mem::align_of::<u64>() != 0 {
        return Err(MemError::InvalidArgument("attached segment is not pointer-aligned"));
    }
    Ok(())
}

unsafe fn write_marker(base: *mut u8, mapped_len: usize) {
    let offset = mapped_len - MARKER_SIZE;
    let marker_ptr = base.add(offset) as *mut Marker;
    marker_ptr.write(Marker {
        magic: MARKER_MAGIC,
        owner_pid: platform::current_pid(),
    });
}

unsafe fn read_marker(base: *mut u8, mapped_len: usize) -> Option<Marker> {
    if mapped_len < MARKER_SIZE {
        return None;
    }
    let offset = mapped_len - MARKER_SIZE;
    Some((base.add(offset) as *const Marker).read())
}

#[cfg(unix)]
fn platform_fd(mapping: &platform::RawMapping) -> NativeFd {
    mapping.fd
}

#[cfg(windows)]
fn platform_fd(mapping: &platform::RawMapping) -> NativeFd {
    mapping.handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_segment_is_writable_and_zeroed() {
        let seg = ShmSegment::create("test-private", ShmKind::Private, 4096, 0o666).unwrap();
        assert_eq!(seg.kind(), ShmKind::Private);
        assert_eq!(seg.id(), 0);
        assert!(seg.size() >= 4096);
        unsafe {
            let slice = seg.as_mut_slice();
            assert!(slice.iter().all(|&b| b == 0));
            slice[0] = 0xab;
        }
        assert_eq!(seg.as_slice()[0], 0xab);
    }

    #[test]
    #[cfg(unix)]
    fn posix_shared_round_trips_and_unlinks_on_drop() {
        let seg = ShmSegment::create("test-posix-rt", ShmKind::PosixShared, 8192, 0o666).unwrap();
        let name = seg.name().unwrap().to_string();
        unsafe {
            seg.as_mut_slice()[0] = 7;
        }
        assert_eq!(seg.as_slice()[0], 7);
        drop(seg);
        // Name was unlinked; a fresh attach by the same name must fail.
        assert!(ShmSegment::attach(ShmKind::PosixShared, 0, INVALID_FD, 8192 + MARKER_SIZE, true, Some(&name)).is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn memfd_shared_keeps_fd_open() {
        let seg = ShmSegment::create("test-memfd", ShmKind::MemfdShared, 4096, 0).unwrap();
        assert_ne!(seg.fd(), INVALID_FD);
    }

    #[test]
    fn punch_out_of_bounds_is_rejected() {
        let seg = ShmSegment::create("test-punch", ShmKind::Private, 4096, 0o666).unwrap();
        assert!(!seg.punch(4096, 1));
    }
}
