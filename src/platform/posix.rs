// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX raw mapping primitives backing `ShmSegment`: anonymous private
// mappings, named POSIX shared memory (`shm_open`), and anonymous sealable
// shared file descriptors (`memfd_create` on Linux).

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

/// A live `mmap`ed region plus the file descriptor that backs it, if any.
///
/// `fd == -1` for `Private` mappings (no backing descriptor). For
/// `PosixShared` the descriptor is closed immediately after mapping (POSIX
/// only needs it for the initial `ftruncate`+`mmap`). For `MemfdShared` the
/// descriptor is kept open for later transport registration — it is the
/// handle a peer needs to attach the same segment.
pub struct RawMapping {
    pub ptr: *mut u8,
    pub len: usize,
    pub fd: RawFd,
}

unsafe impl Send for RawMapping {}
unsafe impl Sync for RawMapping {}

pub fn page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps <= 0 {
        4096
    } else {
        ps as usize
    }
}

pub fn round_up_to_page(size: usize) -> usize {
    let ps = page_size();
    (size + ps - 1) / ps * ps
}

/// Anonymous, process-private mapping. Prefers `mmap(MAP_ANONYMOUS)`;
/// falls back to a heap allocation if the platform denies it (e.g. a
/// hardened sandbox with anonymous mappings restricted).
pub fn map_private(size: usize) -> io::Result<RawMapping> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr != libc::MAP_FAILED {
        return Ok(RawMapping {
            ptr: ptr as *mut u8,
            len: size,
            fd: -1,
        });
    }

    // Fall back to a plain heap allocation — no mapping to unmap on drop,
    // the caller frees it like any other boxed buffer.
    let layout = std::alloc::Layout::from_size_align(size, std::mem::align_of::<u64>())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let heap_ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    if heap_ptr.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "mmap and heap allocation both failed for private segment",
        ));
    }
    Ok(RawMapping {
        ptr: heap_ptr,
        len: size,
        fd: -1,
    })
}

fn cstring_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Create a fresh POSIX shared-memory object and map it. Fails with
/// `AlreadyExists` if a segment of this name is already live.
pub fn create_posix_shared(name: &str, size: usize, mode: u32) -> io::Result<RawMapping> {
    let cname = cstring_name(name)?;
    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            mode as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::fchmod(fd, mode as libc::mode_t) };
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    map_shared_fd(fd, size, true, true)
}

/// Attach to an existing POSIX shared-memory object by name.
pub fn open_posix_shared(name: &str, writable: bool) -> io::Result<RawMapping> {
    let cname = cstring_name(name)?;
    let flags = if writable { libc::O_RDWR } else { libc::O_RDONLY };
    let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let size = fd_size(fd)?;
    map_shared_fd(fd, size, writable, true)
}

fn fd_size(fd: RawFd) -> io::Result<usize> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    if st.st_size <= 0 {
        unsafe { libc::close(fd) };
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "shared segment has zero size",
        ));
    }
    Ok(st.st_size as usize)
}

/// Map a shared fd with `MAP_SHARED`. `close_after` closes the descriptor
/// once mapped (the mapping alone keeps the memory alive) — used for
/// `PosixShared`. `MemfdShared` passes `close_after = false` to retain the
/// fd for later transport registration.
fn map_shared_fd(fd: RawFd, size: usize, writable: bool, close_after: bool) -> io::Result<RawMapping> {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };
    let ptr = unsafe { libc::mmap(ptr::null_mut(), size, prot, libc::MAP_SHARED, fd, 0) };
    if ptr == libc::MAP_FAILED {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let kept_fd = if close_after {
        unsafe { libc::close(fd) };
        -1
    } else {
        fd
    };

    Ok(RawMapping {
        ptr: ptr as *mut u8,
        len: size,
        fd: kept_fd,
    })
}

/// Create an anonymous, sealable shared fd (`memfd_create`) and map it.
/// The fd is kept open in the returned mapping.
pub fn create_memfd_shared(name: &str, size: usize) -> io::Result<RawMapping> {
    let cname = cstring_name(name)?;
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    map_shared_fd(fd, size, true, false)
}

/// Attach to a foreign memfd (or any shared fd) received over a transport.
/// The caller retains ownership of `fd`; this mapping will not close it.
pub fn attach_foreign_fd(fd: RawFd, size: usize, writable: bool) -> io::Result<RawMapping> {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };
    let ptr = unsafe { libc::mmap(ptr::null_mut(), size, prot, libc::MAP_SHARED, fd, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(RawMapping {
        ptr: ptr as *mut u8,
        len: size,
        fd: -1, // not owned — caller (ImportSegment) does not close it
    })
}

pub unsafe fn unmap(ptr: *mut u8, len: usize) {
    libc::munmap(ptr as *mut libc::c_void, len);
}

pub fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

pub fn shm_unlink(name: &str) {
    if let Ok(cname) = cstring_name(name) {
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
    }
}

/// Best-effort hole-punch: try `MADV_REMOVE`, then `MADV_FREE`, then
/// `MADV_DONTNEED`, stopping at the first that succeeds. Returns whether
/// any advice call succeeded.
pub unsafe fn punch(ptr: *mut u8, offset: usize, len: usize) -> bool {
    let target = ptr.add(offset) as *mut libc::c_void;
    #[cfg(target_os = "linux")]
    {
        if libc::madvise(target, len, libc::MADV_REMOVE) == 0 {
            return true;
        }
    }
    if libc::madvise(target, len, libc::MADV_FREE) == 0 {
        return true;
    }
    libc::madvise(target, len, libc::MADV_DONTNEED) == 0
}

/// `kill(pid, 0)` liveness probe used by segment cleanup: a dead owner
/// (`ESRCH`) marks a segment as orphaned and eligible for removal.
pub fn process_alive(pid: i32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    let err = io::Error::last_os_error();
    err.raw_os_error() != Some(libc::ESRCH)
}

pub fn current_pid() -> i32 {
    unsafe { libc::getpid() as i32 }
}

/// List the names of segments under `/dev/shm` (POSIX shared memory's
/// conventional backing directory on Linux), without the leading `/`.
pub fn list_shm_segments() -> Vec<String> {
    let dir = match std::fs::read_dir("/dev/shm") {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    dir.filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect()
}
