// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows raw mapping primitives backing `ShmSegment`. Named shared memory
// goes through `CreateFileMappingW`/`OpenFileMappingW` (pagefile-backed, no
// unlinkable file). There is no Windows equivalent of `memfd_create`; the
// `MemfdShared` kind degrades to a pagefile-backed mapping whose handle is
// kept open for transport registration, matching the POSIX variant's
// observable contract even though the underlying primitive differs.

use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};

pub struct RawMapping {
    pub ptr: *mut u8,
    pub len: usize,
    pub handle: HANDLE,
}

unsafe impl Send for RawMapping {}
unsafe impl Sync for RawMapping {}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

pub fn page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::GetSystemInfo;
    let mut info = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    let gran = info.dwPageSize;
    if gran == 0 {
        4096
    } else {
        gran as usize
    }
}

pub fn round_up_to_page(size: usize) -> usize {
    let ps = page_size();
    (size + ps - 1) / ps * ps
}

pub fn map_private(size: usize) -> io::Result<RawMapping> {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

    let ptr = unsafe { VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(RawMapping {
        ptr: ptr as *mut u8,
        len: size,
        handle: 0,
    })
}

pub fn create_posix_shared(name: &str, size: usize, _mode: u32) -> io::Result<RawMapping> {
    use windows_sys::Win32::Foundation::{GetLastError, ERROR_ALREADY_EXISTS};
    use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
    use windows_sys::Win32::System::Memory::{CreateFileMappingW, PAGE_READWRITE};

    let wide = to_wide(name);
    let handle = unsafe {
        CreateFileMappingW(INVALID_HANDLE_VALUE, ptr::null(), PAGE_READWRITE, 0, size as u32, wide.as_ptr())
    };
    let err = unsafe { GetLastError() };
    if handle != 0 && err == ERROR_ALREADY_EXISTS {
        unsafe { CloseHandle(handle) };
        return Err(io::Error::new(io::ErrorKind::AlreadyExists, "shm already exists"));
    }
    if handle == 0 {
        return Err(io::Error::last_os_error());
    }
    map_view(handle, size)
}

pub fn open_posix_shared(name: &str, writable: bool) -> io::Result<RawMapping> {
    use windows_sys::Win32::Foundation::FALSE;
    use windows_sys::Win32::System::Memory::{OpenFileMappingW, FILE_MAP_ALL_ACCESS, FILE_MAP_READ};

    let wide = to_wide(name);
    let access = if writable { FILE_MAP_ALL_ACCESS } else { FILE_MAP_READ };
    let handle = unsafe { OpenFileMappingW(access, FALSE, wide.as_ptr()) };
    if handle == 0 {
        return Err(io::Error::last_os_error());
    }
    map_view_discover_size(handle)
}

/// Degraded `MemfdShared`: a pagefile-backed named mapping whose handle the
/// caller keeps open for later transport registration. Windows has no
/// sealable anonymous-fd primitive; this preserves the "fd stays open"
/// contract at the handle level.
pub fn create_memfd_shared(name: &str, size: usize) -> io::Result<RawMapping> {
    create_posix_shared(name, size, 0)
}

pub fn attach_foreign_fd(handle: isize, size: usize, _writable: bool) -> io::Result<RawMapping> {
    map_view(handle, size)
}

fn map_view(handle: HANDLE, size: usize) -> io::Result<RawMapping> {
    use windows_sys::Win32::System::Memory::{MapViewOfFile, FILE_MAP_ALL_ACCESS};

    let mem = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
    if mem.is_null() {
        let e = io::Error::last_os_error();
        unsafe { CloseHandle(handle) };
        return Err(e);
    }
    Ok(RawMapping {
        ptr: mem as *mut u8,
        len: size,
        handle,
    })
}

fn map_view_discover_size(handle: HANDLE) -> io::Result<RawMapping> {
    use windows_sys::Win32::System::Memory::{
        MapViewOfFile, VirtualQuery, FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION,
    };

    let mem = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
    if mem.is_null() {
        let e = io::Error::last_os_error();
        unsafe { CloseHandle(handle) };
        return Err(e);
    }
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let ret = unsafe { VirtualQuery(mem as *const _, &mut info, std::mem::size_of::<MEMORY_BASIC_INFORMATION>()) };
    if ret == 0 {
        let e = io::Error::last_os_error();
        unsafe {
            windows_sys::Win32::System::Memory::UnmapViewOfFile(mem as *const _);
            CloseHandle(handle);
        }
        return Err(e);
    }
    Ok(RawMapping {
        ptr: mem as *mut u8,
        len: info.RegionSize,
        handle,
    })
}

pub unsafe fn unmap(ptr: *mut u8, _len: usize) {
    windows_sys::Win32::System::Memory::UnmapViewOfFile(ptr as *const _);
}

pub fn close_fd(handle: isize) {
    if handle != 0 {
        unsafe {
            CloseHandle(handle);
        }
    }
}

/// No-op: Windows named mappings are pagefile-backed with no unlinkable
/// file, matching the distilled design's "unlink is POSIX-only" note.
pub fn shm_unlink(_name: &str) {}

/// `VirtualAlloc`/`VirtualFree` based best-effort decommit: the closest
/// Windows analogue to `MADV_DONTNEED` — the pages are zeroed on next
/// touch but the mapping stays reserved.
pub unsafe fn punch(ptr: *mut u8, offset: usize, len: usize) -> bool {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESET, PAGE_READWRITE};
    let target = ptr.add(offset);
    !VirtualAlloc(target as *const _, len, MEM_RESET, PAGE_READWRITE).is_null()
}

/// Windows has no direct `kill(pid, 0)` probe from user mode without a
/// process handle; treat every recorded owner as alive (cleanup is a
/// POSIX-only concern per the distilled design's §4.1, since Windows
/// segments carry no unlinkable file to clean up).
pub fn process_alive(_pid: i32) -> bool {
    true
}

pub fn current_pid() -> i32 {
    std::process::id() as i32
}

pub fn list_shm_segments() -> Vec<String> {
    Vec::new()
}
