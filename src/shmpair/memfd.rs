// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Raw Linux memfd + seal + mmap primitives backing the shmpair transport.
// Kept as thin, direct libc calls in the same style as the POSIX shm
// backend: no wrapper crate hides the syscalls, because the exact seal
// sequence is part of the protocol's correctness contract.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;

/// The seal set every shmpair memfd must carry once sealed: no shrink, no
/// grow, and no further sealing (so this set itself becomes immutable).
pub const REQUIRED_SEALS: i32 = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL;

/// Create an anonymous sealed memfd of exactly `size` bytes.
pub fn create_sealed(debug_name: &str, size: usize) -> io::Result<OwnedFd> {
    let cname = CString::new(debug_name).unwrap_or_else(|_| CString::new("shmpair").unwrap());
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by memfd_create and is owned by us.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let ret = unsafe { libc::ftruncate(owned.as_raw_fd(), size as libc::off_t) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let ret = unsafe { libc::fcntl(owned.as_raw_fd(), libc::F_ADD_SEALS, REQUIRED_SEALS) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(owned)
}

/// Read back the seal bitmask currently applied to `fd`.
pub fn get_seals(fd: BorrowedFd<'_>) -> io::Result<i32> {
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GET_SEALS) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// Current size in bytes of the file backing `fd`, via `fstat`.
pub fn file_size(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd.as_raw_fd(), &mut st) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_size as u64)
}

/// Map `len` bytes of `fd` read/write, shared.
///
/// # Safety
/// The caller must ensure `len` does not exceed the file's size and must
/// `munmap` the returned pointer exactly once.
pub unsafe fn mmap_rw(fd: BorrowedFd<'_>, len: usize) -> io::Result<*mut u8> {
    let ptr = libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd.as_raw_fd(),
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

/// Map `len` bytes of `fd` read-only, shared. Used for the inbound
/// (foreign) pool, which must never be writable from this process.
///
/// # Safety
/// Same contract as [`mmap_rw`].
pub unsafe fn mmap_ro(fd: BorrowedFd<'_>, len: usize) -> io::Result<*mut u8> {
    let ptr = libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ,
        libc::MAP_SHARED,
        fd.as_raw_fd(),
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

/// Unmap a region previously returned by [`mmap_rw`]/[`mmap_ro`].
///
/// # Safety
/// `ptr`/`len` must exactly match a prior successful mmap call, and must
/// not have already been unmapped.
pub unsafe fn munmap(ptr: *mut u8, len: usize) {
    libc::munmap(ptr as *mut libc::c_void, len);
}
