// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{align_up, is_aligned, reserve_granularity, AllocType, Span};
use std::ptr::NonNull;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod sys {
            use super::{AllocType, NonNull};

            pub fn protection(alloc_type: AllocType) -> libc::c_int {
                match alloc_type {
                    AllocType::Reserve => libc::PROT_NONE,
                    AllocType::Commit => libc::PROT_READ | libc::PROT_WRITE,
                }
            }

            /// Anonymous private mapping, optionally at a hinted address.
            pub fn mmap(addr: *mut u8, len: usize, prot: libc::c_int, extra_flags: libc::c_int) -> Option<NonNull<u8>> {
                // SAFETY: anonymous mapping, the kernel validates all arguments
                let ptr = unsafe {
                    libc::mmap(
                        addr.cast(),
                        len,
                        prot,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
                        -1,
                        0,
                    )
                };

                if ptr == libc::MAP_FAILED {
                    None
                } else {
                    NonNull::new(ptr.cast())
                }
            }
        }
    } else {
        mod sys {
            use super::{AllocType, NonNull};
            use windows_sys::Win32::System::Memory::{
                VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE,
            };

            pub fn alloc_flags(alloc_type: AllocType) -> (u32, u32) {
                match alloc_type {
                    AllocType::Reserve => (MEM_RESERVE, PAGE_NOACCESS),
                    AllocType::Commit => (MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE),
                }
            }

            pub fn virtual_alloc(addr: *mut u8, len: usize, alloc_type: AllocType) -> Option<NonNull<u8>> {
                let (flags, protection) = alloc_flags(alloc_type);

                // SAFETY: VirtualAlloc validates all arguments
                let ptr = unsafe { VirtualAlloc(addr.cast(), len, flags, protection) };
                NonNull::new(ptr.cast())
            }
        }
    }
}

/// Allocates a fresh committed read-write region of at least `size` bytes
/// (rounded up to the reserve granularity).
///
/// Returns `None` when the address space or backing memory is exhausted.
#[must_use]
pub fn allocate(size: usize) -> Option<Span> {
    let len = align_up(size, reserve_granularity());

    #[cfg(unix)]
    let ptr = sys::mmap(
        std::ptr::null_mut(),
        len,
        sys::protection(AllocType::Commit),
        libc::MAP_NORESERVE,
    )?;

    #[cfg(windows)]
    let ptr = sys::virtual_alloc(std::ptr::null_mut(), len, AllocType::Commit)?;

    Some(Span { ptr, len })
}

/// Reserves address space of at least `size` bytes without committing any
/// physical backing.
#[must_use]
pub fn reserve(size: usize) -> Option<Span> {
    let len = align_up(size, reserve_granularity());

    #[cfg(unix)]
    let ptr = sys::mmap(
        std::ptr::null_mut(),
        len,
        sys::protection(AllocType::Reserve),
        libc::MAP_NORESERVE,
    )?;

    #[cfg(windows)]
    let ptr = sys::virtual_alloc(std::ptr::null_mut(), len, AllocType::Reserve)?;

    Some(Span { ptr, len })
}

/// Commits physical backing for a previously reserved range, making it
/// read-write.
///
/// # Safety
///
/// `ptr..ptr + len` must lie within a live region obtained from this module
/// and both must be aligned to the commit granularity.
pub unsafe fn commit(ptr: NonNull<u8>, len: usize) -> bool {
    debug_assert!(is_aligned(ptr.as_ptr() as usize, super::commit_granularity()));
    debug_assert!(is_aligned(len, super::commit_granularity()));

    #[cfg(unix)]
    {
        let ok = unsafe {
            libc::mprotect(
                ptr.as_ptr().cast(),
                len,
                sys::protection(AllocType::Commit),
            ) == 0
        };
        if ok {
            unsafe { libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_WILLNEED) };
        }
        ok
    }

    #[cfg(windows)]
    {
        sys::virtual_alloc(ptr.as_ptr(), len, AllocType::Commit).is_some()
    }
}

/// Returns the physical backing of a committed range while keeping the
/// address-space reservation.
///
/// # Safety
///
/// Same requirements as [`commit`]; nothing may reference the range contents
/// afterwards.
pub unsafe fn decommit(ptr: NonNull<u8>, len: usize) {
    debug_assert!(is_aligned(ptr.as_ptr() as usize, reserve_granularity()));
    debug_assert!(is_aligned(len, reserve_granularity()));

    #[cfg(unix)]
    unsafe {
        libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_DONTNEED);
        libc::mprotect(ptr.as_ptr().cast(), len, sys::protection(AllocType::Reserve));
    }

    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_DECOMMIT};
        VirtualFree(ptr.as_ptr().cast(), len, MEM_DECOMMIT);
    }
}

/// Releases a reservation entirely.
///
/// # Safety
///
/// `ptr..ptr + len` must be exactly a live region (or a tail split of one on
/// hosts that support partial unmapping) and must not be referenced again.
pub unsafe fn release(ptr: NonNull<u8>, len: usize) {
    debug_assert!(is_aligned(ptr.as_ptr() as usize, reserve_granularity()));
    debug_assert!(is_aligned(len, reserve_granularity()));

    #[cfg(unix)]
    unsafe {
        libc::munmap(ptr.as_ptr().cast(), len);
    }

    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
        let _ = len;
        VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE);
    }
}

/// Allocates exactly at `addr`, or fails. Never overwrites an existing
/// mapping.
///
/// # Safety
///
/// `addr` must be aligned to the reserve granularity and must not point into
/// a region owned by anyone else (a successful result transfers ownership of
/// the new range to the caller).
pub unsafe fn allocate_fixed(addr: NonNull<u8>, len: usize, alloc_type: AllocType) -> bool {
    debug_assert!(is_aligned(addr.as_ptr() as usize, reserve_granularity()));
    debug_assert!(is_aligned(len, reserve_granularity()));

    #[cfg(unix)]
    {
        // MAP_FIXED silently clobbers existing mappings, so it cannot be
        // used here. Linux 4.17 has MAP_FIXED_NOREPLACE; elsewhere the
        // address is a hint and a mismatched placement is unmapped again.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let fixed_flag = libc::MAP_FIXED_NOREPLACE;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let fixed_flag = 0;

        match sys::mmap(addr.as_ptr(), len, sys::protection(alloc_type), fixed_flag) {
            Some(actual) if actual == addr => true,
            Some(actual) => {
                debug_assert!(fixed_flag == 0);
                unsafe { libc::munmap(actual.as_ptr().cast(), len) };
                false
            }
            None => false,
        }
    }

    #[cfg(windows)]
    {
        sys::virtual_alloc(addr.as_ptr(), len, alloc_type).is_some()
    }
}
