// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{allocate, allocate_fixed, is_aligned, release, reserve_granularity};
#[cfg(windows)]
use super::align_up;
use super::{AllocType, RelocType, Span};
use std::ptr::NonNull;

/// How [`expand`] satisfied the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpandMethod {
    /// Same base address, tail grown in place.
    BackExtended,
    /// Same end address, head grown in place.
    FrontExtended,
    /// The region was relocated; the used prefix holds the same bytes.
    Moved,
}

/// A successful expansion.
#[derive(Clone, Copy, Debug)]
pub struct Expansion {
    pub span: Span,
    pub method: ExpandMethod,
}

/// Grows the region `[base, base + current_size)` to `back_size` and/or
/// `front_size` bytes, preferring in-place extension over relocation and
/// relocation over failure.
///
/// `used` is the length of the meaningful prefix that must be preserved
/// across a relocation. On failure (`None`) the original region is left
/// intact and untouched.
///
/// # Safety
///
/// `base` must be a live region of exactly `current_size` bytes owned by the
/// caller, with `used <= current_size`; all sizes must be multiples of the
/// reserve granularity and at least one target must exceed `current_size`.
/// After a `Moved` result the old base must not be referenced again.
pub unsafe fn expand(
    base: NonNull<u8>,
    current_size: usize,
    back_size: usize,
    front_size: usize,
    used: usize,
    alloc_type: AllocType,
    reloc_type: RelocType,
) -> Option<Expansion> {
    debug_assert!(current_size > 0);
    debug_assert!(used <= current_size);
    debug_assert!(back_size > current_size || front_size > current_size);
    debug_assert!(is_aligned(base.as_ptr() as usize, reserve_granularity()));
    debug_assert!(is_aligned(current_size, reserve_granularity()));
    debug_assert!(is_aligned(back_size, reserve_granularity()));
    debug_assert!(is_aligned(front_size, reserve_granularity()));

    // - append
    if back_size != 0 {
        #[cfg(target_os = "linux")]
        {
            // mremap requires uniform protection over the whole range
            unsafe {
                libc::mprotect(
                    base.as_ptr().cast(),
                    current_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };

            let flags = match reloc_type {
                RelocType::Fixed => 0,
                RelocType::Moveable => libc::MREMAP_MAYMOVE,
            };

            // SAFETY: per contract the range is a live owned mapping
            let remapped =
                unsafe { libc::mremap(base.as_ptr().cast(), current_size, back_size, flags) };

            if remapped != libc::MAP_FAILED {
                let ptr = NonNull::new(remapped.cast::<u8>())?;
                let method = if ptr == base {
                    ExpandMethod::BackExtended
                } else {
                    debug_assert!(reloc_type == RelocType::Moveable);
                    ExpandMethod::Moved
                };
                return Some(Expansion {
                    span: Span {
                        ptr,
                        len: back_size,
                    },
                    method,
                });
            }
        }

        #[cfg(windows)]
        if let Some(expansion) =
            unsafe { win::replace_trailing_placeholder(base, current_size, back_size, alloc_type) }
        {
            return Some(expansion);
        }

        // Adjacent fixed allocation right after the current tail. On Linux
        // mremap already covers this, elsewhere it is the in-place path.
        let tail = unsafe { NonNull::new_unchecked(base.as_ptr().add(current_size)) };
        let additional = back_size - current_size;
        if unsafe { allocate_fixed(tail, additional, alloc_type) } {
            log::trace!("expand: back-extended {current_size} -> {back_size} B in place");
            return Some(Expansion {
                span: Span {
                    ptr: base,
                    len: back_size,
                },
                method: ExpandMethod::BackExtended,
            });
        }
    }

    // - prepend
    if front_size != 0 {
        let additional = front_size - current_size;
        let front = NonNull::new(unsafe { base.as_ptr().sub(additional) })?;
        // committed, so that a committed range is never preceded by a
        // reserved one
        if unsafe { allocate_fixed(front, additional, AllocType::Commit) } {
            log::trace!("expand: front-extended {current_size} -> {front_size} B in place");
            return Some(Expansion {
                span: Span {
                    ptr: front,
                    len: front_size,
                },
                method: ExpandMethod::FrontExtended,
            });
        }
    }

    if reloc_type == RelocType::Moveable && back_size != 0 {
        #[cfg(target_os = "macos")]
        if let Some(expansion) = unsafe { mach::remap_into_larger(base, current_size, back_size) } {
            return Some(expansion);
        }

        #[cfg(windows)]
        if let Some(expansion) =
            unsafe { win::relocate_with_headroom(base, current_size, back_size, used, alloc_type) }
        {
            return Some(expansion);
        }

        // Last resort: allocate fresh, copy the used prefix, free the old
        // region.
        if let Some(fresh) = allocate(back_size) {
            log::debug!("expand: relocating {current_size} -> {back_size} B by copy");
            unsafe {
                std::ptr::copy_nonoverlapping(base.as_ptr(), fresh.as_mut_ptr(), used);
                release(base, current_size);
            }
            return Some(Expansion {
                span: fresh,
                method: ExpandMethod::Moved,
            });
        }
    }

    log::warn!("expand: could not grow region of {current_size} B");
    None
}

#[cfg(target_os = "macos")]
mod mach {
    use super::{Expansion, ExpandMethod, NonNull, Span};
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_remap};
    use mach2::vm_inherit::VM_INHERIT_NONE;
    use mach2::vm_prot::vm_prot_t;
    use mach2::vm_statistics::VM_FLAGS_ANYWHERE;
    use mach2::vm_types::mach_vm_address_t;

    const VM_FLAGS_FIXED: i32 = 0x0000;
    const VM_FLAGS_OVERWRITE: i32 = 0x4000;

    /// Moves the existing pages zero-copy into the head of a fresh, larger
    /// allocation and frees the old range.
    pub unsafe fn remap_into_larger(
        base: NonNull<u8>,
        current_size: usize,
        back_size: usize,
    ) -> Option<Expansion> {
        let task = unsafe { mach_task_self() };
        let mut new_addr: mach_vm_address_t = 0;

        let kr = unsafe { mach_vm_allocate(task, &mut new_addr, back_size as u64, VM_FLAGS_ANYWHERE) };
        if kr != KERN_SUCCESS {
            return None;
        }

        let mut cur_prot: vm_prot_t = 0;
        let mut max_prot: vm_prot_t = 0;
        let kr = unsafe {
            mach_vm_remap(
                task,
                &mut new_addr,
                current_size as u64,
                0,
                VM_FLAGS_FIXED | VM_FLAGS_OVERWRITE,
                task,
                base.as_ptr() as mach_vm_address_t,
                0, // copy = FALSE: share/move pages
                &mut cur_prot,
                &mut max_prot,
                VM_INHERIT_NONE,
            )
        };

        if kr != KERN_SUCCESS {
            unsafe { mach_vm_deallocate(task, new_addr, back_size as u64) };
            return None;
        }

        unsafe { mach_vm_deallocate(task, base.as_ptr() as mach_vm_address_t, current_size as u64) };

        log::trace!("expand: mach_vm_remap moved {current_size} -> {back_size} B zero-copy");

        Some(Expansion {
            span: Span {
                ptr: NonNull::new(new_addr as *mut u8)?,
                len: back_size,
            },
            method: ExpandMethod::Moved,
        })
    }
}

#[cfg(windows)]
mod win {
    use super::{align_up, release, reserve_granularity, AllocType, Expansion, ExpandMethod, NonNull, Span};
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc2, VirtualFree, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
        MEM_PRESERVE_PLACEHOLDER, MEM_RELEASE, MEM_RESERVE, MEM_RESERVE_PLACEHOLDER,
        MEM_REPLACE_PLACEHOLDER, PAGE_NOACCESS, PAGE_READWRITE,
    };

    fn commit_flags(alloc_type: AllocType) -> (u32, u32) {
        match alloc_type {
            AllocType::Reserve => (MEM_RESERVE, PAGE_NOACCESS),
            AllocType::Commit => (MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE),
        }
    }

    /// If a previous over-reserving expansion left a trailing placeholder,
    /// split and replace it for guaranteed in-place growth without a copy.
    pub unsafe fn replace_trailing_placeholder(
        base: NonNull<u8>,
        current_size: usize,
        back_size: usize,
        alloc_type: AllocType,
    ) -> Option<Expansion> {
        let additional = back_size - current_size;
        let tail = unsafe { base.as_ptr().add(current_size) };

        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let written = unsafe {
            VirtualQuery(
                tail.cast(),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 || info.State != MEM_RESERVE || (info.RegionSize as usize) < additional {
            return None;
        }

        // An oversized placeholder is split first; releasing with
        // MEM_PRESERVE_PLACEHOLDER only succeeds on actual placeholders, so
        // this doubles as the type check.
        if info.RegionSize as usize > additional
            && unsafe { VirtualFree(tail.cast(), additional, MEM_RELEASE | MEM_PRESERVE_PLACEHOLDER) }
                == 0
        {
            return None;
        }

        let (flags, protection) = commit_flags(alloc_type);
        let replaced = unsafe {
            VirtualAlloc2(
                std::ptr::null_mut(),
                tail.cast(),
                additional,
                flags | MEM_REPLACE_PLACEHOLDER,
                protection,
                std::ptr::null_mut(),
                0,
            )
        };
        if replaced.is_null() {
            return None;
        }

        Some(Expansion {
            span: Span {
                ptr: base,
                len: back_size,
            },
            method: ExpandMethod::BackExtended,
        })
    }

    /// Over-reserving relocation: a placeholder of twice the requested size
    /// is split into [region | headroom]; the headroom placeholder stays
    /// behind so that later expansions can grow in place.
    pub unsafe fn relocate_with_headroom(
        base: NonNull<u8>,
        current_size: usize,
        back_size: usize,
        used: usize,
        alloc_type: AllocType,
    ) -> Option<Expansion> {
        let total = align_up(back_size * 2, reserve_granularity());

        let placeholder = unsafe {
            VirtualAlloc2(
                std::ptr::null_mut(),
                std::ptr::null(),
                total,
                MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
                PAGE_NOACCESS,
                std::ptr::null_mut(),
                0,
            )
        };
        let placeholder = NonNull::new(placeholder.cast::<u8>())?;

        if unsafe {
            VirtualFree(
                placeholder.as_ptr().cast(),
                back_size,
                MEM_RELEASE | MEM_PRESERVE_PLACEHOLDER,
            )
        } == 0
        {
            unsafe { VirtualFree(placeholder.as_ptr().cast(), 0, MEM_RELEASE) };
            return None;
        }

        let (flags, protection) = commit_flags(alloc_type);
        let committed = unsafe {
            VirtualAlloc2(
                std::ptr::null_mut(),
                placeholder.as_ptr().cast(),
                back_size,
                flags | MEM_REPLACE_PLACEHOLDER,
                protection,
                std::ptr::null_mut(),
                0,
            )
        };
        if committed.is_null() {
            unsafe {
                VirtualFree(placeholder.as_ptr().cast(), 0, MEM_RELEASE);
                VirtualFree(placeholder.as_ptr().add(back_size).cast(), 0, MEM_RELEASE);
            }
            return None;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(base.as_ptr(), placeholder.as_ptr(), used);
            release(base, current_size);
        }

        log::trace!(
            "expand: over-reserved relocation {current_size} -> {back_size} B (+{} B headroom)",
            total - back_size
        );

        Some(Expansion {
            span: Span {
                ptr: placeholder,
                len: back_size,
            },
            method: ExpandMethod::Moved,
        })
    }
}
