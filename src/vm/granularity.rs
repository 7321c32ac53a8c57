// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::OnceLock;

// (reserve, commit)
static GRANULARITY: OnceLock<(usize, usize)> = OnceLock::new();

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn query() -> (usize, usize) {
            // SAFETY: sysconf is always safe to call
            let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            debug_assert!(page > 0);
            let page = page as usize;
            (page, page)
        }
    } else {
        fn query() -> (usize, usize) {
            use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

            let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };

            // SAFETY: the struct is plain data and fully written by the call
            unsafe { GetSystemInfo(&mut info) };

            (
                info.dwAllocationGranularity as usize,
                info.dwPageSize as usize,
            )
        }
    }
}

/// Minimum size and alignment at which the OS grants address-space
/// reservations. Queried once per process.
#[must_use]
pub fn reserve_granularity() -> usize {
    GRANULARITY.get_or_init(query).0
}

/// Minimum size and alignment at which physical backing can be bound to a
/// reserved range (the memory page size). Queried once per process.
#[must_use]
pub fn commit_granularity() -> usize {
    GRANULARITY.get_or_init(query).1
}

#[must_use]
pub(crate) fn align_up(value: usize, granularity: usize) -> usize {
    debug_assert!(granularity.is_power_of_two());
    (value + granularity - 1) & !(granularity - 1)
}

#[must_use]
pub(crate) fn align_down(value: usize, granularity: usize) -> usize {
    debug_assert!(granularity.is_power_of_two());
    value & !(granularity - 1)
}

#[must_use]
pub(crate) fn is_aligned(value: usize, granularity: usize) -> bool {
    value & (granularity - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn granularities_are_sane() {
        let reserve = reserve_granularity();
        let commit = commit_granularity();
        assert!(commit.is_power_of_two());
        assert!(reserve.is_power_of_two());
        assert!(reserve >= commit);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(8191, 4096));
    }
}
