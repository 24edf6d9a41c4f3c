//! Host memory queries.

use crate::size_class::PAGE_SIZE;

/// Physical memory of the host, in 4KB pages.
///
/// Returns `None` when the host does not report it.
#[cfg(unix)]
pub(crate) fn physical_page_count() -> Option<usize> {
    // SAFETY: sysconf has no preconditions; it only reads system limits.
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    let bytes = (pages as u128).checked_mul(page_size as u128)?;
    usize::try_from(bytes / PAGE_SIZE as u128).ok()
}

#[cfg(not(unix))]
pub(crate) fn physical_page_count() -> Option<usize> {
    None
}
