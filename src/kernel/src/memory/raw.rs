//! Raw byte primitives used by the allocator and its callers.

/// Copies `size` bytes from `src` to `dest`.
///
/// # Safety
///
/// Both ranges must be valid for `size` bytes and must not overlap.
#[inline]
pub unsafe fn memory_copy(dest: *mut u8, src: *const u8, size: usize) {
    // SAFETY: upheld by the caller.
    unsafe { core::ptr::copy_nonoverlapping(src, dest, size) };
}

/// Writes `size` zero bytes starting at `dest`.
///
/// # Safety
///
/// `dest` must be valid for writes of `size` bytes.
#[inline]
pub unsafe fn zero_fill(dest: *mut u8, size: usize) {
    // SAFETY: upheld by the caller.
    unsafe { core::ptr::write_bytes(dest, 0, size) };
}
