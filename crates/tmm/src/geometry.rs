//! Pure geometry rules for block and buffer sizing.
//!
//! These are total, side-effect-free functions; every size and stride the
//! manager computes goes through here.

/// System page size in bytes.
///
/// Page-mode allocation lengths, default row strides, and the alignment
/// requirements for mapped memory are all expressed in terms of this.
pub const PAGE_SIZE: usize = 4096;

/// Returns the system page size in bytes.
#[inline]
pub const fn page_size() -> usize {
    PAGE_SIZE
}

/// Computes the default row stride for a row of `row_bytes` bytes.
///
/// A zero-byte row has no stride; otherwise the row is padded up to the
/// next page boundary.
#[inline]
pub const fn default_stride(row_bytes: usize) -> usize {
    if row_bytes == 0 {
        0
    } else {
        (row_bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }
}

/// Returns true if `len` occupies a whole number of pages.
#[inline]
pub(crate) const fn is_page_multiple(len: usize) -> bool {
    len & (PAGE_SIZE - 1) == 0
}
