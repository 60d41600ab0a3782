//! Small integer helpers shared by the stride and mask-layout math.

/// Integer division rounding towards positive infinity.
///
/// `d` must be non-zero.
#[inline]
pub const fn ceil_div(n: usize, d: usize) -> usize {
    n.div_ceil(d)
}
