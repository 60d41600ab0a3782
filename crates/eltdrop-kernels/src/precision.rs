//! Conversion between f32 and bf16.
//!
//! `widen` is exact: the 16 stored bits become the upper half of a binary32
//! and the lower half is zero. `narrow` rounds the discarded 16 bits to
//! nearest, ties to even, by adding `0x7FFF + bit16` before truncating.
//! Kernels compute in f32 and narrow exactly once, at the store.

use crate::buffer::{Buffer, BufferMut};
use eltdrop_common::DataType;
use half::bf16;

/// Widen a bf16 to f32. Exact.
#[inline]
pub fn widen(x: bf16) -> f32 {
    f32::from_bits(u32::from(x.to_bits()) << 16)
}

/// Narrow an f32 to bf16 with round-to-nearest-even.
///
/// NaN is truncated and quieted instead of rounded: the bias could carry a
/// payload into the exponent and turn it into an infinity.
#[inline]
pub fn narrow(x: f32) -> bf16 {
    let bits = x.to_bits();
    if x.is_nan() {
        return bf16::from_bits(((bits >> 16) as u16) | 0x0040);
    }
    let bias = 0x7FFF + ((bits >> 16) & 1);
    bf16::from_bits((bits.wrapping_add(bias) >> 16) as u16)
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for half::bf16 {}
}

/// A buffer element the kernels can load and store.
///
/// Sealed: the SIMD kernels reinterpret element slices by `DATA_TYPE`.
pub trait Element: sealed::Sealed + Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;
    const ZERO: Self;

    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;

    fn slice<'a>(buffer: Buffer<'a>) -> Option<&'a [Self]>;
    fn slice_mut<'a>(buffer: BufferMut<'a>) -> Option<&'a mut [Self]>;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;
    const ZERO: Self = 0.0;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    fn slice<'a>(buffer: Buffer<'a>) -> Option<&'a [Self]> {
        match buffer {
            Buffer::F32(s) => Some(s),
            Buffer::BF16(_) => None,
        }
    }

    fn slice_mut<'a>(buffer: BufferMut<'a>) -> Option<&'a mut [Self]> {
        match buffer {
            BufferMut::F32(s) => Some(s),
            BufferMut::BF16(_) => None,
        }
    }
}

impl Element for bf16 {
    const DATA_TYPE: DataType = DataType::BF16;
    const ZERO: Self = bf16::ZERO;

    #[inline]
    fn to_f32(self) -> f32 {
        widen(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        narrow(value)
    }

    fn slice<'a>(buffer: Buffer<'a>) -> Option<&'a [Self]> {
        match buffer {
            Buffer::BF16(s) => Some(s),
            Buffer::F32(_) => None,
        }
    }

    fn slice_mut<'a>(buffer: BufferMut<'a>) -> Option<&'a mut [Self]> {
        match buffer {
            BufferMut::BF16(s) => Some(s),
            BufferMut::F32(_) => None,
        }
    }
}
