//! x86_64 CPU kernel with AVX2 optimizations
#![allow(unsafe_op_in_unsafe_fn)]

use super::{BackwardJob, ForwardJob, MaskSink, MaskSource, RowKernel, run_backward, run_forward};
use crate::DropoutKernel;
use crate::bitmask::lane_mask;
use crate::buffer::{Buffer, BufferMut, MaskIn, MaskOut};
use crate::precision::Element;
use crate::rng::UniformStream;
use eltdrop_common::{
    DataType, DropoutDescriptor, EltDropError, KernelError, MAX_CHUNK_WIDTH, Result,
};
use std::arch::x86_64::*;

/// f32 lanes per 256-bit register.
const LANES: usize = 8;

/// AVX2 optimized CPU kernel for x86_64
///
/// Processes each chunk as 8-lane blocks, so only chunk widths that are a
/// multiple of 8 are accepted. Results are bit-identical to
/// [`FallbackKernel`](super::FallbackKernel) for the same draws.
pub struct Avx2Kernel;

impl Avx2Kernel {
    fn check_usable(&self, chunk_width: usize) -> Result<()> {
        if !self.is_available() {
            return Err(EltDropError::Kernel(KernelError::UnsupportedHardware {
                required: "AVX2".to_string(),
                available: "none".to_string(),
            }));
        }
        if !self.supports_chunk_width(chunk_width) {
            return Err(KernelError::unsupported(format!(
                "avx2 kernel needs a chunk width that is a multiple of {LANES}, got {chunk_width}"
            ))
            .into());
        }
        Ok(())
    }
}

impl DropoutKernel for Avx2Kernel {
    fn name(&self) -> &'static str {
        "avx2"
    }

    fn is_available(&self) -> bool {
        is_x86_feature_detected!("avx2")
    }

    fn supports_chunk_width(&self, chunk_width: usize) -> bool {
        chunk_width > 0 && chunk_width <= MAX_CHUNK_WIDTH && chunk_width % LANES == 0
    }

    fn forward(
        &self,
        desc: &DropoutDescriptor,
        input: Buffer<'_>,
        output: BufferMut<'_>,
        mask: MaskOut<'_>,
        rng: &mut dyn UniformStream,
        p: f32,
    ) -> Result<()> {
        self.check_usable(desc.chunk_width)?;
        run_forward(self, desc, input, output, mask, rng, p)
    }

    fn backward(
        &self,
        desc: &DropoutDescriptor,
        input: Buffer<'_>,
        output: BufferMut<'_>,
        mask: MaskIn<'_>,
        p: f32,
    ) -> Result<()> {
        self.check_usable(desc.chunk_width)?;
        run_backward(self, desc, input, output, mask, p)
    }
}

impl RowKernel for Avx2Kernel {
    fn forward_rows<Tin: Element, Tout: Element>(
        &self,
        job: ForwardJob<'_, Tin, Tout>,
        rng: &mut dyn UniformStream,
    ) {
        // Safety: jobs only reach this point through `forward`, after
        // `check_usable` confirmed AVX2 and a chunk width of whole blocks.
        unsafe { forward_rows_avx2(job, rng) }
    }

    fn backward_rows<Tin: Element, Tout: Element, Tm: Element>(
        &self,
        job: BackwardJob<'_, Tin, Tout>,
        mask: MaskSource<'_, Tm>,
    ) {
        // Safety: as above, via `backward`.
        unsafe { backward_rows_avx2(job, mask) }
    }
}

#[target_feature(enable = "avx2")]
unsafe fn forward_rows_avx2<Tin: Element, Tout: Element>(
    job: ForwardJob<'_, Tin, Tout>,
    rng: &mut dyn UniformStream,
) {
    let ForwardJob {
        layout,
        codec,
        row_count,
        input_stride,
        output_stride,
        input,
        output,
        mut mask,
        probability,
        multiplier,
    } = job;
    let width = layout.chunk_width;
    let keep = _mm256_set1_ps(probability.keep);
    let scale = _mm256_set1_ps(multiplier);
    let mut draws = [0.0f32; MAX_CHUNK_WIDTH];

    for row in 0..row_count {
        let in_row = &input[row * input_stride..][..layout.row_width];
        let out_row = &mut output[row * output_stride..][..layout.row_width];

        for chunk in 0..layout.chunks_per_row {
            rng.next_chunk(&mut draws[..width]);
            let start = chunk * width;
            let valid = layout.valid_lanes(chunk);
            let mut bits = 0u64;

            for block in (0..valid).step_by(LANES) {
                let lanes = (valid - block).min(LANES);
                let offset = start + block;

                let x = load_lanes(&in_row[offset..offset + lanes]);
                let r = _mm256_loadu_ps(draws.as_ptr().add(block));
                let kept = _mm256_cmp_ps::<_CMP_LT_OQ>(r, keep);
                let y = _mm256_and_ps(_mm256_mul_ps(x, scale), kept);
                store_lanes(y, &mut out_row[offset..offset + lanes]);

                bits |= ((_mm256_movemask_ps(kept) as u64) & lane_mask(lanes)) << block;

                if let MaskSink::Explicit(values) = &mut mask {
                    let base = row * layout.explicit_stride() + offset;
                    store_lanes(_mm256_and_ps(scale, kept), &mut values[base..base + lanes]);
                }
            }

            if let MaskSink::Bits(bytes) = &mut mask {
                let stride = layout.bitmask_stride_bytes();
                codec.store(&mut bytes[row * stride..][..stride], chunk, bits);
            }
        }
    }
}

#[target_feature(enable = "avx2")]
unsafe fn backward_rows_avx2<Tin: Element, Tout: Element, Tm: Element>(
    job: BackwardJob<'_, Tin, Tout>,
    mask: MaskSource<'_, Tm>,
) {
    let BackwardJob {
        layout,
        codec,
        row_count,
        input_stride,
        output_stride,
        input,
        output,
        probability,
    } = job;
    let width = layout.chunk_width;
    let scale = _mm256_set1_ps(probability.scale);
    let lane_bits = _mm256_setr_epi32(1, 2, 4, 8, 16, 32, 64, 128);
    let zero = _mm256_setzero_ps();

    for row in 0..row_count {
        let in_row = &input[row * input_stride..][..layout.row_width];
        let out_row = &mut output[row * output_stride..][..layout.row_width];

        for chunk in 0..layout.chunks_per_row {
            let start = chunk * width;
            let valid = layout.valid_lanes(chunk);
            let bits = match mask {
                MaskSource::Bits(bytes) => {
                    let stride = layout.bitmask_stride_bytes();
                    codec.load(&bytes[row * stride..][..stride], chunk)
                }
                MaskSource::Explicit(_) => 0,
            };

            for block in (0..valid).step_by(LANES) {
                let lanes = (valid - block).min(LANES);
                let offset = start + block;
                let x = load_lanes(&in_row[offset..offset + lanes]);

                let y = match mask {
                    MaskSource::Bits(_) => {
                        // Broadcast this block's byte and test one bit per lane.
                        let byte = _mm256_set1_epi32(((bits >> block) & 0xFF) as i32);
                        let kept = _mm256_cmpeq_epi32(_mm256_and_si256(byte, lane_bits), lane_bits);
                        _mm256_and_ps(_mm256_mul_ps(x, scale), _mm256_castsi256_ps(kept))
                    }
                    MaskSource::Explicit(values) => {
                        let base = row * layout.explicit_stride() + offset;
                        let m = load_lanes(&values[base..base + lanes]);
                        // Unordered so a NaN entry multiplies like the scalar `!=` does.
                        let nonzero = _mm256_cmp_ps::<_CMP_NEQ_UQ>(m, zero);
                        _mm256_and_ps(_mm256_mul_ps(x, m), nonzero)
                    }
                };
                store_lanes(y, &mut out_row[offset..offset + lanes]);
            }
        }
    }
}

/// Load up to 8 elements widened to f32; missing lanes read as zero.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn load_lanes<T: Element>(src: &[T]) -> __m256 {
    if src.len() == LANES {
        return load8(src.as_ptr());
    }
    let mut tmp = [T::ZERO; LANES];
    tmp[..src.len()].copy_from_slice(src);
    load8(tmp.as_ptr())
}

/// Store the first `dst.len()` lanes of `v`, narrowing if needed.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn store_lanes<T: Element>(v: __m256, dst: &mut [T]) {
    if dst.len() == LANES {
        store8(v, dst.as_mut_ptr());
        return;
    }
    let mut tmp = [T::ZERO; LANES];
    store8(v, tmp.as_mut_ptr());
    let n = dst.len();
    dst.copy_from_slice(&tmp[..n]);
}

/// `src` must point at 8 readable elements. `Element` is sealed to f32 and
/// bf16, so the `DATA_TYPE` tag fixes the in-memory representation.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn load8<T: Element>(src: *const T) -> __m256 {
    match T::DATA_TYPE {
        DataType::F32 => _mm256_loadu_ps(src.cast::<f32>()),
        DataType::BF16 => {
            let raw = _mm_loadu_si128(src.cast::<__m128i>());
            _mm256_castsi256_ps(_mm256_slli_epi32::<16>(_mm256_cvtepu16_epi32(raw)))
        }
    }
}

/// `dst` must point at 8 writable elements.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn store8<T: Element>(v: __m256, dst: *mut T) {
    match T::DATA_TYPE {
        DataType::F32 => _mm256_storeu_ps(dst.cast::<f32>(), v),
        DataType::BF16 => _mm_storeu_si128(dst.cast::<__m128i>(), narrow8(v)),
    }
}

/// Eight f32 lanes to eight bf16, round-to-nearest-even, NaN quieted.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn narrow8(v: __m256) -> __m128i {
    let bits = _mm256_castps_si256(v);
    let upper = _mm256_srli_epi32::<16>(bits);
    let lsb = _mm256_and_si256(upper, _mm256_set1_epi32(1));
    let bias = _mm256_add_epi32(lsb, _mm256_set1_epi32(0x7FFF));
    let rounded = _mm256_srli_epi32::<16>(_mm256_add_epi32(bits, bias));
    let quiet = _mm256_or_si256(upper, _mm256_set1_epi32(0x0040));
    let nan = _mm256_castps_si256(_mm256_cmp_ps::<_CMP_UNORD_Q>(v, v));
    let halves = _mm256_blendv_epi8(rounded, quiet, nan);
    // packus works per 128-bit lane; gather the two useful quadwords.
    let packed = _mm256_packus_epi32(halves, halves);
    _mm256_castsi256_si128(_mm256_permute4x64_epi64::<0b11_01_10_00>(packed))
}
