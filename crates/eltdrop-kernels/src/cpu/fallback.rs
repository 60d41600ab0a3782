//! Fallback CPU kernel implementation
//!
//! Straight-line scalar loops over rows, chunks and lanes. Works for every
//! chunk width in `1..=64` on every architecture and is the reference the
//! SIMD kernels are checked against.

use super::{BackwardJob, ForwardJob, MaskSink, MaskSource, RowKernel, run_backward, run_forward};
use crate::DropoutKernel;
use crate::bitmask::is_kept;
use crate::buffer::{Buffer, BufferMut, MaskIn, MaskOut};
use crate::precision::Element;
use crate::rng::UniformStream;
use eltdrop_common::{DropoutDescriptor, MAX_CHUNK_WIDTH, Result};

/// Fallback CPU kernel that works on any architecture
///
/// Always available. Each lane is widened to f32, scaled, and narrowed once
/// at the store.
pub struct FallbackKernel;

impl DropoutKernel for FallbackKernel {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn is_available(&self) -> bool {
        true
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
        run_backward(self, desc, input, output, mask, p)
    }
}

impl RowKernel for FallbackKernel {
    fn forward_rows<Tin: Element, Tout: Element>(
        &self,
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
        let mut draws = [0.0f32; MAX_CHUNK_WIDTH];
        let mut kept = [false; MAX_CHUNK_WIDTH];

        for row in 0..row_count {
            let in_row = &input[row * input_stride..][..layout.row_width];
            let out_row = &mut output[row * output_stride..][..layout.row_width];

            for chunk in 0..layout.chunks_per_row {
                // A full chunk of draws even when only part of it is in the row.
                rng.next_chunk(&mut draws[..width]);
                let start = chunk * width;
                let lanes = layout.valid_lanes(chunk);

                for lane in 0..lanes {
                    let keep = draws[lane] < probability.keep;
                    kept[lane] = keep;
                    out_row[start + lane] = if keep {
                        Tout::from_f32(in_row[start + lane].to_f32() * multiplier)
                    } else {
                        Tout::ZERO
                    };
                }

                match &mut mask {
                    MaskSink::None => {}
                    MaskSink::Explicit(values) => {
                        let base = row * layout.explicit_stride() + start;
                        for (value, &keep) in values[base..base + lanes].iter_mut().zip(&kept) {
                            *value = if keep { Tout::from_f32(multiplier) } else { Tout::ZERO };
                        }
                    }
                    MaskSink::Bits(bytes) => {
                        let stride = layout.bitmask_stride_bytes();
                        let bits = codec.pack(&kept[..lanes]);
                        codec.store(&mut bytes[row * stride..][..stride], chunk, bits);
                    }
                }
            }
        }
    }

    fn backward_rows<Tin: Element, Tout: Element, Tm: Element>(
        &self,
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

        for row in 0..row_count {
            let in_row = &input[row * input_stride..][..layout.row_width];
            let out_row = &mut output[row * output_stride..][..layout.row_width];

            for chunk in 0..layout.chunks_per_row {
                let start = chunk * width;
                let lanes = layout.valid_lanes(chunk);
                let ins = &in_row[start..start + lanes];
                let outs = &mut out_row[start..start + lanes];

                match mask {
                    MaskSource::Bits(bytes) => {
                        let stride = layout.bitmask_stride_bytes();
                        let bits = codec.load(&bytes[row * stride..][..stride], chunk);
                        for (lane, (out, x)) in outs.iter_mut().zip(ins).enumerate() {
                            *out = if is_kept(bits, lane) {
                                Tout::from_f32(x.to_f32() * probability.scale)
                            } else {
                                Tout::ZERO
                            };
                        }
                    }
                    MaskSource::Explicit(values) => {
                        let base = row * layout.explicit_stride() + start;
                        for ((out, x), m) in outs.iter_mut().zip(ins).zip(&values[base..base + lanes])
                        {
                            let m = m.to_f32();
                            // A zero entry is a drop: +0.0 whatever the input holds.
                            *out = if m != 0.0 { Tout::from_f32(x.to_f32() * m) } else { Tout::ZERO };
                        }
                    }
                }
            }
        }
    }
}
