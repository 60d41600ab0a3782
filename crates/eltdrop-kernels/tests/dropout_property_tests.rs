//! Property tests for `eltdrop-kernels`.
//!
//! 1. **Determinism** – identical seeds give identical outputs and masks.
//! 2. **Mask codec** – `unpack(pack(x)) == x` for every chunk width.
//! 3. **Forward/backward consistency** – backward with the forward mask
//!    reproduces the forward output bit for bit.
//! 4. **Zeroing** – dropped elements are exactly `+0.0`.
//! 5. **Draw accounting** – a forward pass consumes `rows * chunks * W` draws.
//! 6. **Provider parity** – every available provider matches the fallback.
//! 7. **Narrowing** – `narrow` agrees with `half` on finite values.

use eltdrop_common::{DataType, DropoutDescriptor, DropoutShape, MaskMode, ceil_div};
use eltdrop_kernels::{
    BitMaskCodec, Buffer, BufferMut, DropoutKernel, DropoutValidator, FallbackKernel,
    KernelManager, MaskIn, MaskOut, RngStream, narrow, widen,
};
use half::bf16;
use proptest::prelude::*;

fn data_type() -> impl Strategy<Value = DataType> {
    prop_oneof![Just(DataType::F32), Just(DataType::BF16)]
}

/// Shape with strides at or above the row width.
fn shape() -> impl Strategy<Value = DropoutShape> {
    (1usize..70, 1usize..5, 0usize..9, 0usize..9).prop_map(|(width, rows, pad_in, pad_out)| {
        DropoutShape::new(width, rows, width + pad_in, width + pad_out)
    })
}

fn input_values(len: usize, seed: u64) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2_654_435_761).wrapping_add(seed) % 2001) as f32 * 0.01 - 10.0)
        .collect()
}

/// Owned output of either representation, compared bitwise.
enum Out {
    F32(Vec<f32>),
    BF16(Vec<bf16>),
}

impl Out {
    fn new(data_type: DataType, len: usize) -> Self {
        match data_type {
            DataType::F32 => Out::F32(vec![123.0; len]),
            DataType::BF16 => Out::BF16(vec![narrow(123.0); len]),
        }
    }

    fn as_mut(&mut self) -> BufferMut<'_> {
        match self {
            Out::F32(v) => BufferMut::F32(v),
            Out::BF16(v) => BufferMut::BF16(v),
        }
    }

    fn as_ref(&self) -> Buffer<'_> {
        match self {
            Out::F32(v) => Buffer::F32(v),
            Out::BF16(v) => Buffer::BF16(v),
        }
    }

    fn bits(&self) -> Vec<u32> {
        match self {
            Out::F32(v) => v.iter().map(|x| x.to_bits()).collect(),
            Out::BF16(v) => v.iter().map(|x| u32::from(x.to_bits())).collect(),
        }
    }
}

fn run_forward(
    desc: &DropoutDescriptor,
    input: Buffer<'_>,
    seed: u64,
    p: f32,
) -> (Out, Vec<u8>, u64) {
    let mut output = Out::new(desc.output_type, desc.shape.required_output_len());
    let mut mask = vec![0u8; desc.mask_layout().bitmask_len(desc.shape.row_count)];
    let mut rng = RngStream::new(seed);
    FallbackKernel
        .forward(desc, input, output.as_mut(), MaskOut::Bits(&mut mask), &mut rng, p)
        .unwrap();
    (output, mask, rng.draws())
}

proptest! {
    #[test]
    fn prop_forward_is_deterministic(
        shape in shape(),
        in_type in data_type(),
        out_type in data_type(),
        chunk_width in 1usize..=64,
        seed in any::<u64>(),
        p in 0.0f32..0.99,
    ) {
        let desc = DropoutDescriptor::forward(shape, in_type, out_type, MaskMode::Bitmask)
            .with_chunk_width(chunk_width);
        let raw = input_values(shape.required_input_len(), seed);
        let raw_bf16: Vec<bf16> = raw.iter().map(|&v| narrow(v)).collect();
        let input: Buffer<'_> = match in_type {
            DataType::F32 => (&raw).into(),
            DataType::BF16 => (&raw_bf16).into(),
        };

        let (a, mask_a, draws_a) = run_forward(&desc, input, seed, p);
        let (b, mask_b, draws_b) = run_forward(&desc, input, seed, p);
        prop_assert_eq!(a.bits(), b.bits());
        prop_assert_eq!(mask_a, mask_b);
        prop_assert_eq!(draws_a, draws_b);

        let expected_draws = shape.row_count * ceil_div(shape.row_width, chunk_width) * chunk_width;
        prop_assert_eq!(draws_a, expected_draws as u64);
    }

    #[test]
    fn prop_mask_codec_round_trip(
        chunk_width in 1usize..=64,
        bits in any::<u64>(),
    ) {
        let codec = BitMaskCodec::new(chunk_width).unwrap();
        let lanes = codec.unpack(bits);
        prop_assert_eq!(lanes.len(), chunk_width);
        prop_assert_eq!(codec.unpack(codec.pack(&lanes)), lanes.clone());

        let mut row = vec![0u8; 3 * codec.chunk_bytes()];
        codec.store(&mut row, 1, codec.pack(&lanes));
        prop_assert_eq!(codec.unpack(codec.load(&row, 1)), lanes);
        prop_assert_eq!(codec.load(&row, 0), 0);
        prop_assert_eq!(codec.load(&row, 2), 0);
    }

    #[test]
    fn prop_backward_reproduces_forward_bitmask(
        shape in shape(),
        in_type in data_type(),
        out_type in data_type(),
        chunk_width in prop_oneof![Just(8usize), Just(16), Just(21), Just(32), Just(64)],
        seed in any::<u64>(),
        p in 0.0f32..0.95,
    ) {
        let fwd = DropoutDescriptor::forward(shape, in_type, out_type, MaskMode::Bitmask)
            .with_chunk_width(chunk_width);
        let raw = input_values(shape.required_input_len(), seed);
        let raw_bf16: Vec<bf16> = raw.iter().map(|&v| narrow(v)).collect();
        let input: Buffer<'_> = match in_type {
            DataType::F32 => (&raw).into(),
            DataType::BF16 => (&raw_bf16).into(),
        };

        let manager = KernelManager::new();
        let (forward_out, mask, _) = run_forward(&fwd, input, seed, p);
        let mut backward_out = Out::new(out_type, shape.required_output_len());
        manager
            .dispatch(&fwd.to_backward())
            .unwrap()
            .backward(input, backward_out.as_mut(), MaskIn::Bits(&mask), p)
            .unwrap();
        prop_assert_eq!(forward_out.bits(), backward_out.bits());
    }

    #[test]
    fn prop_backward_reproduces_forward_explicit(
        shape in shape(),
        in_type in data_type(),
        out_type in data_type(),
        seed in any::<u64>(),
        p in 0.0f32..0.95,
    ) {
        // A bf16 mask holds the rounded scale; kept outputs use the same factor.
        let fwd = DropoutDescriptor::forward(shape, in_type, out_type, MaskMode::Explicit);
        let raw = input_values(shape.required_input_len(), seed);
        let raw_bf16: Vec<bf16> = raw.iter().map(|&v| narrow(v)).collect();
        let input: Buffer<'_> = match in_type {
            DataType::F32 => (&raw).into(),
            DataType::BF16 => (&raw_bf16).into(),
        };
        let layout = fwd.mask_layout();
        let manager = KernelManager::new();

        let mut forward_out = Out::new(out_type, shape.required_output_len());
        let mut mask = Out::new(out_type, layout.explicit_len(shape.row_count));
        manager
            .dispatch(&fwd)
            .unwrap()
            .forward(
                input,
                forward_out.as_mut(),
                MaskOut::Explicit(mask.as_mut()),
                &mut RngStream::new(seed),
                p,
            )
            .unwrap();

        let mut backward_out = Out::new(out_type, shape.required_output_len());
        manager
            .dispatch(&fwd.to_backward())
            .unwrap()
            .backward(input, backward_out.as_mut(), MaskIn::Explicit(mask.as_ref()), p)
            .unwrap();

        prop_assert_eq!(forward_out.bits(), backward_out.bits());
    }

    #[test]
    fn prop_dropped_elements_are_positive_zero(
        shape in shape(),
        out_type in data_type(),
        seed in any::<u64>(),
        p in 0.05f32..0.95,
    ) {
        let desc = DropoutDescriptor::forward(shape, DataType::F32, out_type, MaskMode::Bitmask);
        // Negative and non-finite inputs must still drop to +0.0.
        let mut raw = input_values(shape.required_input_len(), seed);
        for (i, v) in raw.iter_mut().enumerate() {
            match i % 5 {
                0 => *v = -v.abs() - 1.0,
                1 => *v = f32::NEG_INFINITY,
                2 => *v = f32::NAN,
                _ => {}
            }
        }
        let (output, mask, _) = run_forward(&desc, (&raw).into(), seed, p);
        let layout = desc.mask_layout();
        let bits = output.bits();

        for row in 0..shape.row_count {
            for col in 0..shape.row_width {
                let chunk = col / layout.chunk_width;
                let lane = col % layout.chunk_width;
                let byte = mask[row * layout.bitmask_stride_bytes()
                    + chunk * layout.chunk_bytes
                    + lane / 8];
                if (byte >> (lane % 8)) & 1 == 0 {
                    prop_assert_eq!(bits[row * shape.output_stride + col], 0);
                }
            }
        }
    }

    #[test]
    fn prop_providers_match_fallback(
        shape in shape(),
        in_type in data_type(),
        out_type in data_type(),
        mask_mode in prop_oneof![Just(MaskMode::None), Just(MaskMode::Explicit), Just(MaskMode::Bitmask)],
        chunk_width in prop_oneof![Just(8usize), Just(16), Just(32), Just(64)],
        seed in any::<u64>(),
        p in 0.0f32..0.95,
    ) {
        let manager = KernelManager::new();
        let desc = DropoutDescriptor::forward(shape, in_type, out_type, mask_mode)
            .with_chunk_width(chunk_width);
        let candidate = manager.select_for(chunk_width).unwrap();
        let report = DropoutValidator::against_fallback(candidate)
            .with_seed(seed)
            .validate(&desc, p)
            .unwrap();
        prop_assert!(report.passed, "{} failed: {:?}", candidate.name(), report);

        if mask_mode != MaskMode::None {
            let report = DropoutValidator::against_fallback(candidate)
                .with_seed(seed)
                .validate(&desc.to_backward(), p)
                .unwrap();
            prop_assert!(report.passed, "{} backward failed: {:?}", candidate.name(), report);
        }
    }

    #[test]
    fn prop_narrow_matches_half_on_finite(bits in any::<u32>()) {
        let x = f32::from_bits(bits);
        prop_assume!(x.is_finite());
        prop_assert_eq!(narrow(x).to_bits(), bf16::from_f32(x).to_bits());
        prop_assert_eq!(widen(narrow(x)).to_bits() & 0xFFFF, 0);
    }
}
