//! Edge-case tests for the dispatched dropout transforms.
//!
//! Covers the known-draws scenario, tail chunks with padded strides, scale
//! and zeroing behaviour in every representation pair, refused calls, and
//! environment-driven kernel selection.

use eltdrop_common::{
    DataType, DropoutDescriptor, DropoutShape, EltDropError, KernelConfig, KernelError,
    KernelPreference, MaskMode,
};
use eltdrop_kernels::{
    Buffer, BufferMut, DropoutKernel, FallbackKernel, KernelManager, MaskIn, MaskOut, ReplayStream,
    RngStream, narrow, widen,
};
use half::bf16;
use serial_test::serial;

fn scale_for(p: f32) -> f32 {
    (1.0 / f64::from(1.0 - p)) as f32
}

// ---------------------------------------------------------------------------
// Known draws
// ---------------------------------------------------------------------------

#[test]
fn known_draws_produce_expected_pattern() {
    let shape = DropoutShape::dense(8, 1);
    let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::Bitmask)
        .with_chunk_width(8);
    let manager = KernelManager::new();
    let dropout = manager.dispatch(&desc).unwrap();

    let input: Vec<f32> = (1..=8).map(|v| v as f32).collect();
    let mut output = vec![0.0f32; 8];
    let mut mask = vec![0u8; 1];
    let mut rng = ReplayStream::new(vec![0.1, 0.9, 0.5, 0.05, 0.99, 0.3, 0.6, 0.75]).unwrap();
    dropout
        .forward((&input).into(), (&mut output).into(), MaskOut::Bits(&mut mask), &mut rng, 0.3)
        .unwrap();

    let kept = [true, false, true, true, false, true, true, false];
    assert_eq!(mask, vec![0b0110_1101]);
    for ((&out, &x), &k) in output.iter().zip(&input).zip(&kept) {
        let expected = if k { x * scale_for(0.3) } else { 0.0 };
        assert_eq!(out.to_bits(), expected.to_bits());
        if k {
            assert!((out - x / 0.7).abs() <= 1e-5 * x);
        }
    }
    assert_eq!(rng.position(), 8);
}

#[test]
fn draw_equal_to_keep_threshold_is_dropped() {
    let shape = DropoutShape::dense(2, 1);
    let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::Bitmask)
        .with_chunk_width(2);
    let input = vec![1.0f32, 1.0];
    let mut output = vec![9.0f32; 2];
    let mut mask = vec![0u8; 1];
    let mut rng = ReplayStream::new(vec![0.5, 0.499_999_97]).unwrap();
    FallbackKernel
        .forward(&desc, (&input).into(), (&mut output).into(), MaskOut::Bits(&mut mask), &mut rng, 0.5)
        .unwrap();
    assert_eq!(mask, vec![0b10]);
    assert_eq!(output, vec![0.0, 2.0]);
}

// ---------------------------------------------------------------------------
// Tail handling
// ---------------------------------------------------------------------------

#[test]
fn tail_chunk_leaves_padding_untouched() {
    // 21 lanes at chunk width 16: one full chunk and five tail lanes per row.
    let shape = DropoutShape::new(21, 3, 24, 32);
    let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::Bitmask);
    let manager = KernelManager::new();
    let dropout = manager.dispatch(&desc).unwrap();

    let input: Vec<f32> = (0..shape.required_input_len()).map(|i| i as f32 + 1.0).collect();
    let mut output = vec![f32::MAX; 3 * 32];
    let layout = dropout.mask_layout();
    assert_eq!(layout.bitmask_stride_bytes(), 4);
    let mut mask = vec![0u8; layout.bitmask_len(3)];
    let mut rng = RngStream::new(555);
    dropout
        .forward((&input).into(), (&mut output).into(), MaskOut::Bits(&mut mask), &mut rng, 0.2)
        .unwrap();

    for row in 0..3 {
        for col in 21..32 {
            assert_eq!(output[row * 32 + col], f32::MAX, "row {row} col {col} was written");
        }
        for col in 0..21 {
            assert_ne!(output[row * 32 + col], f32::MAX);
        }
        // Lanes 5..16 of the tail chunk are not part of the row.
        let tail = u16::from_le_bytes([mask[row * 4 + 2], mask[row * 4 + 3]]);
        assert_eq!(tail & !0x1F, 0);
    }
    // Full chunks are drawn, tails included.
    assert_eq!(rng.draws(), 3 * 32);
}

#[test]
fn tail_backward_leaves_padding_untouched() {
    let shape = DropoutShape::new(21, 2, 21, 30);
    let desc = DropoutDescriptor::backward(shape, DataType::BF16, DataType::BF16, MaskMode::Bitmask);
    let input = vec![narrow(3.0); shape.required_input_len()];
    let mask = vec![0xFFu8; desc.mask_layout().bitmask_len(2)];
    let sentinel = narrow(-1.0);
    let mut output = vec![sentinel; 60];
    FallbackKernel
        .backward(&desc, (&input).into(), (&mut output).into(), MaskIn::Bits(&mask), 0.5)
        .unwrap();
    for row in 0..2 {
        for col in 0..30 {
            let expected = if col < 21 { narrow(6.0) } else { sentinel };
            assert_eq!(output[row * 30 + col], expected);
        }
    }
}

#[test]
fn empty_shapes_are_no_ops() {
    let manager = KernelManager::new();
    for shape in [DropoutShape::new(0, 4, 8, 8), DropoutShape::new(8, 0, 8, 8)] {
        let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::Bitmask);
        let dropout = manager.dispatch(&desc).unwrap();
        let mut rng = RngStream::new(1);
        let mut output: Vec<f32> = Vec::new();
        let mut mask: Vec<u8> = Vec::new();
        dropout
            .forward(Buffer::F32(&[]), (&mut output).into(), MaskOut::Bits(&mut mask), &mut rng, 0.5)
            .unwrap();
        assert_eq!(rng.draws(), 0);
    }
}

// ---------------------------------------------------------------------------
// Scale and zeroing across representations
// ---------------------------------------------------------------------------

#[test]
fn kept_values_scaled_with_single_rounding() {
    let p = 0.1f32;
    let shape = DropoutShape::dense(16, 4);
    let raw: Vec<f32> = (0..64).map(|i| (i as f32 - 31.5) * 0.37).collect();
    let raw_bf16: Vec<bf16> = raw.iter().map(|&v| narrow(v)).collect();

    for (in_type, out_type) in [
        (DataType::F32, DataType::F32),
        (DataType::F32, DataType::BF16),
        (DataType::BF16, DataType::F32),
        (DataType::BF16, DataType::BF16),
    ] {
        let desc = DropoutDescriptor::forward(shape, in_type, out_type, MaskMode::Bitmask);
        let input: Buffer<'_> = match in_type {
            DataType::F32 => (&raw).into(),
            DataType::BF16 => (&raw_bf16).into(),
        };
        let mut out_f32 = vec![0.0f32; 64];
        let mut out_bf16 = vec![bf16::ZERO; 64];
        let output: BufferMut<'_> = match out_type {
            DataType::F32 => (&mut out_f32).into(),
            DataType::BF16 => (&mut out_bf16).into(),
        };
        let mut mask = vec![0u8; desc.mask_layout().bitmask_len(4)];
        FallbackKernel
            .forward(&desc, input, output, MaskOut::Bits(&mut mask), &mut RngStream::new(42), p)
            .unwrap();

        for i in 0..64 {
            let x = match in_type {
                DataType::F32 => raw[i],
                DataType::BF16 => widen(raw_bf16[i]),
            };
            let kept = (mask[(i / 16) * 2 + (i % 16) / 8] >> (i % 8)) & 1 == 1;
            let exact = x * scale_for(p);
            let got = match out_type {
                DataType::F32 => out_f32[i],
                DataType::BF16 => widen(out_bf16[i]),
            };
            if !kept {
                assert_eq!(got.to_bits(), 0, "dropped element {i} is not +0.0");
            } else if out_type == DataType::BF16 {
                assert_eq!(got.to_bits(), widen(narrow(exact)).to_bits());
            } else {
                assert_eq!(got.to_bits(), exact.to_bits());
            }
        }
    }
}

#[test]
fn explicit_mask_holds_scale_or_zero() {
    let p = 0.25f32;
    let shape = DropoutShape::dense(20, 2);
    let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::BF16, MaskMode::Explicit)
        .with_chunk_width(8);
    let layout = desc.mask_layout();
    assert_eq!(layout.explicit_stride(), 24);

    let input = vec![-2.0f32; 40];
    let mut output = vec![bf16::ONE; 40];
    let mut mask = vec![bf16::NAN; layout.explicit_len(2)];
    FallbackKernel
        .forward(
            &desc,
            (&input).into(),
            (&mut output).into(),
            MaskOut::Explicit((&mut mask).into()),
            &mut RngStream::new(5),
            p,
        )
        .unwrap();

    for row in 0..2 {
        for col in 0..20 {
            let m = mask[row * 24 + col];
            let out = output[row * 20 + col];
            if m == bf16::ZERO {
                assert_eq!(out.to_bits(), 0);
            } else {
                assert_eq!(m, narrow(scale_for(p)));
                assert_eq!(out, narrow(-2.0 * widen(m)));
            }
        }
    }
    // Chunk padding between rows is not part of any row.
    assert!(mask[20..24].iter().all(|m| m.is_nan()));
}

#[test]
fn forward_backward_reproduce_output_bf16_explicit() {
    // The bf16 mask entry is a rounded scale; kept outputs must use that same
    // rounded factor or the backward replay drifts by one ulp on some lanes.
    let p = 0.3f32;
    let shape = DropoutShape::dense(256, 1);
    let fwd = DropoutDescriptor::forward(shape, DataType::F32, DataType::BF16, MaskMode::Explicit);
    let bwd = fwd.to_backward();
    let input: Vec<f32> = (0..256).map(|i| (i as f32 - 128.0) * 0.173).collect();

    for kernel in KernelManager::new().list_available_providers() {
        let config = KernelConfig {
            preferred_kernel: kernel.parse::<KernelPreference>().unwrap(),
            ..KernelConfig::default()
        };
        let manager = KernelManager::with_config(&config);
        let forward = manager.dispatch(&fwd).unwrap();
        let backward = manager.dispatch(&bwd).unwrap();

        let mut out_fwd = vec![bf16::ZERO; 256];
        let mut out_bwd = vec![bf16::ZERO; 256];
        let mut mask = vec![bf16::ZERO; forward.mask_layout().explicit_len(1)];
        forward
            .forward(
                (&input).into(),
                (&mut out_fwd).into(),
                MaskOut::Explicit((&mut mask).into()),
                &mut RngStream::new(555),
                p,
            )
            .unwrap();
        backward
            .backward((&input).into(), (&mut out_bwd).into(), MaskIn::Explicit((&mask).into()), p)
            .unwrap();

        let a: Vec<u16> = out_fwd.iter().map(|v| v.to_bits()).collect();
        let b: Vec<u16> = out_bwd.iter().map(|v| v.to_bits()).collect();
        assert_eq!(a, b, "{kernel} forward and backward disagree");
        assert!(mask.iter().any(|&m| m == narrow(scale_for(p))));
    }
}

#[test]
fn forward_backward_reproduce_output_bitmask() {
    let p = 0.37f32;
    let shape = DropoutShape::new(45, 3, 48, 50);
    let fwd = DropoutDescriptor::forward(shape, DataType::BF16, DataType::BF16, MaskMode::Bitmask);
    let manager = KernelManager::new();
    let forward = manager.dispatch(&fwd).unwrap();
    let backward = manager.dispatch(&fwd.to_backward()).unwrap();

    let input: Vec<bf16> =
        (0..shape.required_input_len()).map(|i| narrow((i % 97) as f32 - 48.0)).collect();
    let mut out_fwd = vec![bf16::ZERO; shape.required_output_len()];
    let mut out_bwd = vec![bf16::ZERO; shape.required_output_len()];
    let mut mask = vec![0u8; forward.mask_layout().bitmask_len(3)];

    forward
        .forward((&input).into(), (&mut out_fwd).into(), MaskOut::Bits(&mut mask), &mut RngStream::new(8), p)
        .unwrap();
    backward.backward((&input).into(), (&mut out_bwd).into(), MaskIn::Bits(&mask), p).unwrap();

    let a: Vec<u16> = out_fwd.iter().map(|v| v.to_bits()).collect();
    let b: Vec<u16> = out_bwd.iter().map(|v| v.to_bits()).collect();
    assert_eq!(a, b);
}

// ---------------------------------------------------------------------------
// Refused calls
// ---------------------------------------------------------------------------

#[test]
fn stride_violation_refused_without_writes() {
    let shape = DropoutShape::new(21, 2, 21, 16);
    let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::None);
    let input = vec![1.0f32; 42];
    let mut output = vec![5.0f32; 64];
    let mut rng = RngStream::new(0);
    let err = FallbackKernel
        .forward(&desc, (&input).into(), (&mut output).into(), MaskOut::None, &mut rng, 0.5)
        .unwrap_err();
    assert!(matches!(err, EltDropError::Kernel(KernelError::PreconditionViolation { .. })));
    assert!(err.to_string().contains("output_stride"));
    assert!(output.iter().all(|&v| v == 5.0));
    assert_eq!(rng.draws(), 0);
}

#[test]
fn overflowing_extent_refused() {
    let shape = DropoutShape::new(1, usize::MAX, usize::MAX, usize::MAX);
    let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::None);
    let input = vec![1.0f32; 4];
    let mut output = vec![5.0f32; 4];
    let err = FallbackKernel
        .forward(&desc, (&input).into(), (&mut output).into(), MaskOut::None, &mut RngStream::new(0), 0.5)
        .unwrap_err();
    assert!(matches!(err, EltDropError::Kernel(KernelError::PreconditionViolation { .. })));
    assert!(output.iter().all(|&v| v == 5.0));

    // Data extents fit, but the 128-wide explicit mask stride does not.
    let rows = usize::MAX / 100;
    let shape = DropoutShape::new(65, rows, 65, 65);
    let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::Explicit)
        .with_chunk_width(64);
    assert!(shape.validate().is_ok());
    let err = desc.validate().unwrap_err();
    assert!(matches!(err, EltDropError::Kernel(KernelError::PreconditionViolation { .. })));
}

#[test]
fn short_input_refused() {
    let shape = DropoutShape::new(8, 2, 10, 8);
    let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::None);
    let input = vec![1.0f32; 17];
    let mut output = vec![5.0f32; 16];
    let err = FallbackKernel
        .forward(&desc, (&input).into(), (&mut output).into(), MaskOut::None, &mut RngStream::new(0), 0.5)
        .unwrap_err();
    assert!(err.to_string().contains("input buffer too small"));
}

#[test]
fn explicit_forward_mask_must_match_output_type() {
    let shape = DropoutShape::dense(8, 1);
    let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::Explicit);
    let input = vec![1.0f32; 8];
    let mut output = vec![5.0f32; 8];
    let mut mask = vec![bf16::ZERO; 8];
    let err = FallbackKernel
        .forward(
            &desc,
            (&input).into(),
            (&mut output).into(),
            MaskOut::Explicit((&mut mask).into()),
            &mut RngStream::new(0),
            0.5,
        )
        .unwrap_err();
    assert!(matches!(err, EltDropError::Kernel(KernelError::PreconditionViolation { .. })));
    assert!(output.iter().all(|&v| v == 5.0));
}

// ---------------------------------------------------------------------------
// Environment-driven selection
// ---------------------------------------------------------------------------

#[test]
#[serial(eltdrop_env)]
fn env_forces_fallback_kernel() {
    temp_env::with_vars(
        [
            ("ELTDROP_KERNEL", Some("fallback")),
            ("ELTDROP_CHUNK_WIDTH", Some("32")),
            ("ELTDROP_SEED", None),
        ],
        || {
            let config = KernelConfig::from_env().unwrap();
            let manager = KernelManager::with_config(&config);
            assert_eq!(manager.select_best().unwrap().name(), "fallback");
            assert_eq!(manager.selected_provider_name(), Some("fallback"));
        },
    );
}

#[test]
#[serial(eltdrop_env)]
fn env_seed_feeds_stream() {
    temp_env::with_vars(
        [("ELTDROP_SEED", Some("1234")), ("ELTDROP_KERNEL", None), ("ELTDROP_CHUNK_WIDTH", None)],
        || {
            let config = KernelConfig::from_env().unwrap();
            assert_eq!(RngStream::from_config(&config).seed(), 1234);
        },
    );
}
